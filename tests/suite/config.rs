//! Configuration file loading and resolution, then a task run from the result

use std::collections::HashMap;
use std::sync::Arc;

use drover_engine::drover_types::{CreativeMode, ModelId};
use drover_engine::{
    ConfigError, DiscardTranscript, DroverConfig, InferenceClient, LoopState, NoEnvironment,
    SessionConfig, TaskSession, ToolLoop, ToolRegistry,
};

use crate::common::{TEST_API_KEY, mount_reply, request_bodies, start_inference_mock};

fn write_config(dir: &tempfile::TempDir, content: &str) -> std::path::PathBuf {
    let path = dir.path().join("config.toml");
    std::fs::write(&path, content).unwrap();
    path
}

#[test]
fn missing_file_is_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let loaded = DroverConfig::load_from(&dir.path().join("absent.toml")).unwrap();
    assert!(loaded.is_none());
}

#[test]
fn broken_toml_reports_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir, "[api\nbase_url = ");
    assert!(matches!(
        DroverConfig::load_from(&path),
        Err(ConfigError::Parse { .. })
    ));
}

#[test]
fn file_values_and_env_references_resolve() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        r#"
[api]
base_url = "https://inference.example.com"
key = "${TEAM_KEY}"
model = "claude-3-haiku-20240307"
creative_mode = "creative"

[loop]
max_turns = 7
max_concurrent_tools = 2

[prompt]
custom_instructions = "Prefer small diffs."
"#,
    );
    let env: HashMap<&str, &str> = HashMap::from([("TEAM_KEY", "from-env")]);
    let resolved = DroverConfig::load_from(&path)
        .unwrap()
        .unwrap()
        .resolve_with(|name| env.get(name).map(|v| (*v).to_string()))
        .unwrap();

    assert_eq!(resolved.client.api_key.expose_secret(), "from-env");
    assert_eq!(resolved.client.base_url.as_str(), "https://inference.example.com/");
    assert_eq!(resolved.model, ModelId::Claude3Haiku);
    assert_eq!(resolved.creative_mode, CreativeMode::Creative);
    assert_eq!(resolved.loop_settings.max_turns, 7);
    assert_eq!(resolved.loop_settings.max_concurrent_tools, 2);
    assert_eq!(
        resolved.custom_instructions.as_deref(),
        Some("Prefer small diffs.")
    );
}

#[tokio::test]
async fn resolved_config_drives_a_task() {
    let server = start_inference_mock().await;
    mount_reply(&server, "Configured and done.").await;

    let dir = tempfile::tempdir().unwrap();
    let path = write_config(
        &dir,
        &format!(
            "[api]\nbase_url = \"{}\"\nkey = \"{TEST_API_KEY}\"\n\n[prompt]\ncustom_instructions = \"Be brief.\"\n",
            server.uri()
        ),
    );
    let resolved = DroverConfig::load_from(&path)
        .unwrap()
        .unwrap()
        .resolve_with(|_| None)
        .unwrap();

    let lp = ToolLoop::new(
        InferenceClient::new(resolved.client).unwrap(),
        Arc::new(ToolRegistry::new()),
        Box::new(NoEnvironment),
        Box::new(DiscardTranscript),
        resolved.loop_settings,
    );
    let mut session = TaskSession::new(
        SessionConfig {
            model: resolved.model,
            creative_mode: resolved.creative_mode,
            system_prompt: "You are Drover.".to_string(),
            custom_instructions: resolved.custom_instructions,
        },
        "hello",
    );

    let outcome = lp.run(&mut session).await;
    assert_eq!(outcome.state, LoopState::Completed);

    let bodies = request_bodies(&server).await;
    assert_eq!(bodies[0]["system"][1]["text"], "Be brief.");
    assert_eq!(bodies[0]["system"][1]["cache_control"]["type"], "ephemeral");
}
