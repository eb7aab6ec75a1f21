//! End-to-end task runs: mock inference service, real built-in tools, and a
//! temporary workspace.

use std::sync::Arc;
use std::time::Duration;

use drover_engine::drover_providers::retry::RetryConfig;
use drover_engine::drover_types::Role;
use drover_engine::{
    ApiError, DiscardTranscript, InferenceClient, JsonTranscriptSink, LoopError, LoopSettings, LoopState, SessionConfig,
    StaticEnvironment, TaskSession, ToolLoop, ToolRegistry, TranscriptSink, register_builtins,
    render_system_prompt,
};
use tempfile::TempDir;
use wiremock::MockServer;

use crate::common::{
    client_for, display_record, error_record, mount_once, mount_reply, mount_status,
    request_bodies, start_inference_mock,
};

fn registry() -> Arc<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    register_builtins(&mut registry).unwrap();
    Arc::new(registry)
}

fn settings(workspace: &TempDir) -> LoopSettings {
    LoopSettings {
        working_dir: workspace.path().to_path_buf(),
        cleanup_grace: Duration::from_millis(200),
        retry: RetryConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            ..RetryConfig::default()
        },
        ..LoopSettings::default()
    }
}

fn session(registry: &ToolRegistry, task: &str) -> TaskSession {
    TaskSession::new(
        SessionConfig {
            system_prompt: render_system_prompt(registry),
            ..SessionConfig::default()
        },
        task,
    )
}

fn tool_loop(
    server: &MockServer,
    workspace: &TempDir,
    sink: Box<dyn TranscriptSink>,
) -> ToolLoop<InferenceClient> {
    ToolLoop::new(
        client_for(server),
        registry(),
        Box::new(StaticEnvironment(
            "<environment_details>test workspace</environment_details>".to_string(),
        )),
        sink,
        settings(workspace),
    )
}

#[tokio::test]
async fn writes_reads_and_answers() {
    let server = start_inference_mock().await;
    mount_reply(
        &server,
        "I'll create it.\n<write_to_file>\n<path>notes/hello.txt</path>\n<content>hi there</content>\n</write_to_file>",
    )
    .await;
    mount_reply(&server, "<read_file>\n<path>notes/hello.txt</path>\n</read_file>").await;
    mount_reply(&server, "The file says hi there.").await;

    let workspace = tempfile::tempdir().unwrap();
    let transcripts = tempfile::tempdir().unwrap();
    let lp = tool_loop(
        &server,
        &workspace,
        Box::new(JsonTranscriptSink::new(transcripts.path())),
    );
    let registry = registry();
    let mut session = session(&registry, "Create notes/hello.txt saying hi there");

    let outcome = lp.run(&mut session).await;
    assert_eq!(outcome.state, LoopState::Completed, "{:?}", outcome.error);
    assert_eq!(outcome.turns, 3);

    let written = std::fs::read_to_string(workspace.path().join("notes/hello.txt")).unwrap();
    assert_eq!(written, "hi there");

    let messages = session.messages();
    assert_eq!(messages.len(), 6);
    let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        [Role::User, Role::Assistant, Role::User, Role::Assistant, Role::User, Role::Assistant]
    );
    assert!(messages[2].text().contains("Wrote 8 bytes to notes/hello.txt"));
    assert!(messages[4].text().contains("status=\"success\">\nhi there\n</tool_result>"));
    assert_eq!(messages[5].text(), "The file says hi there.");

    let bodies = request_bodies(&server).await;
    assert_eq!(bodies.len(), 3);
    // Environment details lead the newest user turn on the wire only.
    let last_user = &bodies[2]["messages"][4]["content"];
    assert_eq!(last_user[0]["text"], "<environment_details>test workspace</environment_details>");
    assert!(
        bodies[2]["system"][0]["text"]
            .as_str()
            .unwrap()
            .contains("## write_to_file")
    );

    let saved = JsonTranscriptSink::new(transcripts.path())
        .load(session.id())
        .unwrap();
    assert_eq!(saved.state, LoopState::Completed);
    assert_eq!(saved.messages, session.messages());
}

#[tokio::test]
async fn escaping_path_is_reported_back_to_model() {
    let server = start_inference_mock().await;
    mount_reply(
        &server,
        "<write_to_file>\n<path>../outside.txt</path>\n<content>x</content>\n</write_to_file>",
    )
    .await;
    mount_reply(&server, "I cannot write there.").await;

    let workspace = tempfile::tempdir().unwrap();
    let lp = tool_loop(&server, &workspace, Box::new(DiscardTranscript));
    let registry = registry();
    let mut session = session(&registry, "write outside");

    let outcome = lp.run(&mut session).await;
    assert_eq!(outcome.state, LoopState::Completed);
    let results = session.messages()[2].text();
    assert!(results.contains("status=\"error\""));
    assert!(results.contains("outside the working directory"));
    assert!(!workspace.path().parent().unwrap().join("outside.txt").exists());
}

#[tokio::test]
async fn overloaded_stream_is_retried() {
    let server = start_inference_mock().await;
    let mut overloaded = display_record("Let me ");
    overloaded.push_str(&error_record(529, "Overloaded"));
    mount_once(&server, overloaded).await;
    mount_reply(&server, "Done on the second try.").await;

    let workspace = tempfile::tempdir().unwrap();
    let lp = tool_loop(&server, &workspace, Box::new(DiscardTranscript));
    let registry = registry();
    let mut session = session(&registry, "anything");

    let outcome = lp.run(&mut session).await;
    assert_eq!(outcome.state, LoopState::Completed);
    assert_eq!(request_bodies(&server).await.len(), 2);
    assert_eq!(session.messages().len(), 2);
    assert_eq!(session.messages()[1].text(), "Done on the second try.");
}

#[tokio::test]
async fn rejected_key_fails_the_task() {
    let server = start_inference_mock().await;
    mount_status(&server, 401, "invalid key").await;

    let workspace = tempfile::tempdir().unwrap();
    let lp = tool_loop(&server, &workspace, Box::new(DiscardTranscript));
    let registry = registry();
    let mut session = session(&registry, "anything");

    let outcome = lp.run(&mut session).await;
    assert_eq!(outcome.state, LoopState::Failed);
    assert!(matches!(
        outcome.error,
        Some(LoopError::Api(ApiError::Unauthorized))
    ));
    assert_eq!(request_bodies(&server).await.len(), 1);
    assert_eq!(session.messages().len(), 1);
}

#[tokio::test]
async fn abort_while_streaming_keeps_transcript() {
    let server = start_inference_mock().await;
    wiremock::Mock::given(wiremock::matchers::method("POST"))
        .respond_with(
            wiremock::ResponseTemplate::new(200)
                .set_body_string(display_record("thinking"))
                .insert_header("content-type", "text/event-stream")
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;

    let workspace = tempfile::tempdir().unwrap();
    let lp = tool_loop(&server, &workspace, Box::new(DiscardTranscript));
    let registry = registry();
    let mut session = session(&registry, "long task");
    let handle = session.abort_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.abort();
    });

    let outcome = tokio::time::timeout(Duration::from_secs(5), lp.run(&mut session))
        .await
        .expect("abort stops the loop");
    assert_eq!(outcome.state, LoopState::Aborted);
    assert_eq!(session.messages().len(), 1);
}
