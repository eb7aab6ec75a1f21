//! Transcript healing and request building through the public API

use drover_engine::drover_providers::{PromptInput, build_request};
use drover_engine::drover_types::{
    CacheControl, ContentBlock, ConversationMessage, CreativeMode, ModelId, Role,
    heal_messages,
};

fn input<'a>(messages: &'a [ConversationMessage], model: ModelId) -> PromptInput<'a> {
    PromptInput {
        model,
        creative_mode: CreativeMode::Normal,
        system_prompt: "You are Drover.",
        custom_instructions: None,
        messages,
        environment_details: None,
    }
}

#[test]
fn healed_transcript_alternates_and_keeps_text() {
    let messages = vec![
        ConversationMessage::assistant_text("stray opening"),
        ConversationMessage::user_text("one"),
        ConversationMessage::user_text("two"),
        ConversationMessage::new(Role::Assistant, vec![ContentBlock::text("   ")]),
        ConversationMessage::assistant_text("answer"),
        ConversationMessage::assistant_text("more"),
    ];
    let healed = heal_messages(&messages);

    assert!(healed.windows(2).all(|w| w[0].role != w[1].role));
    assert!(healed.iter().all(|m| !m.content.is_empty()));
    let all_text: String = healed.iter().map(ConversationMessage::text).collect();
    for fragment in ["stray opening", "one", "two", "answer", "more"] {
        assert!(all_text.contains(fragment), "{fragment} was dropped");
    }
}

#[test]
fn request_is_built_from_healed_transcript() {
    let messages = vec![
        ConversationMessage::user_text("a"),
        ConversationMessage::user_text("b"),
    ];
    let request = build_request(&input(&messages, ModelId::Claude35Sonnet));
    assert_eq!(request.messages.len(), 1);
    assert_eq!(request.messages[0].content.len(), 2);
}

#[test]
fn cache_markers_cover_system_and_last_two_user_turns() {
    let messages = vec![
        ConversationMessage::user_text("first"),
        ConversationMessage::assistant_text("r1"),
        ConversationMessage::user_text("second"),
        ConversationMessage::assistant_text("r2"),
        ConversationMessage::user_text("third"),
    ];
    let request = build_request(&input(&messages, ModelId::Claude35Sonnet));

    assert_eq!(
        request.system.last().and_then(ContentBlock::cache_control),
        Some(CacheControl::Ephemeral)
    );
    assert_eq!(request.cache_marker_positions(), vec![2, 4]);

    let json = serde_json::to_value(&request).unwrap();
    assert_eq!(
        json["messages"][4]["content"][0]["cache_control"]["type"],
        "ephemeral"
    );
    assert!(json["messages"][0]["content"][0].get("cache_control").is_none());
}

#[test]
fn environment_details_do_not_disturb_cached_tail() {
    let messages = vec![ConversationMessage::user_text("task")];
    let mut prompt = input(&messages, ModelId::Claude35Sonnet);
    prompt.environment_details = Some("<environment_details>cwd</environment_details>");
    let request = build_request(&prompt);

    let blocks = &request.messages[0].content;
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0].as_text(), Some("<environment_details>cwd</environment_details>"));
    assert_eq!(blocks[0].cache_control(), None);
    assert_eq!(blocks[1].cache_control(), Some(CacheControl::Ephemeral));
}

#[test]
fn custom_instructions_carry_the_system_marker() {
    let messages = vec![ConversationMessage::user_text("task")];
    let mut prompt = input(&messages, ModelId::Claude35Sonnet);
    prompt.custom_instructions = Some("Prefer small diffs.");
    let request = build_request(&prompt);

    assert_eq!(request.system.len(), 2);
    assert_eq!(request.system[0].cache_control(), None);
    assert_eq!(request.system[1].cache_control(), Some(CacheControl::Ephemeral));
}
