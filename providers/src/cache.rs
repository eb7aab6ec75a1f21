//! Request assembly with prompt-cache marker placement.
//!
//! The provider caches by exact prefix match. One marker closes the system
//! segment (custom instructions when present, otherwise the system prompt),
//! and the last two user turns each carry a marker on their final block. Each
//! new turn moves the message markers forward by one, so the prefix cached on
//! the previous call is extended instead of invalidated.
//!
//! Environment details are injected as an unmarked leading block of the newest
//! user turn; the marked tail of that turn stays byte-stable.

use drover_types::{
    CacheControl, ContentBlock, ConversationMessage, CreativeMode, ModelId, Role, heal_messages,
};
use serde::Serialize;

/// Number of trailing user turns that carry a cache marker.
const CACHED_USER_TURNS: usize = 2;

/// Everything needed to build one inference request.
#[derive(Debug, Clone, Copy)]
pub struct PromptInput<'a> {
    pub model: ModelId,
    pub creative_mode: CreativeMode,
    pub system_prompt: &'a str,
    pub custom_instructions: Option<&'a str>,
    pub messages: &'a [ConversationMessage],
    pub environment_details: Option<&'a str>,
}

/// Outbound request body.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceRequest {
    pub model: ModelId,
    pub max_tokens: u32,
    pub system: Vec<ContentBlock>,
    pub messages: Vec<ConversationMessage>,
    pub temperature: f32,
    pub top_p: f32,
}

impl InferenceRequest {
    /// Indices of messages carrying at least one cache marker.
    #[must_use]
    pub fn cache_marker_positions(&self) -> Vec<usize> {
        self.messages
            .iter()
            .enumerate()
            .filter(|(_, message)| message.has_cache_marker())
            .map(|(index, _)| index)
            .collect()
    }

    #[must_use]
    pub fn system_marker_count(&self) -> usize {
        self.system
            .iter()
            .filter(|block| block.cache_control().is_some())
            .count()
    }

    /// Log-safe copy: image payloads replaced by a size note.
    #[must_use]
    pub fn redacted(&self) -> Self {
        Self {
            messages: self
                .messages
                .iter()
                .map(ConversationMessage::without_image_data)
                .collect(),
            ..self.clone()
        }
    }
}

#[must_use]
pub fn build_request(input: &PromptInput<'_>) -> InferenceRequest {
    let info = input.model.info();
    let caching = info.supports_prompt_cache;

    let mut system = Vec::with_capacity(2);
    let prompt = input.system_prompt.trim();
    if !prompt.is_empty() {
        system.push(ContentBlock::text(prompt));
    }
    if let Some(instructions) = input.custom_instructions
        && !instructions.trim().is_empty()
    {
        system.push(ContentBlock::text(instructions.trim()));
    }
    if caching && let Some(last) = system.last_mut() {
        last.set_cache_control(Some(CacheControl::Ephemeral));
    }

    let mut messages = heal_messages(input.messages);
    for message in &mut messages {
        message.clear_cache_markers();
    }

    if caching {
        let user_turns = messages
            .iter()
            .enumerate()
            .rev()
            .filter(|(_, message)| message.role == Role::User)
            .map(|(index, _)| index)
            .take(CACHED_USER_TURNS)
            .collect::<Vec<_>>();
        for index in user_turns {
            if let Some(block) = messages[index].content.last_mut() {
                block.set_cache_control(Some(CacheControl::Ephemeral));
            }
        }
    }

    if let Some(details) = input.environment_details
        && !details.trim().is_empty()
    {
        prepend_environment(&mut messages, details);
    }

    let settings = input.creative_mode.settings();
    InferenceRequest {
        model: input.model,
        max_tokens: info.max_tokens,
        system,
        messages,
        temperature: settings.temperature,
        top_p: settings.top_p,
    }
}

fn prepend_environment(messages: &mut [ConversationMessage], details: &str) {
    let Some(newest) = messages
        .iter_mut()
        .rev()
        .find(|message| message.role == Role::User)
    else {
        return;
    };
    // Tool results must still open the turn.
    let at = newest
        .content
        .iter()
        .take_while(|block| block.is_tool_result())
        .count();
    newest.content.insert(at, ContentBlock::text(details));
}
