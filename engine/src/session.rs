//! Per-task conversation state.

use drover_providers::{InferenceRequest, PromptInput, build_request};
use drover_types::{ConversationMessage, CreativeMode, ModelId, Usage, heal_origins};
use tokio_util::sync::CancellationToken;

use crate::cancel::CancellationController;

/// Fixed inputs of a task.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub model: ModelId,
    pub creative_mode: CreativeMode,
    pub system_prompt: String,
    pub custom_instructions: Option<String>,
}

/// One task: the transcript plus the state carried between its turns.
#[derive(Debug)]
pub struct TaskSession {
    id: String,
    messages: Vec<ConversationMessage>,
    model: ModelId,
    creative_mode: CreativeMode,
    system_prompt: String,
    custom_instructions: Option<String>,
    cancel: CancellationToken,
    /// Highest transcript index whose healed message has carried a cache marker.
    cache_high_water_mark: Option<usize>,
    previous_system: Option<String>,
    system_prompt_changes: u32,
    usage: Usage,
    turns: u32,
}

impl TaskSession {
    /// Start a task from the user's request.
    #[must_use]
    pub fn new(config: SessionConfig, task: impl Into<String>) -> Self {
        Self::resume(
            config,
            uuid::Uuid::new_v4().to_string(),
            vec![ConversationMessage::user_text(task)],
        )
    }

    /// Continue a task from a saved transcript.
    #[must_use]
    pub fn resume(
        config: SessionConfig,
        id: impl Into<String>,
        messages: Vec<ConversationMessage>,
    ) -> Self {
        Self {
            id: id.into(),
            messages,
            model: config.model,
            creative_mode: config.creative_mode,
            system_prompt: config.system_prompt,
            custom_instructions: config.custom_instructions,
            cancel: CancellationToken::new(),
            cache_high_water_mark: None,
            previous_system: None,
            system_prompt_changes: 0,
            usage: Usage::default(),
            turns: 0,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    #[must_use]
    pub fn model(&self) -> ModelId {
        self.model
    }

    #[must_use]
    pub fn usage(&self) -> &Usage {
        &self.usage
    }

    #[must_use]
    pub fn turns(&self) -> u32 {
        self.turns
    }

    #[must_use]
    pub fn cache_high_water_mark(&self) -> Option<usize> {
        self.cache_high_water_mark
    }

    /// How many times the system text differed from the previous request.
    #[must_use]
    pub fn system_prompt_changes(&self) -> u32 {
        self.system_prompt_changes
    }

    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.system_prompt = prompt.into();
    }

    pub fn set_custom_instructions(&mut self, instructions: Option<String>) {
        self.custom_instructions = instructions;
    }

    #[must_use]
    pub fn abort_handle(&self) -> CancellationController {
        CancellationController::from_token(self.cancel.clone())
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn begin_turn(&mut self) -> u32 {
        self.turns += 1;
        self.turns
    }

    pub fn push_message(&mut self, message: ConversationMessage) {
        self.messages.push(message);
    }

    /// Drop messages past `len`. The high-water-mark falls back with the transcript.
    pub fn truncate(&mut self, len: usize) {
        if len >= self.messages.len() {
            return;
        }
        self.messages.truncate(len);
        if self.cache_high_water_mark.is_some_and(|mark| mark >= len) {
            self.cache_high_water_mark = len.checked_sub(1);
        }
    }

    pub fn record_usage(&mut self, usage: &Usage) {
        self.usage.accumulate(usage);
    }

    /// Build the next request and update the cache diagnostics.
    pub fn prepare_request(&mut self, environment_details: Option<&str>) -> InferenceRequest {
        let request = build_request(&PromptInput {
            model: self.model,
            creative_mode: self.creative_mode,
            system_prompt: &self.system_prompt,
            custom_instructions: self.custom_instructions.as_deref(),
            messages: &self.messages,
            environment_details,
        });

        let system_text: String = request
            .system
            .iter()
            .filter_map(|block| block.as_text())
            .collect::<Vec<_>>()
            .join("\n");
        if let Some(previous) = &self.previous_system
            && *previous != system_text
        {
            self.system_prompt_changes += 1;
            tracing::warn!(
                task = %self.id,
                previous_len = previous.len(),
                current_len = system_text.len(),
                delta = system_text.len() as i64 - previous.len() as i64,
                "System prompt changed between requests; cached prefix invalidated"
            );
        }
        self.previous_system = Some(system_text);

        // Marker positions index the healed request; the mark tracks the transcript.
        let newest = request
            .cache_marker_positions()
            .last()
            .and_then(|&position| heal_origins(&self.messages).get(position).copied());
        if let Some(newest) = newest
            && self.cache_high_water_mark.is_none_or(|mark| newest > mark)
        {
            tracing::debug!(
                task = %self.id,
                from = ?self.cache_high_water_mark,
                to = newest,
                "Prefix cache high-water-mark advanced"
            );
            self.cache_high_water_mark = Some(newest);
        }

        tracing::debug!(
            task = %self.id,
            request = %serde_json::to_string(&request.redacted()).unwrap_or_default(),
            "Prepared inference request"
        );
        request
    }
}
