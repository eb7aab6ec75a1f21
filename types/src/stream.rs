//! Decoded inference stream events.

use serde::{Deserialize, Serialize};

use crate::ConversationMessage;

/// Token and billing figures reported with the final response.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cache_creation_input_tokens: u32,
    pub cache_read_input_tokens: u32,
    pub cost: Option<f64>,
    pub credits_remaining: Option<f64>,
}

impl Usage {
    /// Fold another turn's usage into a running total.
    ///
    /// Token counts add up; `credits_remaining` is a balance, so the newest
    /// value wins.
    pub fn accumulate(&mut self, other: &Usage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.cache_creation_input_tokens = self
            .cache_creation_input_tokens
            .saturating_add(other.cache_creation_input_tokens);
        self.cache_read_input_tokens = self
            .cache_read_input_tokens
            .saturating_add(other.cache_read_input_tokens);
        self.cost = match (self.cost, other.cost) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };
        if other.credits_remaining.is_some() {
            self.credits_remaining = other.credits_remaining;
        }
    }
}

/// Terminal payload of a stream: the complete assistant message.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalResponse {
    pub message: ConversationMessage,
    pub stop_reason: Option<String>,
    pub usage: Usage,
}

/// Error reported by the provider inside the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    pub status: Option<u16>,
    pub message: String,
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status {
            Some(status) => write!(f, "provider error {status}: {}", self.message),
            None => write!(f, "provider error: {}", self.message),
        }
    }
}

/// One decoded stream record.
///
/// | Event | Meaning |
/// |-------|---------|
/// | `Partial` | Keepalive/progress record, carries nothing |
/// | `Display` | Incremental assistant text for live rendering |
/// | `Final` | Complete assistant message; always the last event |
/// | `Error` | Provider-side failure; not terminal by itself |
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Partial,
    Display(String),
    Final(FinalResponse),
    Error(ProviderError),
}

impl StreamEvent {
    #[must_use]
    pub fn is_final(&self) -> bool {
        matches!(self, StreamEvent::Final(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_accumulates_tokens_and_cost() {
        let mut total = Usage::default();
        total.accumulate(&Usage {
            input_tokens: 10,
            output_tokens: 5,
            cache_creation_input_tokens: 100,
            cache_read_input_tokens: 0,
            cost: Some(0.5),
            credits_remaining: Some(9.5),
        });
        total.accumulate(&Usage {
            input_tokens: 3,
            output_tokens: 2,
            cache_creation_input_tokens: 0,
            cache_read_input_tokens: 100,
            cost: Some(0.25),
            credits_remaining: Some(9.25),
        });
        assert_eq!(total.input_tokens, 13);
        assert_eq!(total.output_tokens, 7);
        assert_eq!(total.cache_read_input_tokens, 100);
        assert_eq!(total.cost, Some(0.75));
        assert_eq!(total.credits_remaining, Some(9.25));
    }

    #[test]
    fn provider_error_display_includes_status() {
        let err = ProviderError {
            status: Some(529),
            message: "overloaded".to_string(),
        };
        assert_eq!(err.to_string(), "provider error 529: overloaded");
    }
}
