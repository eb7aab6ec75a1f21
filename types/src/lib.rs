//! Core domain types for Drover.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Everything here can be used from any layer of the application.

// Pedantic lint configuration - these are intentional design choices
#![allow(clippy::missing_errors_doc)] // Result-returning functions are self-explanatory
#![allow(clippy::missing_panics_doc)] // Panics are documented in assertions

mod heal;
mod message;
mod model;
mod stream;
mod tool;

pub use heal::{heal_messages, heal_origins};
pub use message::{CacheControl, ContentBlock, ConversationMessage, ImageSource, Role};
pub use model::{CreativeMode, CreativitySettings, ModelId, ModelInfo, ModelParseError};
pub use stream::{FinalResponse, ProviderError, StreamEvent, Usage};
pub use tool::{InvocationStatus, ToolInvocation};

use thiserror::Error;

/// The API key was blank after trimming.
#[derive(Debug, Error)]
#[error("API key must not be empty")]
pub struct EmptyApiKey;

/// Inference service credential, trimmed and never blank.
///
/// `Debug` never prints the secret so the key can travel inside config
/// structs that end up in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ApiKey(<redacted>)")
    }
}

impl ApiKey {
    pub fn new(raw: impl Into<String>) -> Result<Self, EmptyApiKey> {
        let raw: String = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(EmptyApiKey);
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn expose_secret(&self) -> &str {
        &self.0
    }
}
