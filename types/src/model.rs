//! Model catalog and sampling presets.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Static facts about a model the inference service can serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelInfo {
    pub max_tokens: u32,
    pub context_window: u32,
    pub supports_images: bool,
    pub supports_prompt_cache: bool,
}

/// Known model identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ModelId {
    #[default]
    #[serde(rename = "claude-3-5-sonnet-20240620")]
    Claude35Sonnet,
    #[serde(rename = "claude-3-opus-20240229")]
    Claude3Opus,
    #[serde(rename = "claude-3-haiku-20240307")]
    Claude3Haiku,
    #[serde(rename = "claude-3-sonnet-20240229")]
    Claude3Sonnet,
}

#[derive(Debug, Error)]
#[error("unknown model '{raw}' (expected one of: {expected})")]
pub struct ModelParseError {
    raw: String,
    expected: String,
}

impl ModelId {
    #[must_use]
    pub const fn all() -> &'static [ModelId] {
        &[
            ModelId::Claude35Sonnet,
            ModelId::Claude3Opus,
            ModelId::Claude3Haiku,
            ModelId::Claude3Sonnet,
        ]
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ModelId::Claude35Sonnet => "claude-3-5-sonnet-20240620",
            ModelId::Claude3Opus => "claude-3-opus-20240229",
            ModelId::Claude3Haiku => "claude-3-haiku-20240307",
            ModelId::Claude3Sonnet => "claude-3-sonnet-20240229",
        }
    }

    #[must_use]
    pub const fn info(self) -> ModelInfo {
        match self {
            ModelId::Claude35Sonnet => ModelInfo {
                max_tokens: 8192,
                context_window: 200_000,
                supports_images: true,
                supports_prompt_cache: true,
            },
            ModelId::Claude3Opus | ModelId::Claude3Haiku => ModelInfo {
                max_tokens: 4096,
                context_window: 200_000,
                supports_images: true,
                supports_prompt_cache: true,
            },
            ModelId::Claude3Sonnet => ModelInfo {
                max_tokens: 4096,
                context_window: 200_000,
                supports_images: true,
                supports_prompt_cache: false,
            },
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ModelParseError> {
        let trimmed = raw.trim();
        Self::all()
            .iter()
            .copied()
            .find(|model| model.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| ModelParseError {
                raw: trimmed.to_string(),
                expected: Self::all()
                    .iter()
                    .map(|m| m.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }

    /// Resolve a configured id, falling back to the default model when it is
    /// absent or not in the catalog.
    #[must_use]
    pub fn resolve(raw: Option<&str>) -> Self {
        raw.and_then(|r| Self::parse(r).ok()).unwrap_or_default()
    }
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sampling preset chosen per task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CreativeMode {
    #[default]
    Normal,
    Creative,
    Deterministic,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CreativitySettings {
    pub temperature: f32,
    pub top_p: f32,
}

impl CreativeMode {
    #[must_use]
    pub const fn settings(self) -> CreativitySettings {
        match self {
            CreativeMode::Deterministic => CreativitySettings {
                temperature: 0.0,
                top_p: 0.9,
            },
            CreativeMode::Normal => CreativitySettings {
                temperature: 0.2,
                top_p: 0.8,
            },
            CreativeMode::Creative => CreativitySettings {
                temperature: 0.3,
                top_p: 0.9,
            },
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "normal" => Some(CreativeMode::Normal),
            "creative" => Some(CreativeMode::Creative),
            "deterministic" => Some(CreativeMode::Deterministic),
            _ => None,
        }
    }
}
