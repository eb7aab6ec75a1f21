//! `~/.drover/config.toml` loading and validation.

use serde::Deserialize;
use std::{env, path::Path, path::PathBuf, time::Duration};

use drover_providers::retry::RetryConfig;
use drover_providers::{ApiKey, ClientConfig, is_loopback};
use drover_types::{CreativeMode, ModelId};
use url::Url;

use crate::tool_loop::LoopSettings;

pub const ENV_API_KEY: &str = "DROVER_API_KEY";
pub const ENV_BASE_URL: &str = "DROVER_BASE_URL";
pub const ENV_MODEL: &str = "DROVER_MODEL";

#[derive(Debug, Default, Deserialize)]
pub struct DroverConfig {
    pub api: Option<ApiConfig>,
    #[serde(rename = "loop")]
    pub loop_: Option<LoopConfig>,
    pub transport: Option<TransportConfig>,
    pub prompt: Option<PromptConfig>,
}

#[derive(Default, Deserialize)]
pub struct ApiConfig {
    pub base_url: Option<String>,
    pub key: Option<String>,
    pub model: Option<String>,
    pub creative_mode: Option<String>,
}

impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConfig")
            .field("base_url", &self.base_url)
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("creative_mode", &self.creative_mode)
            .finish()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LoopConfig {
    pub max_turns: Option<u32>,
    pub max_concurrent_tools: Option<usize>,
    pub tool_timeout_secs: Option<u64>,
    pub cleanup_grace_ms: Option<u64>,
    pub max_turn_retries: Option<u32>,
    pub max_output_bytes: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TransportConfig {
    pub request_timeout_secs: Option<u64>,
    pub stream_idle_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PromptConfig {
    pub custom_instructions: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid base URL {url:?}: {reason}")]
    InvalidBaseUrl { url: String, reason: String },
    #[error("no API key configured (set [api].key or DROVER_API_KEY)")]
    MissingApiKey,
    #[error("no base URL configured (set [api].base_url or DROVER_BASE_URL)")]
    MissingBaseUrl,
    #[error("invalid value {value:?} for {field}")]
    InvalidValue { field: &'static str, value: String },
}

/// Validated settings ready to build a client, a session, and a loop.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub client: ClientConfig,
    pub model: ModelId,
    pub creative_mode: CreativeMode,
    pub custom_instructions: Option<String>,
    pub loop_settings: LoopSettings,
}

/// Replace `${VAR}` with the variable's value (empty when unset).
pub fn expand_env_vars(value: &str) -> String {
    expand_with(value, |name| env::var(name).ok())
}

fn expand_with(value: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) if end > 0 => {
                out.push_str(&lookup(&after[..end]).unwrap_or_default());
                rest = &after[end + 1..];
            }
            Some(end) => {
                // "${}" stays literal
                out.push_str(&rest[start..start + 3 + end]);
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

impl DroverConfig {
    /// Load the default config file. A missing file is not an error.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(None),
        }
    }

    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path).map_err(|source| {
            tracing::warn!("Failed to read config at {:?}: {}", path, source);
            ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }
        })?;
        Self::parse(&content, path).map(Some)
    }

    pub fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| {
            tracing::warn!("Failed to parse config at {:?}: {}", path, source);
            ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })
    }

    /// Apply process environment overrides and validate.
    pub fn resolve(self) -> Result<ResolvedConfig, ConfigError> {
        self.resolve_with(|name| env::var(name).ok())
    }

    /// Apply overrides from `lookup` and validate.
    pub fn resolve_with(
        self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<ResolvedConfig, ConfigError> {
        let api = self.api.unwrap_or_default();
        let loop_cfg = self.loop_.unwrap_or_default();
        let transport = self.transport.unwrap_or_default();
        let prompt = self.prompt.unwrap_or_default();
        let non_blank = |value: Option<String>| value.filter(|v| !v.trim().is_empty());

        let key = non_blank(lookup(ENV_API_KEY))
            .or_else(|| non_blank(api.key.map(|k| expand_with(&k, &lookup))))
            .ok_or(ConfigError::MissingApiKey)?;
        let api_key = ApiKey::new(key).map_err(|_| ConfigError::MissingApiKey)?;

        let raw_url = non_blank(lookup(ENV_BASE_URL))
            .or_else(|| non_blank(api.base_url.map(|u| expand_with(&u, &lookup))))
            .ok_or(ConfigError::MissingBaseUrl)?;
        let base_url = parse_base_url(raw_url.trim())?;

        let model_raw = non_blank(lookup(ENV_MODEL)).or(api.model);
        let model = ModelId::resolve(model_raw.as_deref());
        if let Some(raw) = model_raw.as_deref()
            && ModelId::parse(raw).is_err()
        {
            tracing::warn!(requested = raw, fallback = %model, "Unknown model; using default");
        }

        let creative_mode = match api.creative_mode {
            Some(raw) => CreativeMode::parse(&raw).ok_or(ConfigError::InvalidValue {
                field: "api.creative_mode",
                value: raw,
            })?,
            None => CreativeMode::default(),
        };

        let mut client = ClientConfig::new(base_url, api_key);
        if let Some(secs) = transport.request_timeout_secs {
            client.request_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = transport.stream_idle_timeout_secs {
            client.stream_idle_timeout = Duration::from_secs(secs.max(1));
        }

        let defaults = LoopSettings::default();
        let loop_settings = LoopSettings {
            max_turns: loop_cfg.max_turns.unwrap_or(defaults.max_turns).max(1),
            max_concurrent_tools: loop_cfg
                .max_concurrent_tools
                .unwrap_or(defaults.max_concurrent_tools)
                .max(1),
            tool_timeout: loop_cfg
                .tool_timeout_secs
                .map_or(defaults.tool_timeout, Duration::from_secs),
            cleanup_grace: loop_cfg
                .cleanup_grace_ms
                .map_or(defaults.cleanup_grace, Duration::from_millis),
            retry: RetryConfig::default().with_max_retries(
                loop_cfg
                    .max_turn_retries
                    .unwrap_or(defaults.retry.max_retries),
            ),
            max_output_bytes: loop_cfg
                .max_output_bytes
                .unwrap_or(defaults.max_output_bytes),
            ..defaults
        };

        Ok(ResolvedConfig {
            client,
            model,
            creative_mode,
            custom_instructions: non_blank(prompt.custom_instructions),
            loop_settings,
        })
    }
}

fn parse_base_url(raw: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidBaseUrl {
        url: raw.to_string(),
        reason,
    };
    let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    match url.scheme() {
        "https" => Ok(url),
        "http" if is_loopback(&url) => Ok(url),
        "http" => Err(invalid("plain http is only allowed for localhost".to_string())),
        other => Err(invalid(format!("unsupported scheme '{other}'"))),
    }
}

/// Directory holding the config file and logs.
#[must_use]
pub fn drover_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".drover"))
}

#[must_use]
pub fn config_path() -> Option<PathBuf> {
    drover_dir().map(|dir| dir.join("config.toml"))
}
