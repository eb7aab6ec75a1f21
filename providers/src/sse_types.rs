//! Typed stream record structures and the record decoder.
//!
//! Every record payload is `{"code": <i64>, "body": ...}`. The code selects the
//! body shape, so decoding is two-stage: the envelope first, then the body for
//! that code. Parse errors happen at the serde boundary, not scattered through
//! the transport.
//!
//! | Code | Event | Body |
//! |------|-------|------|
//! | `-1` | `Error` | `{status?, msg}` |
//! | `0` | `Partial` | ignored |
//! | `1` | `Final` | `{anthropic: <message>, internal: <usage>}` |
//! | `2` | `Display` | `{text}` |

use drover_types::{
    ContentBlock, ConversationMessage, FinalResponse, ProviderError, Role, StreamEvent, Usage,
};
use serde::Deserialize;

use crate::error::StreamProtocolError;

const CODE_ERROR: i64 = -1;
const CODE_PARTIAL: i64 = 0;
const CODE_FINAL: i64 = 1;
const CODE_DISPLAY: i64 = 2;

#[derive(Debug, Deserialize)]
struct Envelope {
    code: i64,
    #[serde(default)]
    body: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    status: Option<u16>,
    #[serde(default)]
    msg: String,
}

#[derive(Debug, Deserialize)]
struct DisplayBody {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct FinalBody {
    anthropic: AnthropicMessage,
    #[serde(default)]
    internal: Option<InternalUsage>,
}

/// The provider's complete message object.
#[derive(Debug, Deserialize)]
struct AnthropicMessage {
    #[serde(default = "assistant_role")]
    role: Role,
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: AnthropicUsage,
}

fn assistant_role() -> Role {
    Role::Assistant
}

/// Note: `input_tokens` excludes cached tokens.
#[derive(Debug, Deserialize, Default)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
    #[serde(default)]
    cache_creation_input_tokens: u32,
    #[serde(default)]
    cache_read_input_tokens: u32,
}

/// Billing figures the service attaches next to the provider message.
#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct InternalUsage {
    #[serde(default)]
    cost: Option<f64>,
    #[serde(default)]
    user_credits: Option<f64>,
    #[serde(default)]
    input_tokens: Option<u32>,
    #[serde(default)]
    output_tokens: Option<u32>,
    #[serde(default)]
    cache_creation_input_tokens: Option<u32>,
    #[serde(default)]
    cache_read_input_tokens: Option<u32>,
}

impl FinalBody {
    fn into_response(self) -> FinalResponse {
        let provider = self.anthropic.usage;
        let internal = self.internal.unwrap_or_default();
        let usage = Usage {
            input_tokens: internal.input_tokens.unwrap_or(provider.input_tokens),
            output_tokens: internal.output_tokens.unwrap_or(provider.output_tokens),
            cache_creation_input_tokens: internal
                .cache_creation_input_tokens
                .unwrap_or(provider.cache_creation_input_tokens),
            cache_read_input_tokens: internal
                .cache_read_input_tokens
                .unwrap_or(provider.cache_read_input_tokens),
            cost: internal.cost,
            credits_remaining: internal.user_credits,
        };
        FinalResponse {
            message: ConversationMessage::new(self.anthropic.role, self.anthropic.content),
            stop_reason: self.anthropic.stop_reason,
            usage,
        }
    }
}

fn parse_body<T>(body: serde_json::Value, code: i64) -> Result<T, StreamProtocolError>
where
    T: serde::de::DeserializeOwned,
{
    serde_json::from_value(body)
        .map_err(|e| StreamProtocolError::MalformedRecord(format!("code {code} body: {e}")))
}

/// Decode one record payload (the joined `data:` lines) into a stream event.
pub fn decode_record(data: &str) -> Result<StreamEvent, StreamProtocolError> {
    let envelope: Envelope = serde_json::from_str(data)
        .map_err(|e| StreamProtocolError::MalformedRecord(e.to_string()))?;

    match envelope.code {
        CODE_PARTIAL => Ok(StreamEvent::Partial),
        CODE_DISPLAY => {
            let body: DisplayBody = parse_body(envelope.body, envelope.code)?;
            Ok(StreamEvent::Display(body.text))
        }
        CODE_FINAL => {
            let body: FinalBody = parse_body(envelope.body, envelope.code)?;
            Ok(StreamEvent::Final(body.into_response()))
        }
        CODE_ERROR => {
            let body: ErrorBody = parse_body(envelope.body, envelope.code)?;
            Ok(StreamEvent::Error(ProviderError {
                status: body.status,
                message: body.msg,
            }))
        }
        other => Err(StreamProtocolError::UnknownCode(other)),
    }
}
