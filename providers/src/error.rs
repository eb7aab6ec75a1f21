//! Error taxonomy for the inference transport.

use thiserror::Error;

/// Malformed stream content. Always fatal for the turn.
#[derive(Debug, Error)]
pub enum StreamProtocolError {
    #[error("stream buffer exceeded maximum size ({limit} bytes)")]
    BufferOverflow { limit: usize },
    #[error("received invalid UTF-8 in stream record")]
    InvalidUtf8,
    #[error("malformed stream record: {0}")]
    MalformedRecord(String),
    #[error("unknown stream record code {0}")]
    UnknownCode(i64),
}

/// Coarse classification used by the loop when deciding between retry,
/// failure, and abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ConnectionRefused,
    Unauthorized,
    PaymentRequired,
    RateLimited,
    Timeout,
    Network,
    StreamProtocol,
    Provider,
    Http,
    Aborted,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("inference service refused the connection: {0}")]
    ConnectionRefused(String),
    #[error("inference service rejected the API key")]
    Unauthorized,
    #[error("inference service requires payment (out of credits)")]
    PaymentRequired,
    #[error("rate limited by inference service")]
    RateLimited,
    #[error("request to inference service timed out")]
    Timeout,
    #[error("connection closed before the final response arrived")]
    Network,
    #[error(transparent)]
    StreamProtocol(#[from] StreamProtocolError),
    #[error("provider error{}: {message}", status.map(|s| format!(" {s}")).unwrap_or_default())]
    Provider { status: Option<u16>, message: String },
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("request aborted")]
    Aborted,
}

impl ApiError {
    /// Map a non-success HTTP status received before any stream event.
    #[must_use]
    pub fn from_status(status: u16, body: &str) -> Self {
        match status {
            401 => ApiError::Unauthorized,
            402 => ApiError::PaymentRequired,
            408 | 504 => ApiError::Timeout,
            429 => ApiError::RateLimited,
            _ => {
                let body = body.trim();
                if body.is_empty() {
                    ApiError::ConnectionRefused(format!("HTTP {status}"))
                } else {
                    ApiError::ConnectionRefused(format!("HTTP {status}: {body}"))
                }
            }
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            ApiError::ConnectionRefused(_) => ErrorKind::ConnectionRefused,
            ApiError::Unauthorized => ErrorKind::Unauthorized,
            ApiError::PaymentRequired => ErrorKind::PaymentRequired,
            ApiError::RateLimited => ErrorKind::RateLimited,
            ApiError::Timeout => ErrorKind::Timeout,
            ApiError::Network => ErrorKind::Network,
            ApiError::StreamProtocol(_) => ErrorKind::StreamProtocol,
            ApiError::Provider { .. } => ErrorKind::Provider,
            ApiError::Http(_) => ErrorKind::Http,
            ApiError::Aborted => ErrorKind::Aborted,
        }
    }

    /// Worth another attempt of the same turn.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::RateLimited | ApiError::Timeout => true,
            // A stream that closes without Final is a protocol failure, not a
            // transient one. The loop retries it only when the stream reported
            // a retryable provider error first.
            ApiError::Network => false,
            ApiError::Provider { status, .. } => {
                matches!(status, Some(408 | 409 | 429 | 500..=599))
            }
            ApiError::Http(e) => e.is_timeout() || e.is_body() || e.is_decode(),
            _ => false,
        }
    }

    /// Drives the loop to `Failed` without retry. `Aborted` is neither fatal
    /// nor retryable.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ApiError::Aborted) && !self.is_retryable()
    }
}
