//! Error taxonomy for the communication layer.
//!
//! Every failure surfaced to a caller is one of these variants. The
//! classification helpers drive the retry policy and the circuit breaker:
//! transient failures (connect, timeout, 5xx, unclassified transport) are
//! retryable and count against the breaker; validation failures (4xx) are
//! neither.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    /// Failed to establish or maintain the streaming link.
    #[error("connection error: {0}")]
    Connection(String),

    /// Deadline exceeded on connect or request.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Outbound buffer at capacity; the producer must back off.
    #[error("outbound queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// No admission token available in the current window.
    #[error("rate limit exceeded ({max_requests} requests per window)")]
    RateLimited { max_requests: u32 },

    /// The circuit breaker is open; the call was not attempted.
    #[error("circuit breaker open")]
    CircuitOpen,

    /// 4xx-class response. Caller error, never retried.
    #[error("validation error ({status}): {message}")]
    Validation { status: u16, message: String },

    /// 5xx-class response. Dependency failure, retryable.
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid client configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Envelope encode/decode failure.
    #[error("codec error: {0}")]
    Codec(String),

    /// Catch-all for unclassified transport failures.
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl MeshError {
    /// Whether the retry policy may retry this failure.
    ///
    /// `CircuitOpen` and `RateLimited` are immediate synchronous rejections
    /// and are never retried; 4xx indicates caller error, also never retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            MeshError::Connection(_)
                | MeshError::Timeout(_)
                | MeshError::Server { .. }
                | MeshError::Unknown(_)
        )
    }

    /// Whether this outcome counts as a failure in the breaker's window.
    ///
    /// 4xx responses prove the dependency answered; they do not count
    /// against it.
    pub fn counts_against_breaker(&self) -> bool {
        matches!(
            self,
            MeshError::Connection(_)
                | MeshError::Timeout(_)
                | MeshError::Server { .. }
                | MeshError::Unknown(_)
        )
    }
}

impl From<reqwest::Error> for MeshError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            MeshError::Timeout(err.to_string())
        } else if err.is_connect() {
            MeshError::Connection(err.to_string())
        } else {
            MeshError::Unknown(err.to_string())
        }
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(err: serde_json::Error) -> Self {
        MeshError::Codec(err.to_string())
    }
}

/// Standard error body returned by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub request_id: Option<String>,
}

/// Map an HTTP status plus (possibly structured) body into the taxonomy.
pub fn classify_status(status: u16, body: &str) -> MeshError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.message)
        .unwrap_or_else(|_| {
            if body.is_empty() {
                format!("HTTP {}", status)
            } else {
                body.to_string()
            }
        });

    match status {
        400..=499 => MeshError::Validation { status, message },
        500..=599 => MeshError::Server { status, message },
        _ => MeshError::Unknown(format!("HTTP {}: {}", status, message)),
    }
}
