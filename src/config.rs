//! Client configuration surface.
//!
//! All knobs carry the documented defaults; construct with `Default` and
//! override the fields you care about, or use the `with_` helpers.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration for a [`crate::client::MeshClient`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Base delay between reconnection attempts (doubles per attempt).
    #[serde(with = "duration_ms")]
    pub reconnect_interval: Duration,
    /// Cap on the reconnect backoff delay.
    #[serde(with = "duration_ms")]
    pub max_reconnect_delay: Duration,
    /// Reconnection attempts before surfacing a fatal connection error.
    pub max_reconnect_attempts: u32,
    /// Interval between heartbeat frames.
    #[serde(with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// Deadline for establishing a streaming connection.
    #[serde(with = "duration_ms")]
    pub connection_timeout: Duration,
    /// Number of pooled streaming connections.
    pub connection_pool_size: usize,
    /// Outbound queue capacity; enqueues beyond this fail with `QueueFull`.
    pub message_queue_size: usize,
    /// Compress large envelope payloads before sending.
    pub use_compression: bool,
    /// Maximum encoded frame size in bytes.
    pub max_message_size: usize,
    pub rate_limit: RateLimitConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_millis(1000),
            max_reconnect_delay: Duration::from_millis(30_000),
            max_reconnect_attempts: 5,
            heartbeat_interval: Duration::from_millis(30_000),
            connection_timeout: Duration::from_millis(5_000),
            connection_pool_size: 3,
            message_queue_size: 1000,
            use_compression: true,
            max_message_size: 1024 * 1024,
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl LinkConfig {
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.connection_pool_size = size;
        self
    }

    pub fn with_queue_size(mut self, size: usize) -> Self {
        self.message_queue_size = size;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

/// Fixed-window admission budget for the request path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    #[serde(with = "duration_ms")]
    pub per_window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            per_window: Duration::from_millis(60_000),
        }
    }
}

/// Failure-rate trip/reset settings for the circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Error-rate percentage above which the breaker trips.
    pub error_threshold_percentage: u32,
    /// Rolling window over which outcomes are counted.
    #[serde(with = "duration_ms")]
    pub window_size: Duration,
    /// Minimum outcomes in the window before the threshold applies.
    pub minimum_requests: u32,
    /// Open-state cooldown before a half-open trial is admitted.
    #[serde(with = "duration_ms")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            error_threshold_percentage: 50,
            window_size: Duration::from_millis(60_000),
            minimum_requests: 5,
            reset_timeout: Duration::from_millis(30_000),
        }
    }
}

/// Exponential backoff settings for request retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    pub multiplier: u32,
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            multiplier: 2,
            max_delay: Duration::from_millis(30_000),
        }
    }
}

/// Serialize durations as integer milliseconds on the wire.
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}
