//! Retry decisions for failed request calls.
//!
//! Only transient failures are retried, only for idempotent calls, and only
//! up to `max_retries`; the delay doubles per attempt up to `max_delay`.

use crate::config::RetryConfig;
use crate::MeshError;
use std::time::Duration;

/// Decides whether a failed call is retried and after what delay.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Whether the call should be retried after `error` on the given
    /// 0-based attempt index.
    pub fn should_retry(&self, error: &MeshError, attempt: u32, idempotent: bool) -> bool {
        idempotent && attempt < self.config.max_retries && error.is_transient()
    }

    /// Backoff before the retry following 0-based attempt `attempt`:
    /// `min(base * multiplier^attempt, max)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.config.multiplier).saturating_pow(attempt);
        let delay = self
            .config
            .base_delay
            .saturating_mul(factor.min(u64::from(u32::MAX)) as u32);
        delay.min(self.config.max_delay)
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }
}
