//! Failure-rate circuit breaker guarding the request transport.
//!
//! Closed: outcomes accumulate over a rolling window; once at least
//! `minimum_requests` have been seen and the failure rate exceeds the
//! threshold, the breaker opens. Open: calls are rejected without touching
//! the transport until `reset_timeout` elapses. HalfOpen: exactly one trial
//! call is admitted; its outcome decides between Closed and Open.

use crate::config::CircuitBreakerConfig;
use crate::{MeshError, Result};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Externally observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Admission token returned by [`CircuitBreaker::try_acquire`].
///
/// Must be handed back via `record_success` / `record_failure` so half-open
/// trials are always resolved.
#[derive(Debug)]
pub struct CallPermit {
    trial: bool,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    window_started_at: Instant,
    failures: u32,
    total: u32,
    opened_at: Instant,
    trial_in_flight: bool,
}

impl BreakerInner {
    /// Discard counts that have aged out of the rolling window.
    fn roll_window(&mut self, window_size: std::time::Duration) {
        let now = Instant::now();
        if now.duration_since(self.window_started_at) >= window_size {
            self.window_started_at = now;
            self.failures = 0;
            self.total = 0;
        }
    }
}

/// Trip/reset state machine for one guarded dependency.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let now = Instant::now();
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                window_started_at: now,
                failures: 0,
                total: 0,
                opened_at: now,
                trial_in_flight: false,
            }),
        }
    }

    /// Admit a call, or reject with `CircuitOpen` without any network work.
    pub fn try_acquire(&self) -> Result<CallPermit> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.roll_window(self.config.window_size);
                Ok(CallPermit { trial: false })
            }
            CircuitState::Open => {
                if Instant::now().duration_since(inner.opened_at) >= self.config.reset_timeout {
                    debug!("circuit breaker reset timeout elapsed, admitting half-open trial");
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    Ok(CallPermit { trial: true })
                } else {
                    Err(MeshError::CircuitOpen)
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(MeshError::CircuitOpen)
                } else {
                    inner.trial_in_flight = true;
                    Ok(CallPermit { trial: true })
                }
            }
        }
    }

    /// Record a successful (or non-counted, e.g. 4xx) outcome.
    pub fn record_success(&self, permit: CallPermit) {
        let mut inner = self.inner.lock();
        if permit.trial {
            debug!("half-open trial succeeded, closing circuit");
            inner.state = CircuitState::Closed;
            inner.trial_in_flight = false;
            inner.failures = 0;
            inner.total = 0;
            inner.window_started_at = Instant::now();
        } else if inner.state == CircuitState::Closed {
            inner.roll_window(self.config.window_size);
            inner.total += 1;
        }
    }

    /// Record a counted failure outcome.
    pub fn record_failure(&self, permit: CallPermit) {
        let mut inner = self.inner.lock();
        if permit.trial {
            warn!("half-open trial failed, reopening circuit");
            inner.state = CircuitState::Open;
            inner.opened_at = Instant::now();
            inner.trial_in_flight = false;
            return;
        }
        if inner.state != CircuitState::Closed {
            // A concurrent failure already tripped the breaker.
            return;
        }
        inner.roll_window(self.config.window_size);
        inner.total += 1;
        inner.failures += 1;

        let over_threshold = inner.failures * 100
            > self.config.error_threshold_percentage * inner.total;
        if inner.total >= self.config.minimum_requests && over_threshold {
            warn!(
                failures = inner.failures,
                total = inner.total,
                threshold_pct = self.config.error_threshold_percentage,
                "error rate over threshold, opening circuit"
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Instant::now();
        }
    }

    /// Return a permit without recording an outcome (cancellation, or a
    /// failure that precedes the network call). A half-open trial slot is
    /// freed for the next caller.
    pub fn release(&self, permit: CallPermit) {
        if permit.trial {
            let mut inner = self.inner.lock();
            inner.trial_in_flight = false;
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            error_threshold_percentage: 50,
            window_size: Duration::from_millis(60_000),
            minimum_requests: 5,
            reset_timeout: Duration::from_millis(30_000),
        })
    }

    fn fail_once(b: &CircuitBreaker) {
        let permit = b.try_acquire().unwrap();
        b.record_failure(permit);
    }

    fn succeed_once(b: &CircuitBreaker) {
        let permit = b.try_acquire().unwrap();
        b.record_success(permit);
    }

    #[tokio::test(start_paused = true)]
    async fn trips_on_three_failures_out_of_five() {
        let b = breaker();
        succeed_once(&b);
        fail_once(&b);
        succeed_once(&b);
        fail_once(&b);
        assert_eq!(b.state(), CircuitState::Closed);
        fail_once(&b); // 3 failures / 5 total = 60% > 50%
        assert_eq!(b.state(), CircuitState::Open);
        assert!(matches!(b.try_acquire(), Err(MeshError::CircuitOpen)));
    }

    #[tokio::test(start_paused = true)]
    async fn does_not_trip_below_minimum_requests() {
        let b = breaker();
        for _ in 0..4 {
            fail_once(&b); // 100% failure rate but only 4 outcomes
        }
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn exactly_threshold_rate_does_not_trip() {
        let b = breaker();
        for _ in 0..3 {
            succeed_once(&b);
        }
        for _ in 0..3 {
            fail_once(&b); // 3/6 = 50%, not over the 50% threshold
        }
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_admits_exactly_one_trial() {
        let b = breaker();
        for _ in 0..5 {
            fail_once(&b);
        }
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(30_000)).await;

        let trial = b.try_acquire().unwrap();
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(matches!(b.try_acquire(), Err(MeshError::CircuitOpen)));
        assert!(matches!(b.try_acquire(), Err(MeshError::CircuitOpen)));

        b.record_success(trial);
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_trial_restarts_the_reset_timer() {
        let b = breaker();
        for _ in 0..5 {
            fail_once(&b);
        }
        tokio::time::advance(Duration::from_millis(30_000)).await;

        let trial = b.try_acquire().unwrap();
        b.record_failure(trial);
        assert_eq!(b.state(), CircuitState::Open);
        assert!(matches!(b.try_acquire(), Err(MeshError::CircuitOpen)));

        tokio::time::advance(Duration::from_millis(29_999)).await;
        assert!(matches!(b.try_acquire(), Err(MeshError::CircuitOpen)));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(b.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn released_trial_frees_the_slot_without_closing() {
        let b = breaker();
        for _ in 0..5 {
            fail_once(&b);
        }
        tokio::time::advance(Duration::from_millis(30_000)).await;

        let trial = b.try_acquire().unwrap();
        b.release(trial);
        assert_eq!(b.state(), CircuitState::HalfOpen);
        // Slot is free again for the next caller.
        assert!(b.try_acquire().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn trial_success_resets_window_counters() {
        let b = breaker();
        for _ in 0..5 {
            fail_once(&b);
        }
        tokio::time::advance(Duration::from_millis(30_000)).await;
        let trial = b.try_acquire().unwrap();
        b.record_success(trial);

        // A fresh failure alone must not re-trip a reset breaker.
        for _ in 0..4 {
            fail_once(&b);
        }
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn old_outcomes_age_out_of_the_window() {
        let b = breaker();
        for _ in 0..4 {
            fail_once(&b);
        }
        tokio::time::advance(Duration::from_millis(60_000)).await;
        fail_once(&b); // old 4 rolled away; 1/1 but below minimum_requests
        assert_eq!(b.state(), CircuitState::Closed);
    }
}
