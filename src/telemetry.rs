//! Observability collaborator.
//!
//! Every request outcome (success, each failed attempt, final failure) and
//! every connection lifecycle event is reported through a single sink. The
//! default sink emits structured `tracing` events and therefore stays silent
//! unless the embedding application installs a subscriber.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Terminal status of a request attempt or call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Success,
    /// Attempt failed; the executor will retry.
    Retrying,
    /// Final failure surfaced to the caller.
    Failed,
}

/// Per-attempt / per-call metrics event.
#[derive(Debug, Clone)]
pub struct RequestMetrics {
    pub endpoint: String,
    /// 1-based attempt count at the time of the event.
    pub attempts: u32,
    pub latency: Duration,
    pub status: CallStatus,
    /// Error display string for non-success outcomes.
    pub error: Option<String>,
}

/// Connection lifecycle event.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected { connection_id: usize },
    Disconnected { connection_id: usize, reason: String },
    ReconnectScheduled { connection_id: usize, attempt: u32, delay: Duration },
    ReconnectExhausted { connection_id: usize, attempts: u32 },
    HeartbeatMissed { connection_id: usize },
}

/// Receives metrics events from the executor and the connection manager.
pub trait MetricsSink: Send + Sync {
    fn record_request(&self, metrics: &RequestMetrics);
    fn record_connection(&self, event: &ConnectionEvent);
}

/// Default sink backed by `tracing`.
pub struct TracingSink;

impl TracingSink {
    pub fn shared() -> Arc<dyn MetricsSink> {
        Arc::new(Self)
    }
}

impl MetricsSink for TracingSink {
    fn record_request(&self, m: &RequestMetrics) {
        match m.status {
            CallStatus::Success => debug!(
                endpoint = %m.endpoint,
                attempts = m.attempts,
                latency_ms = m.latency.as_millis() as u64,
                "request succeeded"
            ),
            CallStatus::Retrying => debug!(
                endpoint = %m.endpoint,
                attempts = m.attempts,
                error = m.error.as_deref().unwrap_or(""),
                "request attempt failed, retrying"
            ),
            CallStatus::Failed => warn!(
                endpoint = %m.endpoint,
                attempts = m.attempts,
                latency_ms = m.latency.as_millis() as u64,
                error = m.error.as_deref().unwrap_or(""),
                "request failed"
            ),
        }
    }

    fn record_connection(&self, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::Connected { connection_id } => {
                info!(connection_id, "connection established")
            }
            ConnectionEvent::Disconnected { connection_id, reason } => {
                warn!(connection_id, reason = %reason, "connection lost")
            }
            ConnectionEvent::ReconnectScheduled { connection_id, attempt, delay } => {
                info!(
                    connection_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "reconnect scheduled"
                )
            }
            ConnectionEvent::ReconnectExhausted { connection_id, attempts } => {
                warn!(connection_id, attempts, "reconnect attempts exhausted")
            }
            ConnectionEvent::HeartbeatMissed { connection_id } => {
                warn!(connection_id, "heartbeat window missed, link presumed dead")
            }
        }
    }
}

/// Discards everything. For tests and embedders that opt out.
pub struct NullSink;

impl MetricsSink for NullSink {
    fn record_request(&self, _: &RequestMetrics) {}
    fn record_connection(&self, _: &ConnectionEvent) {}
}
