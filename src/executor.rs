//! Request/response orchestration: rate limiter → circuit breaker →
//! transport → retry decision, looping back to the limiter on each retry.
//!
//! `RateLimited` and `CircuitOpen` are synchronous rejections and never
//! retried. Every outcome — success, each failed attempt, final failure —
//! is reported to the metrics sink. A caller-supplied deadline and
//! cancellation token abort in-flight waits, including retry backoff sleeps.

use crate::auth::TokenProvider;
use crate::breaker::CircuitBreaker;
use crate::error::classify_status;
use crate::limiter::RateLimiter;
use crate::retry::RetryPolicy;
use crate::telemetry::{CallStatus, MetricsSink, RequestMetrics};
use crate::{MeshError, Result};
use async_trait::async_trait;
use reqwest::Method;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A single request/response call.
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub method: Method,
    /// Path joined onto the transport's base URL.
    pub path: String,
    pub body: Option<serde_json::Value>,
    /// Non-idempotent calls are never retried.
    pub idempotent: bool,
    /// Deadline for the whole call including retries and backoff.
    pub deadline: Option<Duration>,
}

impl CallRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            body: None,
            idempotent: true,
            deadline: None,
        }
    }

    pub fn post(path: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            body: Some(body),
            idempotent: true,
            deadline: None,
        }
    }

    pub fn non_idempotent(mut self) -> Self {
        self.idempotent = false;
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Per-attempt context handed to the transport.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    /// Echoed by the server; unique per attempt.
    pub request_id: String,
    /// 0-based attempt index.
    pub attempt: u32,
    pub token: Option<String>,
}

/// Performs one network attempt. Seam for tests and alternate transports.
#[async_trait]
pub trait RequestTransport: Send + Sync {
    async fn execute(&self, request: &CallRequest, ctx: &AttemptContext)
        -> Result<serde_json::Value>;
}

/// reqwest-backed transport against the control-plane REST API.
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| MeshError::Config(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            client,
        })
    }
}

#[async_trait]
impl RequestTransport for HttpTransport {
    async fn execute(
        &self,
        request: &CallRequest,
        ctx: &AttemptContext,
    ) -> Result<serde_json::Value> {
        let url = format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            request.path.trim_start_matches('/')
        );

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .header("X-Request-ID", &ctx.request_id);
        if let Some(token) = &ctx.token {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() {
            if body.is_empty() {
                return Ok(serde_json::Value::Null);
            }
            serde_json::from_str(&body)
                .map_err(|e| MeshError::Unknown(format!("malformed response body: {}", e)))
        } else {
            Err(classify_status(status.as_u16(), &body))
        }
    }
}

/// What terminated one attempt.
enum AttemptEnd {
    Completed(Result<serde_json::Value>),
    Cancelled,
    DeadlineExceeded,
}

/// Composes the guards around the transport for one endpoint group.
pub struct RequestExecutor {
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    transport: Arc<dyn RequestTransport>,
    tokens: Arc<dyn TokenProvider>,
    metrics: Arc<dyn MetricsSink>,
}

impl RequestExecutor {
    pub fn new(
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
        transport: Arc<dyn RequestTransport>,
        tokens: Arc<dyn TokenProvider>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            limiter,
            breaker,
            retry,
            transport,
            tokens,
            metrics,
        }
    }

    /// Execute one call end-to-end, retrying transient failures.
    pub async fn call(
        &self,
        request: CallRequest,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value> {
        let started = Instant::now();
        let deadline = request.deadline.map(|d| started + d);
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return self.fail(&request, attempt, started, MeshError::Cancelled);
            }

            if let Err(e) = self.limiter.try_acquire() {
                return self.fail(&request, attempt, started, e);
            }
            let permit = match self.breaker.try_acquire() {
                Ok(p) => p,
                Err(e) => return self.fail(&request, attempt, started, e),
            };

            let token = match self.tokens.token().await {
                Ok(t) => t,
                Err(e) => {
                    // Token acquisition is a local concern; the dependency
                    // was never called.
                    self.breaker.release(permit);
                    return self.fail(&request, attempt, started, e);
                }
            };

            let ctx = AttemptContext {
                request_id: uuid::Uuid::new_v4().to_string(),
                attempt,
                token,
            };
            debug!(
                endpoint = %request.path,
                attempt,
                request_id = %ctx.request_id,
                "executing request attempt"
            );

            let end = {
                let fut = self.transport.execute(&request, &ctx);
                let deadline_at = deadline.unwrap_or_else(far_future);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => AttemptEnd::Cancelled,
                    _ = tokio::time::sleep_until(deadline_at), if deadline.is_some() => {
                        AttemptEnd::DeadlineExceeded
                    }
                    result = fut => AttemptEnd::Completed(result),
                }
            };

            let error = match end {
                AttemptEnd::Completed(Ok(value)) => {
                    self.breaker.record_success(permit);
                    self.metrics.record_request(&RequestMetrics {
                        endpoint: request.path.clone(),
                        attempts: attempt + 1,
                        latency: started.elapsed(),
                        status: CallStatus::Success,
                        error: None,
                    });
                    return Ok(value);
                }
                AttemptEnd::Completed(Err(e)) => {
                    if e.counts_against_breaker() {
                        self.breaker.record_failure(permit);
                    } else {
                        // The dependency answered; a 4xx is the caller's
                        // problem, not the dependency's.
                        self.breaker.record_success(permit);
                    }
                    e
                }
                AttemptEnd::Cancelled => {
                    self.breaker.release(permit);
                    return self.fail(&request, attempt + 1, started, MeshError::Cancelled);
                }
                AttemptEnd::DeadlineExceeded => {
                    self.breaker.release(permit);
                    let e = MeshError::Timeout("caller deadline exceeded".into());
                    return self.fail(&request, attempt + 1, started, e);
                }
            };

            if !self.retry.should_retry(&error, attempt, request.idempotent) {
                return self.fail(&request, attempt + 1, started, error);
            }

            self.metrics.record_request(&RequestMetrics {
                endpoint: request.path.clone(),
                attempts: attempt + 1,
                latency: started.elapsed(),
                status: CallStatus::Retrying,
                error: Some(error.to_string()),
            });

            let delay = self.retry.delay_for(attempt);
            attempt += 1;
            let deadline_at = deadline.unwrap_or_else(far_future);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return self.fail(&request, attempt, started, MeshError::Cancelled);
                }
                _ = tokio::time::sleep_until(deadline_at), if deadline.is_some() => {
                    let e = MeshError::Timeout("caller deadline exceeded".into());
                    return self.fail(&request, attempt, started, e);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn fail(
        &self,
        request: &CallRequest,
        attempts: u32,
        started: Instant,
        error: MeshError,
    ) -> Result<serde_json::Value> {
        self.metrics.record_request(&RequestMetrics {
            endpoint: request.path.clone(),
            attempts: attempts.max(1),
            latency: started.elapsed(),
            status: CallStatus::Failed,
            error: Some(error.to_string()),
        });
        Err(error)
    }
}

fn far_future() -> Instant {
    // ~30 years; effectively "no deadline" without risking overflow.
    Instant::now() + Duration::from_secs(30 * 365 * 24 * 3600)
}
