//! Top-level client facade.
//!
//! Wires the request executor (REST side) and the connection manager
//! (streaming side) around one shared configuration, token provider, and
//! metrics sink. Built through [`MeshClientBuilder`]; all collaborators can
//! be swapped, which is how the test suite runs without a network.

use crate::auth::NoAuth;
use crate::breaker::{CircuitBreaker, CircuitState};
use crate::config::LinkConfig;
use crate::connection::{ConnectionManager, ConnectionState, StreamConnector, WsConnector};
use crate::envelope::Envelope;
use crate::executor::{CallRequest, HttpTransport, RequestExecutor, RequestTransport};
use crate::limiter::RateLimiter;
use crate::registry::{SubscribeOptions, Subscriber, SubscriptionHandle, SubscriptionRegistry};
use crate::retry::RetryPolicy;
use crate::telemetry::{MetricsSink, TracingSink};
use crate::{MeshError, Result, TokenProvider};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Point-in-time view of the client's health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientStatus {
    pub connection: ConnectionState,
    pub live_links: usize,
    pub queued_messages: usize,
    pub circuit: CircuitState,
    /// Requests left in the current rate-limit window.
    pub rate_remaining: u32,
}

pub struct MeshClientBuilder {
    config: LinkConfig,
    base_url: Option<String>,
    stream_url: Option<String>,
    tokens: Arc<dyn TokenProvider>,
    metrics: Arc<dyn MetricsSink>,
    transport: Option<Arc<dyn RequestTransport>>,
    connector: Option<Arc<dyn StreamConnector>>,
}

impl MeshClientBuilder {
    pub fn new() -> Self {
        Self {
            config: LinkConfig::default(),
            base_url: None,
            stream_url: None,
            tokens: Arc::new(NoAuth),
            metrics: TracingSink::shared(),
            transport: None,
            connector: None,
        }
    }

    pub fn config(mut self, config: LinkConfig) -> Self {
        self.config = config;
        self
    }

    /// Base URL for REST calls, e.g. `https://mesh.example.com/api`.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// WebSocket URL for the streaming channel, e.g. `wss://mesh.example.com/ws`.
    pub fn stream_url(mut self, url: impl Into<String>) -> Self {
        self.stream_url = Some(url.into());
        self
    }

    pub fn token_provider(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = tokens;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Replace the HTTP transport. Mainly for tests.
    pub fn transport(mut self, transport: Arc<dyn RequestTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replace the stream connector. Mainly for tests.
    pub fn connector(mut self, connector: Arc<dyn StreamConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn build(self) -> Result<MeshClient> {
        let transport: Arc<dyn RequestTransport> = match self.transport {
            Some(t) => t,
            None => {
                let base = self.base_url.ok_or_else(|| {
                    MeshError::Config("base_url is required without a custom transport".into())
                })?;
                Arc::new(HttpTransport::new(base, self.config.connection_timeout)?)
            }
        };
        let connector: Arc<dyn StreamConnector> = match self.connector {
            Some(c) => c,
            None => {
                let url = self.stream_url.ok_or_else(|| {
                    MeshError::Config("stream_url is required without a custom connector".into())
                })?;
                Arc::new(WsConnector::new(url))
            }
        };

        let limiter = Arc::new(RateLimiter::new(self.config.rate_limit.clone()));
        let breaker = Arc::new(CircuitBreaker::new(self.config.circuit_breaker.clone()));
        let retry = RetryPolicy::new(self.config.retry.clone());
        let registry = Arc::new(SubscriptionRegistry::new());

        let executor = RequestExecutor::new(
            Arc::clone(&limiter),
            Arc::clone(&breaker),
            retry,
            transport,
            Arc::clone(&self.tokens),
            Arc::clone(&self.metrics),
        );
        let manager = ConnectionManager::new(
            self.config,
            connector,
            self.tokens,
            Arc::clone(&registry),
            self.metrics,
        );

        Ok(MeshClient {
            executor,
            manager,
            registry,
            limiter,
            breaker,
            cancel: Mutex::new(CancellationToken::new()),
        })
    }
}

impl Default for MeshClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Resilient client for the mesh control plane: guarded REST calls plus a
/// self-healing streaming channel.
pub struct MeshClient {
    executor: RequestExecutor,
    manager: ConnectionManager,
    registry: Arc<SubscriptionRegistry>,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    cancel: Mutex<CancellationToken>,
}

impl std::fmt::Debug for MeshClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshClient").finish_non_exhaustive()
    }
}

impl MeshClient {
    pub fn builder() -> MeshClientBuilder {
        MeshClientBuilder::new()
    }

    /// Bring up the streaming channel. Also revives the request path after
    /// an earlier `stop()`.
    pub async fn start(&self) -> Result<()> {
        {
            let mut cancel = self.cancel.lock();
            if cancel.is_cancelled() {
                *cancel = CancellationToken::new();
            }
        }
        self.manager.connect().await
    }

    /// Tear everything down. In-flight REST calls are cancelled, queued
    /// messages and subscriptions dropped. A later `start()` revives the
    /// client.
    pub async fn stop(&self) {
        self.cancel.lock().cancel();
        self.manager.disconnect().await;
    }

    /// Execute a REST call through the rate limiter, circuit breaker, and
    /// retry policy.
    pub async fn request(&self, request: CallRequest) -> Result<serde_json::Value> {
        let cancel = self.cancel.lock().clone();
        self.executor.call(request, &cancel).await
    }

    /// Execute a REST call and deserialize the response body.
    pub async fn request_as<T: serde::de::DeserializeOwned>(
        &self,
        request: CallRequest,
    ) -> Result<T> {
        let value = self.request(request).await?;
        serde_json::from_value(value).map_err(Into::into)
    }

    /// Subscribe to inbound envelopes on `topic`.
    pub fn on_message(&self, topic: impl Into<String>, subscriber: Subscriber) -> SubscriptionHandle {
        self.registry.subscribe(topic, subscriber)
    }

    /// Subscribe with a filter and/or delivery priority.
    pub fn on_message_with(
        &self,
        topic: impl Into<String>,
        subscriber: Subscriber,
        options: SubscribeOptions,
    ) -> SubscriptionHandle {
        self.registry.subscribe_with(topic, subscriber, options)
    }

    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.registry.unsubscribe(handle)
    }

    /// Queue an envelope on the streaming channel; returns the message id.
    pub fn send(&self, topic: impl Into<String>, payload: serde_json::Value) -> Result<String> {
        self.manager.send(topic, payload)
    }

    pub fn send_with_priority(
        &self,
        topic: impl Into<String>,
        payload: serde_json::Value,
        priority: i32,
    ) -> Result<String> {
        self.manager.send_with_priority(topic, payload, priority)
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn status(&self) -> ClientStatus {
        ClientStatus {
            connection: self.manager.state(),
            live_links: self.manager.live_links(),
            queued_messages: self.manager.queued_messages(),
            circuit: self.breaker.state(),
            rate_remaining: self.limiter.remaining(),
        }
    }
}

/// Decode an envelope payload into a typed value.
///
/// Subscribers receive raw [`Envelope`]s; this helper is the supported way
/// to lift the payload into a domain type.
pub fn decode_payload<T: serde::de::DeserializeOwned>(envelope: &Envelope) -> Result<T> {
    serde_json::from_value(envelope.payload.clone()).map_err(Into::into)
}
