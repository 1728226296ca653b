//! meshlink
//!
//! Resilient client library for the mesh control plane: REST calls guarded
//! by a rate limiter, circuit breaker, and retry policy, plus a streaming
//! channel with connection pooling, automatic reconnect, heartbeats, and an
//! offline message queue.
//!
//! ```no_run
//! use meshlink::{CallRequest, MeshClient};
//! use std::sync::Arc;
//!
//! # async fn run() -> meshlink::Result<()> {
//! let client = MeshClient::builder()
//!     .base_url("https://mesh.example.com/api")
//!     .stream_url("wss://mesh.example.com/ws")
//!     .token_provider(meshlink::StaticToken::new("secret"))
//!     .build()?;
//!
//! client.start().await?;
//! let handle = client.on_message("agent:update", Arc::new(|envelope: &meshlink::Envelope| {
//!     println!("update: {}", envelope.payload);
//!     Ok(())
//! }));
//! let agents = client.request(CallRequest::get("/agents")).await?;
//! client.unsubscribe(&handle);
//! client.stop().await;
//! # let _ = agents;
//! # Ok(())
//! # }
//! ```
//!
//! Messages queued while offline flush in FIFO order once a link is up.
//! With a connection pool larger than one, ordering holds per link only;
//! messages drained by different links may interleave on the server side.

pub mod auth;
pub mod breaker;
pub mod client;
pub mod config;
pub mod connection;
pub mod envelope;
pub mod error;
pub mod executor;
pub mod limiter;
pub mod queue;
pub mod registry;
pub mod retry;
pub mod telemetry;

pub use auth::{NoAuth, StaticToken, TokenProvider};
pub use breaker::{CircuitBreaker, CircuitState};
pub use client::{decode_payload, ClientStatus, MeshClient, MeshClientBuilder};
pub use config::{CircuitBreakerConfig, LinkConfig, RateLimitConfig, RetryConfig};
pub use connection::{ConnectionManager, ConnectionState, StreamConnector, WsConnector};
pub use envelope::{Codec, Envelope, TOPIC_ERROR, TOPIC_HEARTBEAT, TOPIC_STATUS};
pub use error::MeshError;
pub use executor::{CallRequest, HttpTransport, RequestExecutor, RequestTransport};
pub use limiter::RateLimiter;
pub use queue::OutboundQueue;
pub use registry::{
    SubscribeOptions, Subscriber, SubscriptionHandle, SubscriptionRegistry,
};
pub use retry::RetryPolicy;
pub use telemetry::{ConnectionEvent, MetricsSink, NullSink, RequestMetrics, TracingSink};

pub type Result<T> = std::result::Result<T, MeshError>;
