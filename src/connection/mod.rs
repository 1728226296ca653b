//! Persistent streaming connections: pool lifecycle, reconnect with
//! exponential backoff, heartbeat liveness, and outbound queue draining.

pub mod manager;
pub mod transport;

pub use manager::{ConnectionManager, ConnectionState};
pub use transport::{Frame, FrameStream, StreamConnector, WsConnector};
