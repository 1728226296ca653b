//! Streaming transport seam.
//!
//! The manager drives any [`FrameStream`]; production traffic goes over
//! WebSocket via [`WsConnector`], tests plug in channel-backed streams.

use crate::{MeshError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// One frame on a streaming link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Ping,
    Pong,
    Close,
}

/// A bidirectional frame-oriented stream.
#[async_trait]
pub trait FrameStream: Send {
    async fn send(&mut self, frame: Frame) -> Result<()>;
    /// Next inbound frame; `None` once the stream has ended.
    async fn next_frame(&mut self) -> Option<Result<Frame>>;
    async fn close(&mut self);
}

/// Opens streaming links on demand.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self, token: Option<&str>) -> Result<Box<dyn FrameStream>>;
}

/// WebSocket connector for the control-plane streaming endpoint.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl StreamConnector for WsConnector {
    async fn connect(&self, token: Option<&str>) -> Result<Box<dyn FrameStream>> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| MeshError::Config(format!("invalid stream url: {}", e)))?;

        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| MeshError::Config(format!("invalid auth token: {}", e)))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (stream, _response) = connect_async(request)
            .await
            .map_err(|e| MeshError::Connection(format!("websocket connect failed: {}", e)))?;

        Ok(Box::new(WsFrameStream { inner: stream }))
    }
}

struct WsFrameStream {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FrameStream for WsFrameStream {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let message = match frame {
            Frame::Text(text) => WsMessage::Text(text.into()),
            Frame::Ping => WsMessage::Ping(Bytes::new()),
            Frame::Pong => WsMessage::Pong(Bytes::new()),
            Frame::Close => {
                let _ = self.inner.close(None).await;
                return Ok(());
            }
        };
        self.inner
            .send(message)
            .await
            .map_err(|e| MeshError::Connection(format!("websocket send failed: {}", e)))
    }

    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        loop {
            let message = match self.inner.next().await? {
                Ok(m) => m,
                Err(e) => {
                    return Some(Err(MeshError::Connection(format!(
                        "websocket error: {}",
                        e
                    ))))
                }
            };
            return Some(Ok(match message {
                WsMessage::Text(text) => Frame::Text(text.to_string()),
                WsMessage::Binary(data) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => Frame::Text(text),
                    Err(_) => {
                        return Some(Err(MeshError::Codec(
                            "binary frame is not valid UTF-8".into(),
                        )))
                    }
                },
                WsMessage::Ping(_) => Frame::Ping,
                WsMessage::Pong(_) => Frame::Pong,
                WsMessage::Close(_) => Frame::Close,
                // Raw frames never surface from a configured client stream.
                WsMessage::Frame(_) => continue,
            }));
        }
    }

    async fn close(&mut self) {
        let _ = self.inner.close(None).await;
    }
}
