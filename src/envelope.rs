//! Wire envelope and codec for the streaming channel.
//!
//! One JSON object per frame. The `type` field doubles as the routing topic.
//! Payloads above [`COMPRESSION_THRESHOLD`] are deflate-compressed and
//! carried base64-encoded, flagged via `compressed`; compression is skipped
//! when it does not actually shrink the payload.

use crate::{MeshError, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Payloads smaller than this are never compressed.
pub const COMPRESSION_THRESHOLD: usize = 512;

/// Reserved topic carrying connected/disconnected notifications.
pub const TOPIC_STATUS: &str = "connection:status";
/// Reserved topic carrying heartbeat frames.
pub const TOPIC_HEARTBEAT: &str = "connection:heartbeat";
/// Reserved topic carrying connection-level errors.
pub const TOPIC_ERROR: &str = "connection:error";

/// A unit exchanged over the streaming channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Routing topic; serialized as `type` on the wire.
    #[serde(rename = "type")]
    pub topic: String,
    pub payload: serde_json::Value,
    pub id: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub compressed: bool,
    pub priority: i32,
}

impl Envelope {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value, id: String) -> Self {
        Self {
            topic: topic.into(),
            payload,
            id,
            timestamp: now_ms(),
            compressed: false,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Monotonic message id source, one per connection manager instance.
///
/// Ids are never reused: the sequence counter only moves forward.
pub struct MessageIdGen {
    prefix: String,
    counter: AtomicU64,
}

impl MessageIdGen {
    pub fn new() -> Self {
        let prefix = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        Self {
            prefix,
            counter: AtomicU64::new(0),
        }
    }

    /// Next id and its sequence number.
    pub fn next(&self) -> (String, u64) {
        let seq = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        (format!("{}-{}", self.prefix, seq), seq)
    }
}

impl Default for MessageIdGen {
    fn default() -> Self {
        Self::new()
    }
}

/// Envelope (de)serializer with optional payload compression.
#[derive(Debug, Clone)]
pub struct Codec {
    use_compression: bool,
    max_message_size: usize,
}

impl Codec {
    pub fn new(use_compression: bool, max_message_size: usize) -> Self {
        Self {
            use_compression,
            max_message_size,
        }
    }

    /// Serialize one envelope to a wire frame.
    pub fn encode(&self, envelope: &Envelope) -> Result<String> {
        let mut frame = envelope.clone();
        frame.compressed = false;

        if self.use_compression {
            let payload_json = serde_json::to_vec(&frame.payload)?;
            if payload_json.len() >= COMPRESSION_THRESHOLD {
                let compressed = deflate(&payload_json)?;
                let encoded = BASE64.encode(&compressed);
                // Keep the original when compression does not pay off.
                if encoded.len() < payload_json.len() {
                    frame.payload = serde_json::Value::String(encoded);
                    frame.compressed = true;
                }
            }
        }

        let text = serde_json::to_string(&frame)?;
        if text.len() > self.max_message_size {
            return Err(MeshError::Codec(format!(
                "encoded frame is {} bytes, exceeds limit of {}",
                text.len(),
                self.max_message_size
            )));
        }
        Ok(text)
    }

    /// Parse one wire frame, transparently decompressing the payload.
    pub fn decode(&self, text: &str) -> Result<Envelope> {
        if text.len() > self.max_message_size {
            return Err(MeshError::Codec(format!(
                "inbound frame is {} bytes, exceeds limit of {}",
                text.len(),
                self.max_message_size
            )));
        }

        let mut envelope: Envelope = serde_json::from_str(text)?;
        if envelope.compressed {
            let encoded = envelope.payload.as_str().ok_or_else(|| {
                MeshError::Codec("compressed payload is not a base64 string".into())
            })?;
            let compressed = BASE64
                .decode(encoded)
                .map_err(|e| MeshError::Codec(format!("invalid base64 payload: {}", e)))?;
            let raw = inflate(&compressed, self.max_message_size)?;
            envelope.payload = serde_json::from_slice(&raw)?;
            envelope.compressed = false;
        }
        Ok(envelope)
    }
}

fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::fast());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map_err(|e| MeshError::Codec(format!("deflate failed: {}", e)))
}

fn inflate(data: &[u8], limit: usize) -> Result<Vec<u8>> {
    let mut decoder = DeflateDecoder::new(data).take(limit as u64 + 1);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| MeshError::Codec(format!("inflate failed: {}", e)))?;
    if out.len() > limit {
        return Err(MeshError::Codec(format!(
            "decompressed payload exceeds limit of {} bytes",
            limit
        )));
    }
    Ok(out)
}
