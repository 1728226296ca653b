//! Fixed-window token bucket guarding the request path.
//!
//! `max_requests` tokens per window, fully refilled when the window elapses.
//! No implicit queuing: an exhausted bucket rejects immediately and callers
//! needing queuing implement it above this layer.

use crate::config::RateLimitConfig;
use crate::{MeshError, Result};
use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Debug)]
struct Window {
    started_at: Instant,
    used: u32,
}

/// Token-bucket admission control for outbound request traffic.
pub struct RateLimiter {
    config: RateLimitConfig,
    window: Mutex<Window>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            window: Mutex::new(Window {
                started_at: Instant::now(),
                used: 0,
            }),
            config,
        }
    }

    /// Consume one token, or reject with `RateLimited`.
    ///
    /// The window resets lazily on the first acquisition after expiry, which
    /// gives the full budget back at every window boundary.
    pub fn try_acquire(&self) -> Result<()> {
        let mut window = self.window.lock();
        let now = Instant::now();
        if now.duration_since(window.started_at) >= self.config.per_window {
            window.started_at = now;
            window.used = 0;
        }
        if window.used >= self.config.max_requests {
            return Err(MeshError::RateLimited {
                max_requests: self.config.max_requests,
            });
        }
        window.used += 1;
        Ok(())
    }

    /// Tokens left in the current window.
    pub fn remaining(&self) -> u32 {
        let window = self.window.lock();
        if Instant::now().duration_since(window.started_at) >= self.config.per_window {
            return self.config.max_requests;
        }
        self.config.max_requests.saturating_sub(window.used)
    }
}
