//! Token acquisition collaborator.
//!
//! Token issuance/refresh lives outside this crate; callers hand the client
//! a provider and the executor asks it for a fresh value per outbound call.

use crate::{MeshError, Result};
use async_trait::async_trait;
use std::sync::Arc;

/// Supplies the bearer token attached to outbound calls.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Return the current token, or `None` for unauthenticated traffic.
    async fn token(&self) -> Result<Option<String>>;
}

/// Fixed token, never refreshed.
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Arc<Self> {
        Arc::new(Self { token: token.into() })
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Result<Option<String>> {
        if self.token.is_empty() {
            return Err(MeshError::Config("static token is empty".into()));
        }
        Ok(Some(self.token.clone()))
    }
}

/// No authentication.
pub struct NoAuth;

#[async_trait]
impl TokenProvider for NoAuth {
    async fn token(&self) -> Result<Option<String>> {
        Ok(None)
    }
}
