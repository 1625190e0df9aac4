//! Authentication at connection establishment.
//!
//! Tokens arrive as the `Authorization` query parameter on the WebSocket
//! handshake and are verified exactly once; frames after `$connect` ride
//! on the connection's established principal. The verifier implementation
//! is external; the gateway consumes this capability trait only.

use async_trait::async_trait;
use switchproto::{now_secs, ErrorDetail};
use thiserror::Error;

/// Verified principal attached to a connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Claims {
    pub user_id: String,
    pub tenant_id: String,
    pub permissions: Vec<String>,
    /// Unix seconds.
    pub expires_at: u64,
}

impl Claims {
    pub fn is_expired(&self) -> bool {
        now_secs() >= self.expires_at
    }
}

#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("missing authorization token")]
    MissingToken,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token expired")]
    Expired,
}

impl AuthError {
    pub fn to_detail(&self) -> ErrorDetail {
        ErrorDetail::unauthorized(self.to_string())
    }
}

/// Token verification capability consumed at `$connect`.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Claims, AuthError>;
}

/// Development-only verifier: accepts `user:tenant` or
/// `user:tenant:perm1|perm2` tokens so local clients can connect without a
/// real identity provider. Never deploy this.
pub struct DevTokenVerifier;

#[async_trait]
impl TokenVerifier for DevTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let mut parts = token.splitn(3, ':');
        let user_id = parts.next().unwrap_or_default();
        let tenant_id = parts.next().unwrap_or_default();
        if user_id.is_empty() || tenant_id.is_empty() {
            return Err(AuthError::InvalidToken(
                "expected user:tenant[:permissions]".to_string(),
            ));
        }
        let permissions = parts
            .next()
            .map(|perms| perms.split('|').map(str::to_string).collect())
            .unwrap_or_default();

        Ok(Claims {
            user_id: user_id.to_string(),
            tenant_id: tenant_id.to_string(),
            permissions,
            expires_at: now_secs() + 24 * 3600,
        })
    }
}
