//! Token validation interface.
//!
//! Decoding bearer tokens is owned by the identity service; the gateway only
//! needs something that turns a token into an [`Identity`] or refuses to.

use async_trait::async_trait;
use orbit_protocol::Identity;
use thiserror::Error;

/// Why a token was refused.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No token was presented.
    #[error("Missing token")]
    MissingToken,

    /// The token is past its expiry.
    #[error("Token expired")]
    Expired,

    /// The token could not be decoded or its signature is wrong.
    #[error("Malformed token: {0}")]
    Malformed(String),

    /// The validator itself failed.
    #[error("Validator error: {0}")]
    Validator(String),

    /// Validation did not finish within the handshake deadline.
    #[error("Token validation timed out")]
    Timeout,
}

impl AuthError {
    /// Short label for logs and metrics.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            AuthError::MissingToken => "missing_token",
            AuthError::Expired => "expired",
            AuthError::Malformed(_) => "malformed",
            AuthError::Validator(_) => "validator",
            AuthError::Timeout => "timeout",
        }
    }
}

/// Decodes a bearer token into an identity.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// Decode `token`, failing if it is not acceptable.
    async fn decode(&self, token: &str) -> Result<Identity, AuthError>;
}
