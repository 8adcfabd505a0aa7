//! Token-verification collaborator boundary.
//!
//! Connection establishment hands the presented token to a
//! [`TokenVerifier`]; a rejected token means the connection is refused
//! and no registry entry is ever created. Token issuance and the
//! verification internals live outside this crate.

use async_trait::async_trait;

/// Authenticated identity, as registered in the connection registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Registry key for this identity.
    pub id: String,
}

/// Identity verification failed; the connection is rejected.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing credentials")]
    MissingToken,

    #[error("token rejected: {0}")]
    InvalidToken(String),
}

/// Verifies a presented token and resolves the identity behind it.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Verify `token`, returning the identity it proves.
    async fn verify(&self, token: &str) -> Result<Identity, AuthError>;
}
