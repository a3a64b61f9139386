//! Signer/verifier seam.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tether_core::errors::AuthTokenError;

/// Per-token signing options.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SignOptions {
    /// Lifetime applied when the claims carry no `exp`. `None` falls back
    /// to the engine's default.
    pub expires_in: Option<Duration>,
}

/// Signs claims into tokens and verifies tokens back into claims.
#[async_trait]
pub trait AuthEngine: Send + Sync {
    /// Sign `claims` (a JSON object) into a token string.
    async fn sign(&self, claims: &Value, options: &SignOptions) -> Result<String, AuthTokenError>;

    /// Verify `token` and return its claims.
    async fn verify(&self, token: &str) -> Result<Value, AuthTokenError>;
}
