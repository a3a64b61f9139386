//! HMAC-SHA256 JSON Web Token engine.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde_json::Value;
use tether_core::errors::AuthTokenError;
use tracing::debug;

use crate::decode::decode_unverified;
use crate::engine::{AuthEngine, SignOptions};

/// Default lifetime for tokens signed without an `exp` claim.
const DEFAULT_EXPIRY: Duration = Duration::from_secs(86_400);

/// Generate a random 256-bit secret, base64-encoded.
pub fn generate_key() -> String {
    let bytes: [u8; 32] = rand::random();
    STANDARD.encode(bytes)
}

/// Signs and verifies HS256 tokens with one shared secret.
pub struct JwtAuthEngine {
    encoding: EncodingKey,
    decoding: DecodingKey,
    default_expiry: Duration,
    leeway_secs: u64,
}

impl JwtAuthEngine {
    /// Engine keyed by `secret`.
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            default_expiry: DEFAULT_EXPIRY,
            leeway_secs: 0,
        }
    }

    /// Override the lifetime given to tokens without `exp`.
    #[must_use]
    pub fn with_default_expiry(mut self, expiry: Duration) -> Self {
        self.default_expiry = expiry;
        self
    }

    /// Accept `exp`/`nbf` up to `leeway_secs` seconds off.
    #[must_use]
    pub fn with_leeway(mut self, leeway_secs: u64) -> Self {
        self.leeway_secs = leeway_secs;
        self
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims = HashSet::new();
        validation.validate_nbf = true;
        validation.leeway = self.leeway_secs;
        validation
    }
}

#[async_trait]
impl AuthEngine for JwtAuthEngine {
    async fn sign(&self, claims: &Value, options: &SignOptions) -> Result<String, AuthTokenError> {
        let Value::Object(map) = claims else {
            return Err(AuthTokenError::Other(
                "auth token claims must be a JSON object".into(),
            ));
        };
        let mut map = map.clone();
        if !map.contains_key("exp") {
            let lifetime = options.expires_in.unwrap_or(self.default_expiry);
            let lifetime = i64::try_from(lifetime.as_secs()).unwrap_or(i64::MAX);
            let exp = chrono::Utc::now().timestamp().saturating_add(lifetime);
            let _ = map.insert("exp".into(), Value::from(exp));
        }
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &Value::Object(map), &self.encoding)
            .map_err(|e| AuthTokenError::Other(format!("failed to sign auth token: {e}")))
    }

    async fn verify(&self, token: &str) -> Result<Value, AuthTokenError> {
        match jsonwebtoken::decode::<Value>(token, &self.decoding, &self.validation()) {
            Ok(data) => Ok(data.claims),
            Err(e) => {
                debug!(error = %e, "auth token rejected");
                Err(match e.kind() {
                    ErrorKind::ExpiredSignature => AuthTokenError::Expired {
                        message: "jwt expired".into(),
                        expiry: decode_unverified(token)
                            .and_then(|claims| claims.get("exp").and_then(Value::as_i64)),
                    },
                    ErrorKind::ImmatureSignature => AuthTokenError::NotBefore {
                        message: "jwt not active".into(),
                    },
                    _ => AuthTokenError::Invalid(e.to_string()),
                })
            }
        }
    }
}
