//! Server and logging settings.

use serde::{Deserialize, Serialize};

/// Server network and protocol settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (0 for auto-assign).
    pub port: u16,
    /// Path of the WebSocket endpoint.
    pub path: String,
    /// Milliseconds between `#1` pings.
    pub ping_interval_ms: u64,
    /// Milliseconds a socket may stay silent before it is closed with 4001.
    pub ping_timeout_ms: u64,
    /// Never close sockets for lack of pongs.
    pub ping_timeout_disabled: bool,
    /// Milliseconds a server-side invoke waits for its response.
    pub ack_timeout_ms: u64,
    /// Milliseconds a new socket has to send `#handshake`.
    pub handshake_timeout_ms: u64,
    /// HMAC secret for auth tokens. A random key is generated when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_key: Option<String>,
    /// Lifetime in seconds given to tokens that carry no `exp` claim.
    pub auth_default_expiry_secs: u64,
    /// Whether clients may publish to channels.
    pub allow_client_publish: bool,
    /// Whether middleware rejections raise `warning` events.
    pub middleware_emit_warnings: bool,
    /// Accepted `Origin` header values; empty accepts any origin.
    pub allowed_origins: Vec<String>,
    /// Capacity of the in-process broker's publication queue.
    pub broker_capacity: usize,
    /// Milliseconds graceful shutdown waits for sessions to drain.
    pub shutdown_timeout_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            path: "/ws".to_string(),
            ping_interval_ms: 8_000,
            ping_timeout_ms: 20_000,
            ping_timeout_disabled: false,
            ack_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            auth_key: None,
            auth_default_expiry_secs: 86_400,
            allow_client_publish: true,
            middleware_emit_warnings: true,
            allowed_origins: Vec::new(),
            broker_capacity: 1024,
            shutdown_timeout_ms: 30_000,
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults() {
        let s = ServerSettings::default();
        assert_eq!(s.port, 8000);
        assert_eq!(s.path, "/ws");
        assert_eq!(s.ping_interval_ms, 8_000);
        assert_eq!(s.ping_timeout_ms, 20_000);
        assert!(s.auth_key.is_none());
        assert!(s.allow_client_publish);
        assert!(s.allowed_origins.is_empty());
    }

    #[test]
    fn auth_key_omitted_when_absent() {
        let json = serde_json::to_value(ServerSettings::default()).unwrap();
        assert!(json.get("authKey").is_none());
        assert_eq!(json["pingIntervalMs"], 8_000);
    }

    #[test]
    fn logging_defaults() {
        let l = LoggingSettings::default();
        assert_eq!(l.level, "info");
        assert!(!l.json);
    }
}
