//! Client connection settings.

use serde::{Deserialize, Serialize};
use tether_core::backoff::ReconnectPolicy;

/// Settings for one client session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientSettings {
    /// WebSocket URI of the server endpoint.
    pub uri: String,
    /// Milliseconds an invoke waits for its response.
    pub ack_timeout_ms: u64,
    /// Milliseconds allowed for the link plus the handshake.
    pub connect_timeout_ms: u64,
    /// Connect on construction and when sending while closed.
    pub auto_connect: bool,
    /// Reconnect after unexpected closes.
    pub auto_reconnect: bool,
    /// Reconnect backoff parameters.
    pub reconnect: ReconnectPolicy,
    /// Resubscribe pending channels as soon as the handshake completes.
    pub auto_subscribe_on_connect: bool,
    /// Never close for lack of server pings.
    pub ping_timeout_disabled: bool,
    /// Batch every outbound envelope for a window after each handshake.
    pub batch_on_handshake: bool,
    /// Length of that window in milliseconds.
    pub batch_on_handshake_duration_ms: u64,
    /// Delay before a batch is flushed, in milliseconds (0 = next scheduler turn).
    pub batch_interval_ms: u64,
    /// Key the signed token is stored under.
    pub auth_token_name: String,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            uri: "ws://127.0.0.1:8000/ws".to_string(),
            ack_timeout_ms: 10_000,
            connect_timeout_ms: 20_000,
            auto_connect: true,
            auto_reconnect: true,
            reconnect: ReconnectPolicy::default(),
            auto_subscribe_on_connect: true,
            ping_timeout_disabled: false,
            batch_on_handshake: false,
            batch_on_handshake_duration_ms: 100,
            batch_interval_ms: 0,
            auth_token_name: "tether.authToken".to_string(),
        }
    }
}

impl ClientSettings {
    /// Defaults pointing at `uri`.
    pub fn for_uri(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            ..Self::default()
        }
    }
}
