//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase")]` and `#[serde(default)]`,
//! so partial JSON is accepted and missing fields take their compiled default.

mod client;
mod server;

pub use client::*;
pub use server::*;

use serde::{Deserialize, Serialize};

/// Root settings type.
///
/// Loaded from `~/.tether/settings.json` with defaults applied for missing
/// fields. Environment variables can override specific values.
///
/// ```json
/// {
///   "server": { "port": 9000, "pingIntervalMs": 5000 },
///   "client": { "uri": "ws://127.0.0.1:9000/ws" }
/// }
/// ```
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TetherSettings {
    /// Server settings.
    pub server: ServerSettings,
    /// Client settings.
    pub client: ClientSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_is_default() {
        let s: TetherSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(s, TetherSettings::default());
    }

    #[test]
    fn sections_serialize_camel_case() {
        let json = serde_json::to_value(TetherSettings::default()).unwrap();
        assert!(json["server"].get("handshakeTimeoutMs").is_some());
        assert!(json["client"].get("autoSubscribeOnConnect").is_some());
        assert!(json["logging"].get("level").is_some());
    }
}
