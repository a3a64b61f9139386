//! Connection and authentication state shared by both ends.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of one physical connection.
///
/// Transitions only `Connecting → Open → Closed` or `Connecting → Closed`;
/// a reconnect starts a new `Connecting` cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    /// Link requested, handshake not yet complete.
    Connecting,
    /// Handshake complete.
    Open,
    /// No live link.
    Closed,
}

impl ConnectionState {
    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authentication state, independent of the connection state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthState {
    /// A verified token is held.
    Authenticated,
    /// No token, or the token was rejected.
    #[default]
    Unauthenticated,
}

impl AuthState {
    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Authenticated => "authenticated",
            Self::Unauthenticated => "unauthenticated",
        }
    }
}

impl fmt::Display for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
