//! Session notifications.
//!
//! Every notification is written to the client's listener stream under the
//! name returned by [`ClientEvent::name`], so `client.listener("connect")`
//! yields only [`ClientEvent::Connect`] records.

use serde_json::Value;
use tether_core::errors::WireError;
use tether_core::ids::SocketId;
use tether_core::state::AuthState;

use crate::channel::ChannelState;

/// A client lifecycle notification.
#[derive(Clone, Debug, PartialEq)]
pub enum ClientEvent {
    /// A connection attempt started.
    Connecting,
    /// The handshake completed.
    Connect {
        /// Socket id assigned by the server.
        id: SocketId,
        /// Ping timeout announced by the server, in milliseconds.
        ping_timeout_ms: u64,
        /// Whether the stored token was accepted.
        is_authenticated: bool,
        /// Why the stored token was rejected.
        auth_error: Option<WireError>,
    },
    /// A connection closed before its handshake completed.
    ConnectAbort {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// An open connection closed.
    Disconnect {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// Any connection closed; follows `ConnectAbort` or `Disconnect`.
    Close {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// A non-fatal error, or the error that caused an abnormal close.
    Error {
        /// The error.
        error: WireError,
    },
    /// Auth state flipped.
    AuthStateChange {
        /// Previous state.
        old: AuthState,
        /// New state.
        new: AuthState,
    },
    /// A token was confirmed by the server. Fires on every confirmation.
    Authenticate {
        /// The confirmed token.
        signed_token: String,
    },
    /// The client became unauthenticated.
    Deauthenticate {
        /// Token held before the change.
        old_signed_token: Option<String>,
    },
    /// The stored token was removed.
    RemoveAuthToken {
        /// Token that was removed.
        old_token: Option<String>,
    },
    /// A `#subscribe` negotiation was sent.
    SubscribeRequest {
        /// Channel name.
        channel: String,
    },
    /// A channel became subscribed.
    Subscribe {
        /// Channel name.
        channel: String,
    },
    /// A channel negotiation failed and the channel was removed.
    SubscribeFail {
        /// Channel name.
        channel: String,
        /// Failure reported for the negotiation.
        error: WireError,
    },
    /// A channel changed state.
    SubscribeStateChange {
        /// Channel name.
        channel: String,
        /// Previous state.
        old: ChannelState,
        /// New state.
        new: ChannelState,
    },
    /// A subscribed channel was removed.
    Unsubscribe {
        /// Channel name.
        channel: String,
    },
    /// The server removed this client from a channel.
    KickOut {
        /// Channel name.
        channel: String,
        /// Server-supplied explanation.
        message: Option<String>,
    },
    /// An unsolicited `#publish` payload for an unknown channel, or any
    /// other inbound traffic the session could not route.
    Unrouted {
        /// Event name.
        event: String,
        /// Payload.
        data: Value,
    },
}

impl ClientEvent {
    /// Listener stream name for this notification.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connect { .. } => "connect",
            Self::ConnectAbort { .. } => "connectAbort",
            Self::Disconnect { .. } => "disconnect",
            Self::Close { .. } => "close",
            Self::Error { .. } => "error",
            Self::AuthStateChange { .. } => "authStateChange",
            Self::Authenticate { .. } => "authenticate",
            Self::Deauthenticate { .. } => "deauthenticate",
            Self::RemoveAuthToken { .. } => "removeAuthToken",
            Self::SubscribeRequest { .. } => "subscribeRequest",
            Self::Subscribe { .. } => "subscribe",
            Self::SubscribeFail { .. } => "subscribeFail",
            Self::SubscribeStateChange { .. } => "subscribeStateChange",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::KickOut { .. } => "kickOut",
            Self::Unrouted { .. } => "unrouted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_camel_case() {
        let events = [
            ClientEvent::Connecting,
            ClientEvent::ConnectAbort {
                code: 4007,
                reason: String::new(),
            },
            ClientEvent::SubscribeStateChange {
                channel: "a".into(),
                old: ChannelState::Pending,
                new: ChannelState::Subscribed,
            },
        ];
        let names: Vec<_> = events.iter().map(ClientEvent::name).collect();
        assert_eq!(names, ["connecting", "connectAbort", "subscribeStateChange"]);
    }
}
