//! Server and per-socket notifications.
//!
//! Server notifications go to [`Server::listener`](crate::Server::listener)
//! under [`ServerEvent::name`]; per-socket notifications go to
//! [`ServerSocket::listener`](crate::ServerSocket::listener) under
//! [`SocketEvent::name`].

use chrono::{DateTime, Utc};
use serde_json::Value;
use tether_core::errors::WireError;
use tether_core::ids::SocketId;

/// What happened on the server.
#[derive(Clone, Debug, PartialEq)]
pub enum ServerEventKind {
    /// A transport connection was accepted and a socket created.
    Handshake {
        /// New socket.
        socket_id: SocketId,
    },
    /// A socket completed its `#handshake`.
    Connection {
        /// Socket.
        socket_id: SocketId,
        /// Whether the presented token was accepted.
        is_authenticated: bool,
    },
    /// An open socket closed.
    Disconnection {
        /// Socket.
        socket_id: SocketId,
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// A socket closed before completing its handshake.
    ConnectionAbort {
        /// Socket.
        socket_id: SocketId,
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// Any socket closed; follows `Disconnection` or `ConnectionAbort`.
    Closure {
        /// Socket.
        socket_id: SocketId,
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// A socket joined a channel.
    Subscription {
        /// Socket.
        socket_id: SocketId,
        /// Channel.
        channel: String,
    },
    /// A socket left a channel.
    Unsubscription {
        /// Socket.
        socket_id: SocketId,
        /// Channel.
        channel: String,
    },
    /// A socket became authenticated (or renewed its token).
    Authentication {
        /// Socket.
        socket_id: SocketId,
        /// Verified claims.
        auth_token: Value,
    },
    /// A socket dropped its token.
    Deauthentication {
        /// Socket.
        socket_id: SocketId,
        /// Claims the socket held.
        old_auth_token: Option<Value>,
    },
    /// A socket presented a token that failed verification.
    BadSocketAuthToken {
        /// Socket.
        socket_id: SocketId,
        /// Verification failure.
        error: WireError,
    },
    /// A non-fatal problem: a blocked action, a malformed frame, a failed
    /// send.
    Warning {
        /// Socket involved, if any.
        socket_id: Option<SocketId>,
        /// What went wrong.
        error: WireError,
    },
}

/// A timestamped server notification.
#[derive(Clone, Debug, PartialEq)]
pub struct ServerEvent {
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// What happened.
    pub kind: ServerEventKind,
}

impl ServerEvent {
    /// Stamp `kind` with the current time.
    pub fn now(kind: ServerEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Listener stream name for this event.
    pub fn name(&self) -> &'static str {
        match self.kind {
            ServerEventKind::Handshake { .. } => "handshake",
            ServerEventKind::Connection { .. } => "connection",
            ServerEventKind::Disconnection { .. } => "disconnection",
            ServerEventKind::ConnectionAbort { .. } => "connectionAbort",
            ServerEventKind::Closure { .. } => "closure",
            ServerEventKind::Subscription { .. } => "subscription",
            ServerEventKind::Unsubscription { .. } => "unsubscription",
            ServerEventKind::Authentication { .. } => "authentication",
            ServerEventKind::Deauthentication { .. } => "deauthentication",
            ServerEventKind::BadSocketAuthToken { .. } => "badSocketAuthToken",
            ServerEventKind::Warning { .. } => "warning",
        }
    }

    /// Socket the event concerns.
    pub fn socket_id(&self) -> Option<&SocketId> {
        match &self.kind {
            ServerEventKind::Handshake { socket_id }
            | ServerEventKind::Connection { socket_id, .. }
            | ServerEventKind::Disconnection { socket_id, .. }
            | ServerEventKind::ConnectionAbort { socket_id, .. }
            | ServerEventKind::Closure { socket_id, .. }
            | ServerEventKind::Subscription { socket_id, .. }
            | ServerEventKind::Unsubscription { socket_id, .. }
            | ServerEventKind::Authentication { socket_id, .. }
            | ServerEventKind::Deauthentication { socket_id, .. }
            | ServerEventKind::BadSocketAuthToken { socket_id, .. } => Some(socket_id),
            ServerEventKind::Warning { socket_id, .. } => socket_id.as_ref(),
        }
    }
}

/// A per-socket notification.
#[derive(Clone, Debug, PartialEq)]
pub enum SocketEvent {
    /// The handshake completed.
    Connect {
        /// Whether the presented token was accepted.
        is_authenticated: bool,
    },
    /// The open socket closed.
    Disconnect {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// The socket closed before its handshake completed.
    ConnectAbort {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// The socket closed; follows `Disconnect` or `ConnectAbort`.
    Close {
        /// Close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
    /// The error behind an abnormal close, or a non-fatal failure.
    Error {
        /// The error.
        error: WireError,
    },
    /// A token was applied to the socket.
    Authenticate {
        /// Signed token now held.
        signed_token: String,
    },
    /// The socket dropped its token.
    Deauthenticate {
        /// Signed token held before.
        old_signed_token: Option<String>,
    },
    /// The socket joined a channel.
    Subscribe {
        /// Channel.
        channel: String,
    },
    /// The socket left a channel.
    Unsubscribe {
        /// Channel.
        channel: String,
    },
}

impl SocketEvent {
    /// Listener stream name for this event.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect { .. } => "connect",
            Self::Disconnect { .. } => "disconnect",
            Self::ConnectAbort { .. } => "connectAbort",
            Self::Close { .. } => "close",
            Self::Error { .. } => "error",
            Self::Authenticate { .. } => "authenticate",
            Self::Deauthenticate { .. } => "deauthenticate",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
        }
    }
}
