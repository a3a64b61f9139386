//! Error hierarchy shared by both ends of a connection.
//!
//! - [`WireError`]: the `{name, message}` form every error takes on the wire
//! - [`ProtocolError`]: malformed or disallowed envelopes and event names
//! - [`AuthTokenError`]: token verification and signing failures
//! - [`BadConnectionError`]: a call aborted because its connection was lost
//! - [`TimeoutError`]: a call whose response did not arrive in time
//! - [`InvalidActionError`]: an action attempted in the wrong state
//! - [`SilentlyBlockedError`]: a middleware rejection that raises no warning
//! - [`SocketProtocolError`]: a connection closed with a non-normal code
//! - [`BrokerError`]: publish/subscribe backend failures
//! - [`TransportError`]: the physical link could not be used
//! - [`CallError`]: the union every pending call can be rejected with

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::codec::CodecError;

// ─────────────────────────────────────────────────────────────────────────────
// WireError
// ─────────────────────────────────────────────────────────────────────────────

/// An error as it travels inside a response envelope or an `error` event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    /// Error class name (e.g. `"TimeoutError"`).
    pub name: String,
    /// Human-readable message.
    pub message: String,
    /// Optional structured payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl WireError {
    /// Create a wire error from a class name and message.
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            data: None,
        }
    }

    /// Attach a structured payload.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Decode a wire error leniently.
    ///
    /// Peers sometimes send a bare string or an object missing fields; those
    /// are mapped to a generic `"Error"` rather than rejected.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::String(message) => Self::new("Error", message),
            Value::Object(ref map) => {
                let name = map
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or("Error")
                    .to_string();
                let message = map
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let data = map.get("data").cloned();
                Self {
                    name,
                    message,
                    data,
                }
            }
            other => Self::new("Error", other.to_string()),
        }
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.message)
    }
}

impl std::error::Error for WireError {}

// ─────────────────────────────────────────────────────────────────────────────
// Protocol
// ─────────────────────────────────────────────────────────────────────────────

/// An envelope or event name that violates the protocol.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The frame did not decode into a valid envelope.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Application code tried to use a `#`-prefixed event name.
    #[error("event name {0:?} is reserved")]
    ReservedEvent(String),

    /// A reserved event arrived that this side does not accept.
    #[error("unexpected reserved event {0:?}")]
    UnexpectedAction(String),

    /// A reserved event carried a payload of the wrong shape.
    #[error("invalid {event} payload: {reason}")]
    InvalidPayload {
        /// The reserved event name.
        event: String,
        /// What was wrong with it.
        reason: String,
    },
}

impl ProtocolError {
    /// Shorthand for [`ProtocolError::InvalidPayload`].
    pub fn invalid_payload(event: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            event: event.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<&ProtocolError> for WireError {
    fn from(err: &ProtocolError) -> Self {
        Self::new("ProtocolError", err.to_string())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Auth tokens
// ─────────────────────────────────────────────────────────────────────────────

/// A token could not be verified or signed.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum AuthTokenError {
    /// The token's `exp` claim is in the past.
    #[error("{message}")]
    Expired {
        /// Human-readable message.
        message: String,
        /// Expiry as a unix timestamp, when known.
        expiry: Option<i64>,
    },

    /// The token's `nbf` claim is in the future.
    #[error("{message}")]
    NotBefore {
        /// Human-readable message.
        message: String,
    },

    /// The token is malformed or its signature does not verify.
    #[error("{0}")]
    Invalid(String),

    /// Any other token failure (signing, storage).
    #[error("{0}")]
    Other(String),
}

impl AuthTokenError {
    /// Wire name of this error class.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Expired { .. } => "AuthTokenExpiredError",
            Self::NotBefore { .. } => "AuthTokenNotBeforeError",
            Self::Invalid(_) => "AuthTokenInvalidError",
            Self::Other(_) => "AuthTokenError",
        }
    }
}

impl From<&AuthTokenError> for WireError {
    fn from(err: &AuthTokenError) -> Self {
        let wire = Self::new(err.name(), err.to_string());
        match err {
            AuthTokenError::Expired {
                expiry: Some(exp), ..
            } => wire.with_data(serde_json::json!({ "expiry": exp })),
            _ => wire,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Call failures
// ─────────────────────────────────────────────────────────────────────────────

/// How a connection was lost.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionLossKind {
    /// An open connection closed.
    Disconnect,
    /// A connection closed before it finished opening.
    ConnectAbort,
}

impl ConnectionLossKind {
    /// Lowercase camel name as it appears in error messages.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnect => "disconnect",
            Self::ConnectAbort => "connectAbort",
        }
    }
}

impl fmt::Display for ConnectionLossKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A pending call was aborted because its connection was lost.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("event {event:?} was aborted due to a bad connection ({kind})")]
pub struct BadConnectionError {
    /// Event name of the aborted call.
    pub event: String,
    /// Whether the connection had been open.
    pub kind: ConnectionLossKind,
}

/// A pending invoke did not receive its response within the ack timeout.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("event response for {event:?} timed out")]
pub struct TimeoutError {
    /// Event name of the expired call.
    pub event: String,
}

/// An action was attempted in a state that does not permit it.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct InvalidActionError(pub String);

/// An action was rejected by middleware that asked not to raise a warning.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("the {action} action was blocked by middleware")]
pub struct SilentlyBlockedError {
    /// Middleware category that blocked the action.
    pub action: String,
}

/// A connection closed with a code outside the ignore list.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{message} (code {code})")]
pub struct SocketProtocolError {
    /// Close code.
    pub code: u16,
    /// Catalogued description of the code, or the peer's reason.
    pub message: String,
}

/// Publish/subscribe backend failure.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// The broker has shut down.
    #[error("broker is closed")]
    Closed,
    /// The broker refused the operation.
    #[error("broker rejected {operation} on {channel:?}: {reason}")]
    Rejected {
        /// `subscribe`, `unsubscribe` or `publish`.
        operation: &'static str,
        /// Channel the operation targeted.
        channel: String,
        /// Why it was refused.
        reason: String,
    },
}

/// The physical link could not be established or used.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Connecting to the peer failed.
    #[error("failed to connect to {uri}: {reason}")]
    Connect {
        /// Target URI.
        uri: String,
        /// Underlying failure.
        reason: String,
    },
    /// The link has already closed.
    #[error("link is closed")]
    Closed,
}

/// Why a pending call failed.
#[derive(Clone, Debug, PartialEq, Error)]
pub enum CallError {
    /// No response within the ack timeout.
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    /// The connection was lost before the response arrived.
    #[error(transparent)]
    BadConnection(#[from] BadConnectionError),
    /// The peer answered with an error.
    #[error(transparent)]
    Remote(#[from] WireError),
    /// The call itself was not allowed by the protocol.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    /// The call was attempted in a state that does not permit it.
    #[error(transparent)]
    InvalidAction(#[from] InvalidActionError),
    /// The payload could not be encoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// The transport refused the frame.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl CallError {
    /// Wire name of this error class.
    pub fn name(&self) -> &str {
        match self {
            Self::Timeout(_) => "TimeoutError",
            Self::BadConnection(_) => "BadConnectionError",
            Self::Remote(e) => &e.name,
            Self::Protocol(_) => "ProtocolError",
            Self::InvalidAction(_) => "InvalidActionError",
            Self::Codec(_) => "CodecError",
            Self::Transport(_) => "TransportError",
        }
    }

    /// Whether this failure came from losing the connection.
    pub fn is_bad_connection(&self) -> bool {
        matches!(self, Self::BadConnection(_))
    }
}

impl From<&CallError> for WireError {
    fn from(err: &CallError) -> Self {
        match err {
            CallError::Remote(e) => e.clone(),
            other => Self::new(other.name(), other.to_string()),
        }
    }
}

impl From<&InvalidActionError> for WireError {
    fn from(err: &InvalidActionError) -> Self {
        Self::new("InvalidActionError", err.to_string())
    }
}

impl From<&SilentlyBlockedError> for WireError {
    fn from(err: &SilentlyBlockedError) -> Self {
        Self::new("SilentMiddlewareBlockedError", err.to_string())
    }
}

impl From<&BrokerError> for WireError {
    fn from(err: &BrokerError) -> Self {
        Self::new("BrokerError", err.to_string())
    }
}

impl From<&SocketProtocolError> for WireError {
    fn from(err: &SocketProtocolError) -> Self {
        Self::new("SocketProtocolError", err.message.clone())
            .with_data(serde_json::json!({ "code": err.code }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
