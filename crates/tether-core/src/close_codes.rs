//! Connection close codes and their catalogued meanings.
//!
//! Codes below 4000 are the standard WebSocket ones; 4000–4009 are the
//! protocol's own. Codes at or above [`PERMANENT_THRESHOLD`] are application
//! codes that suppress automatic reconnection.

/// Normal closure.
pub const NORMAL: u16 = 1000;
/// Endpoint going away.
pub const GOING_AWAY: u16 = 1001;
/// Closed without a status code.
pub const NO_STATUS: u16 = 1005;
/// Transport hung up without a close frame.
pub const ABNORMAL: u16 = 1006;
/// Client saw no ping from the server in time.
pub const PING_TIMEOUT: u16 = 4000;
/// Server saw no pong from the client in time.
pub const PONG_TIMEOUT: u16 = 4001;
/// Server failed to sign an auth token.
pub const TOKEN_SIGN_FAILURE: u16 = 4002;
/// Handshake-transport middleware rejected the connection.
pub const HANDSHAKE_TRANSPORT_FAILURE: u16 = 4003;
/// Client failed to save an auth token.
pub const TOKEN_SAVE_FAILURE: u16 = 4004;
/// Server received no `#handshake` in time.
pub const HANDSHAKE_TIMEOUT: u16 = 4005;
/// Server failed to bind the socket to the broker.
pub const BROKER_BIND_FAILURE: u16 = 4006;
/// Client connection establishment timed out.
pub const CONNECT_TIMEOUT: u16 = 4007;
/// Handshake-protocol middleware rejected the handshake.
pub const HANDSHAKE_REJECTED: u16 = 4008;
/// A message arrived before the handshake completed.
pub const MESSAGE_BEFORE_HANDSHAKE: u16 = 4009;

/// Codes at or above this value never trigger automatic reconnection.
pub const PERMANENT_THRESHOLD: u16 = 4500;

/// Catalogued description of a close code.
pub fn describe(code: u16) -> &'static str {
    match code {
        NORMAL => "Normal closure",
        GOING_AWAY => "Socket is going away",
        1002 => "A WebSocket protocol error was encountered",
        1003 => "Server terminated socket because it received invalid data",
        NO_STATUS => "Socket closed without status code",
        ABNORMAL => "Socket hung up",
        1007 => "Message format was incorrect",
        1008 => "Encountered a policy violation",
        1009 => "Message was too big to process",
        1010 => "Client ended the connection because the server did not comply with extension requirements",
        1011 => "Server encountered an unexpected fatal condition",
        PING_TIMEOUT => "Server ping timed out",
        PONG_TIMEOUT => "Client pong timed out",
        TOKEN_SIGN_FAILURE => "Server failed to sign auth token",
        HANDSHAKE_TRANSPORT_FAILURE => "Failure to establish handshake-transport",
        TOKEN_SAVE_FAILURE => "Failed to save auth token",
        HANDSHAKE_TIMEOUT => "Did not receive #handshake from client before timeout",
        BROKER_BIND_FAILURE => "Failed to bind socket to message broker",
        CONNECT_TIMEOUT => "Client connection establishment timed out",
        HANDSHAKE_REJECTED => "Server rejected handshake from client",
        MESSAGE_BEFORE_HANDSHAKE => "Server received a message before the client handshake",
        _ => "Unknown close code",
    }
}

/// Whether a close with this code raises no `SocketProtocolError`.
pub fn is_ignored(code: u16) -> bool {
    matches!(code, NORMAL | GOING_AWAY)
}

/// Whether a close with this code suppresses automatic reconnection.
pub fn is_permanent(code: u16) -> bool {
    code >= PERMANENT_THRESHOLD
}

/// Whether a close with this code reconnects without backoff.
pub fn reconnects_immediately(code: u16) -> bool {
    matches!(code, PING_TIMEOUT | PONG_TIMEOUT | NO_STATUS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogue_covers_protocol_codes() {
        for code in 4000..=4009 {
            assert_ne!(describe(code), "Unknown close code", "code {code}");
        }
    }

    #[test]
    fn ignore_list() {
        assert!(is_ignored(NORMAL));
        assert!(is_ignored(GOING_AWAY));
        assert!(!is_ignored(ABNORMAL));
        assert!(!is_ignored(PING_TIMEOUT));
    }

    #[test]
    fn permanent_threshold() {
        assert!(!is_permanent(4499));
        assert!(is_permanent(4500));
        assert!(is_permanent(4999));
        assert!(!is_permanent(ABNORMAL));
    }

    #[test]
    fn immediate_reconnect_codes() {
        assert!(reconnects_immediately(PING_TIMEOUT));
        assert!(reconnects_immediately(PONG_TIMEOUT));
        assert!(reconnects_immediately(NO_STATUS));
        assert!(!reconnects_immediately(ABNORMAL));
        assert!(!reconnects_immediately(CONNECT_TIMEOUT));
    }

    #[test]
    fn unknown_code() {
        assert_eq!(describe(4321), "Unknown close code");
    }
}
