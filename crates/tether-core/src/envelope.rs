//! Wire envelopes and the action model.
//!
//! Three envelope shapes travel over a link:
//!
//! - transmit: `{"event": name, "data": payload}`
//! - invoke: `{"event": name, "data": payload, "cid": n}`
//! - response: `{"rid": n, "data"?: payload, "error"?: {name, message}}`
//!
//! A packet is one envelope or a JSON array of envelopes (a batch). Events
//! whose names start with `#` are reserved for the protocol and parse into
//! dedicated [`Action`] variants; every other name is an application event.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ProtocolError, WireError};
use crate::ids::{CallId, SocketId};

/// Reserved event names.
pub mod reserved {
    /// Client → server handshake.
    pub const HANDSHAKE: &str = "#handshake";
    /// Client → server token presentation after connect.
    pub const AUTHENTICATE: &str = "#authenticate";
    /// Client → server token removal.
    pub const REMOVE_AUTH_TOKEN: &str = "#removeAuthToken";
    /// Client → server channel subscription.
    pub const SUBSCRIBE: &str = "#subscribe";
    /// Client → server channel unsubscription.
    pub const UNSUBSCRIBE: &str = "#unsubscribe";
    /// Publication in either direction.
    pub const PUBLISH: &str = "#publish";
    /// Server → client token issuance.
    pub const SET_AUTH_TOKEN: &str = "#setAuthToken";
    /// Server → client forced unsubscription.
    pub const KICK_OUT: &str = "#kickOut";
}

/// Whether an event name is in the reserved `#` namespace.
pub fn is_reserved(event: &str) -> bool {
    event.starts_with('#')
}

/// Reject event names application code may not use.
pub fn check_event_name(event: &str) -> Result<(), ProtocolError> {
    if is_reserved(event) {
        return Err(ProtocolError::ReservedEvent(event.to_string()));
    }
    Ok(())
}

/// Reject channel names that cannot be subscribed to.
pub fn check_channel_name(channel: &str) -> Result<(), ProtocolError> {
    if channel.is_empty() {
        return Err(ProtocolError::invalid_payload(
            reserved::SUBSCRIBE,
            "channel name must not be empty",
        ));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelopes
// ─────────────────────────────────────────────────────────────────────────────

/// A transmit or invoke.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Event name.
    pub event: String,
    /// Payload (`null` when absent).
    #[serde(default)]
    pub data: Value,
    /// Call id, present only when a response is expected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<CallId>,
}

impl EventEnvelope {
    /// A transmit envelope.
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            cid: None,
        }
    }

    /// Turn this envelope into an invoke.
    #[must_use]
    pub fn with_cid(mut self, cid: CallId) -> Self {
        self.cid = Some(cid);
        self
    }
}

/// A response to an invoke.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Call id of the invoke being answered.
    pub rid: CallId,
    /// Success payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Failure payload; decoded leniently into a [`WireError`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl ResponseEnvelope {
    /// A successful response.
    pub fn ok(rid: CallId, data: Value) -> Self {
        Self {
            rid,
            data: Some(data),
            error: None,
        }
    }

    /// A failed response.
    pub fn err(rid: CallId, error: &WireError) -> Self {
        Self {
            rid,
            data: None,
            error: serde_json::to_value(error).ok(),
        }
    }

    /// Outcome carried by this response.
    pub fn into_result(self) -> Result<Value, WireError> {
        match self.error {
            Some(err) => Err(WireError::from_value(err)),
            None => Ok(self.data.unwrap_or(Value::Null)),
        }
    }
}

/// Any envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Envelope {
    /// A response (has `rid`).
    Response(ResponseEnvelope),
    /// A transmit or invoke (has `event`).
    Event(EventEnvelope),
}

impl From<EventEnvelope> for Envelope {
    fn from(env: EventEnvelope) -> Self {
        Self::Event(env)
    }
}

impl From<ResponseEnvelope> for Envelope {
    fn from(env: ResponseEnvelope) -> Self {
        Self::Response(env)
    }
}

impl Envelope {
    /// JSON form of this envelope.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Split a decoded packet into envelopes.
///
/// Batches yield one entry per element; a malformed element does not
/// prevent the others from being delivered.
pub fn parse_packet(packet: Value) -> Vec<Result<Envelope, ProtocolError>> {
    match packet {
        Value::Array(items) => items.into_iter().map(parse_envelope).collect(),
        single => vec![parse_envelope(single)],
    }
}

fn parse_envelope(value: Value) -> Result<Envelope, ProtocolError> {
    if !value.is_object() {
        return Err(ProtocolError::MalformedEnvelope(
            "envelope must be a JSON object".into(),
        ));
    }
    serde_json::from_value(value).map_err(|e| ProtocolError::MalformedEnvelope(e.to_string()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Reserved payloads
// ─────────────────────────────────────────────────────────────────────────────

/// `#handshake` request data.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeRequest {
    /// Signed token the client already holds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
}

/// `#handshake` response data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResponse {
    /// Socket id assigned by the server.
    pub id: SocketId,
    /// Milliseconds the client may go without hearing from the server.
    pub ping_timeout: u64,
    /// Whether the presented token was accepted.
    pub is_authenticated: bool,
    /// Why the presented token was rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_error: Option<WireError>,
}

/// `#authenticate` response data.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthStatus {
    /// Whether the token was accepted.
    pub is_authenticated: bool,
    /// Why it was rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_error: Option<WireError>,
}

/// `#subscribe` request data.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
    /// Channel name.
    pub channel: String,
    /// Whether the subscription requires an authenticated socket.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub wait_for_auth: bool,
    /// Whether publications may be batched.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub batch: bool,
    /// Opaque data for subscribe middleware.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// `#publish` data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Publication {
    /// Channel name.
    pub channel: String,
    /// Published payload.
    #[serde(default)]
    pub data: Value,
}

/// `#kickOut` data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KickOut {
    /// Channel the client was removed from.
    pub channel: String,
    /// Server-supplied explanation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `#setAuthToken` data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SetAuthToken {
    /// Newly signed token.
    pub token: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Action
// ─────────────────────────────────────────────────────────────────────────────

/// An inbound event, with reserved names resolved to typed payloads.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    /// `#handshake`.
    Handshake(HandshakeRequest),
    /// `#authenticate` with the signed token.
    Authenticate(String),
    /// `#removeAuthToken`.
    RemoveAuthToken,
    /// `#subscribe`.
    Subscribe(SubscribeRequest),
    /// `#unsubscribe` with the channel name.
    Unsubscribe(String),
    /// `#publish`.
    Publish(Publication),
    /// `#setAuthToken`.
    SetAuthToken(SetAuthToken),
    /// `#kickOut`.
    KickOut(KickOut),
    /// Any application event.
    Event {
        /// Event name.
        event: String,
        /// Payload.
        data: Value,
    },
}

impl Action {
    /// Resolve an event name and payload into an action.
    pub fn parse(event: String, data: Value) -> Result<Self, ProtocolError> {
        if !is_reserved(&event) {
            return Ok(Self::Event { event, data });
        }
        match event.as_str() {
            reserved::HANDSHAKE => {
                if data.is_null() {
                    return Ok(Self::Handshake(HandshakeRequest::default()));
                }
                payload(&event, data).map(Self::Handshake)
            }
            reserved::AUTHENTICATE => match data {
                Value::String(token) => Ok(Self::Authenticate(token)),
                _ => Err(ProtocolError::invalid_payload(
                    &event,
                    "token must be a string",
                )),
            },
            reserved::REMOVE_AUTH_TOKEN => Ok(Self::RemoveAuthToken),
            reserved::SUBSCRIBE => {
                let req: SubscribeRequest = payload(&event, data)?;
                check_channel_name(&req.channel)?;
                Ok(Self::Subscribe(req))
            }
            reserved::UNSUBSCRIBE => match data {
                Value::String(channel) if !channel.is_empty() => Ok(Self::Unsubscribe(channel)),
                _ => Err(ProtocolError::invalid_payload(
                    &event,
                    "channel must be a non-empty string",
                )),
            },
            reserved::PUBLISH => {
                let publication: Publication = payload(&event, data)?;
                check_channel_name(&publication.channel)?;
                Ok(Self::Publish(publication))
            }
            reserved::SET_AUTH_TOKEN => payload(&event, data).map(Self::SetAuthToken),
            reserved::KICK_OUT => payload(&event, data).map(Self::KickOut),
            _ => Err(ProtocolError::UnexpectedAction(event)),
        }
    }

    /// Event name this action was parsed from.
    pub fn name(&self) -> &str {
        match self {
            Self::Handshake(_) => reserved::HANDSHAKE,
            Self::Authenticate(_) => reserved::AUTHENTICATE,
            Self::RemoveAuthToken => reserved::REMOVE_AUTH_TOKEN,
            Self::Subscribe(_) => reserved::SUBSCRIBE,
            Self::Unsubscribe(_) => reserved::UNSUBSCRIBE,
            Self::Publish(_) => reserved::PUBLISH,
            Self::SetAuthToken(_) => reserved::SET_AUTH_TOKEN,
            Self::KickOut(_) => reserved::KICK_OUT,
            Self::Event { event, .. } => event,
        }
    }
}

fn payload<T: serde::de::DeserializeOwned>(event: &str, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|e| ProtocolError::invalid_payload(event, e.to_string()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn transmit_envelope_has_no_cid() {
        let env = Envelope::from(EventEnvelope::new("chat", json!("hi")));
        assert_eq!(env.to_value(), json!({"event": "chat", "data": "hi"}));
    }

    #[test]
    fn invoke_envelope_carries_cid() {
        let env = Envelope::from(EventEnvelope::new("sum", json!([1, 2])).with_cid(CallId(5)));
        assert_eq!(env.to_value(), json!({"event": "sum", "data": [1, 2], "cid": 5}));
    }

    #[test]
    fn response_envelope_shapes() {
        let ok = Envelope::from(ResponseEnvelope::ok(CallId(1), json!(3)));
        assert_eq!(ok.to_value(), json!({"rid": 1, "data": 3}));

        let err = Envelope::from(ResponseEnvelope::err(
            CallId(2),
            &WireError::new("BadThing", "nope"),
        ));
        assert_eq!(
            err.to_value(),
            json!({"rid": 2, "error": {"name": "BadThing", "message": "nope"}})
        );
    }

    #[test]
    fn parse_single_event() {
        let parsed = parse_packet(json!({"event": "x", "data": {"a": 1}, "cid": 9}));
        assert_eq!(parsed.len(), 1);
        let env = parsed.into_iter().next().unwrap().unwrap();
        assert_matches!(env, Envelope::Event(EventEnvelope { cid: Some(CallId(9)), .. }));
    }

    #[test]
    fn parse_response_with_error() {
        let parsed = parse_packet(json!({"rid": 4, "error": {"name": "E", "message": "m"}}));
        let env = parsed.into_iter().next().unwrap().unwrap();
        let Envelope::Response(resp) = env else {
            panic!("expected response");
        };
        let err = resp.into_result().unwrap_err();
        assert_eq!(err.name, "E");
    }

    #[test]
    fn response_without_data_resolves_null() {
        let resp = ResponseEnvelope {
            rid: CallId(1),
            data: None,
            error: None,
        };
        assert_eq!(resp.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn missing_data_defaults_to_null() {
        let parsed = parse_packet(json!({"event": "#removeAuthToken"}));
        let env = parsed.into_iter().next().unwrap().unwrap();
        assert_matches!(env, Envelope::Event(EventEnvelope { data: Value::Null, .. }));
    }

    #[test]
    fn batch_keeps_valid_entries() {
        let parsed = parse_packet(json!([
            {"event": "a", "data": 1},
            42,
            {"rid": 2, "data": "ok"}
        ]));
        assert_eq!(parsed.len(), 3);
        assert!(parsed[0].is_ok());
        assert_matches!(parsed[1], Err(ProtocolError::MalformedEnvelope(_)));
        assert!(parsed[2].is_ok());
    }

    #[test]
    fn object_without_event_or_rid_is_malformed() {
        let parsed = parse_packet(json!({"data": 1}));
        assert_matches!(parsed[0], Err(ProtocolError::MalformedEnvelope(_)));
    }

    #[test]
    fn application_events_parse_as_event() {
        let action = Action::parse("chat".into(), json!("hello")).unwrap();
        assert_eq!(
            action,
            Action::Event {
                event: "chat".into(),
                data: json!("hello")
            }
        );
        assert_eq!(action.name(), "chat");
    }

    #[test]
    fn handshake_with_and_without_token() {
        let action = Action::parse("#handshake".into(), json!({"authToken": "abc"})).unwrap();
        assert_matches!(action, Action::Handshake(HandshakeRequest { auth_token: Some(t) }) if t == "abc");

        let action = Action::parse("#handshake".into(), Value::Null).unwrap();
        assert_eq!(action, Action::Handshake(HandshakeRequest::default()));
    }

    #[test]
    fn subscribe_payload() {
        let action = Action::parse(
            "#subscribe".into(),
            json!({"channel": "news", "waitForAuth": true, "data": {"k": 1}}),
        )
        .unwrap();
        let Action::Subscribe(req) = action else {
            panic!("expected subscribe");
        };
        assert_eq!(req.channel, "news");
        assert!(req.wait_for_auth);
        assert!(!req.batch);
        assert_eq!(req.data, Some(json!({"k": 1})));
    }

    #[test]
    fn subscribe_request_omits_false_flags() {
        let req = SubscribeRequest {
            channel: "c".into(),
            ..SubscribeRequest::default()
        };
        assert_eq!(serde_json::to_value(req).unwrap(), json!({"channel": "c"}));
    }

    #[test]
    fn subscribe_requires_channel() {
        let err = Action::parse("#subscribe".into(), json!({"channel": ""})).unwrap_err();
        assert_matches!(err, ProtocolError::InvalidPayload { .. });
        let err = Action::parse("#subscribe".into(), json!("news")).unwrap_err();
        assert_matches!(err, ProtocolError::InvalidPayload { .. });
    }

    #[test]
    fn unsubscribe_takes_string() {
        assert_eq!(
            Action::parse("#unsubscribe".into(), json!("news")).unwrap(),
            Action::Unsubscribe("news".into())
        );
        assert!(Action::parse("#unsubscribe".into(), json!({"channel": "x"})).is_err());
    }

    #[test]
    fn authenticate_takes_string_token() {
        assert_eq!(
            Action::parse("#authenticate".into(), json!("tok")).unwrap(),
            Action::Authenticate("tok".into())
        );
        assert!(Action::parse("#authenticate".into(), json!(5)).is_err());
    }

    #[test]
    fn publish_kick_out_and_set_token() {
        assert_matches!(
            Action::parse("#publish".into(), json!({"channel": "c", "data": 1})).unwrap(),
            Action::Publish(Publication { channel, .. }) if channel == "c"
        );
        assert_matches!(
            Action::parse("#kickOut".into(), json!({"channel": "c", "message": "bye"})).unwrap(),
            Action::KickOut(KickOut { message: Some(m), .. }) if m == "bye"
        );
        assert_matches!(
            Action::parse("#setAuthToken".into(), json!({"token": "t"})).unwrap(),
            Action::SetAuthToken(SetAuthToken { token }) if token == "t"
        );
    }

    #[test]
    fn unknown_reserved_event_is_protocol_error() {
        let err = Action::parse("#mystery".into(), Value::Null).unwrap_err();
        assert_eq!(err, ProtocolError::UnexpectedAction("#mystery".into()));
    }

    #[test]
    fn reserved_names_rejected_for_application_use() {
        assert!(check_event_name("chat").is_ok());
        assert_matches!(
            check_event_name("#subscribe"),
            Err(ProtocolError::ReservedEvent(_))
        );
    }

    #[test]
    fn handshake_response_round_trip_fields() {
        let resp = HandshakeResponse {
            id: SocketId::from("s1".to_string()),
            ping_timeout: 20_000,
            is_authenticated: false,
            auth_error: Some(WireError::new("AuthTokenExpiredError", "jwt expired")),
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["pingTimeout"], 20_000);
        assert_eq!(json["isAuthenticated"], false);
        assert_eq!(json["authError"]["name"], "AuthTokenExpiredError");
    }
}
