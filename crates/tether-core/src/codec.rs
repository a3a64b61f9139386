//! Packet codec.
//!
//! A codec turns a JSON packet (one envelope object, or an array of them for
//! a batch) into a text frame and back. Keepalive markers bypass the codec:
//! they are the literal frames [`PING`] and [`PONG`].

use serde_json::Value;
use thiserror::Error;

/// Keepalive ping marker, sent by the server.
pub const PING: &str = "#1";
/// Keepalive pong marker, the client's answer to [`PING`].
pub const PONG: &str = "#2";

/// Encoding or decoding failure.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The packet could not be serialized.
    #[error("failed to encode packet: {0}")]
    Encode(String),
    /// The frame could not be parsed.
    #[error("failed to decode packet: {0}")]
    Decode(String),
}

/// Converts packets to and from text frames.
pub trait Codec: Send + Sync + 'static {
    /// Encode one packet.
    fn encode(&self, packet: &Value) -> Result<String, CodecError>;

    /// Decode one text frame.
    fn decode(&self, frame: &str) -> Result<Value, CodecError>;
}

/// The default codec: packets are plain JSON text.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, packet: &Value) -> Result<String, CodecError> {
        serde_json::to_string(packet).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, frame: &str) -> Result<Value, CodecError> {
        serde_json::from_str(frame).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// A classified inbound text frame.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundFrame {
    /// Keepalive ping.
    Ping,
    /// Keepalive pong.
    Pong,
    /// A decoded packet.
    Packet(Value),
}

/// Classify a text frame, decoding it when it is not a keepalive marker.
pub fn decode_frame(codec: &dyn Codec, frame: &str) -> Result<InboundFrame, CodecError> {
    match frame {
        PING => Ok(InboundFrame::Ping),
        PONG => Ok(InboundFrame::Pong),
        other => codec.decode(other).map(InboundFrame::Packet),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn json_codec_encodes_compactly() {
        let text = JsonCodec.encode(&json!({"event": "a", "data": 1})).unwrap();
        assert!(!text.contains(' '));
        assert!(text.contains("\"event\":\"a\""));
    }

    #[test]
    fn json_codec_decode_error() {
        let err = JsonCodec.decode("{not json").unwrap_err();
        assert_matches!(err, CodecError::Decode(_));
    }

    #[test]
    fn keepalive_markers_bypass_codec() {
        assert_eq!(decode_frame(&JsonCodec, "#1").unwrap(), InboundFrame::Ping);
        assert_eq!(decode_frame(&JsonCodec, "#2").unwrap(), InboundFrame::Pong);
    }

    #[test]
    fn batch_frame_decodes_to_array() {
        let frame = r#"[{"event":"a","data":1},{"rid":3,"data":null}]"#;
        let decoded = decode_frame(&JsonCodec, frame).unwrap();
        assert_matches!(decoded, InboundFrame::Packet(Value::Array(items)) if items.len() == 2);
    }
}
