//! Unverified claim extraction.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::Value;

/// Decode the claims segment of a compact JWT without verifying it.
///
/// Returns `None` for anything that is not three dot-separated segments
/// with a base64url JSON object in the middle.
pub fn decode_unverified(token: &str) -> Option<Value> {
    let mut parts = token.split('.');
    let (Some(_header), Some(payload), Some(_signature), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return None;
    };
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;
    claims.is_object().then_some(claims)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn token_with(payload: &Value) -> String {
        let body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(payload).unwrap());
        format!("e30.{body}.sig")
    }

    #[test]
    fn decodes_claims() {
        let token = token_with(&json!({"username": "alice", "exp": 10}));
        let claims = decode_unverified(&token).unwrap();
        assert_eq!(claims["username"], "alice");
    }

    #[test]
    fn rejects_wrong_segment_count() {
        assert!(decode_unverified("a.b").is_none());
        assert!(decode_unverified("a.b.c.d").is_none());
        assert!(decode_unverified("").is_none());
    }

    #[test]
    fn rejects_non_object_payload() {
        let token = token_with(&json!([1, 2]));
        assert!(decode_unverified(&token).is_none());
        assert!(decode_unverified("x.!!!.y").is_none());
    }
}
