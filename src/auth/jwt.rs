//! Minimal JWT payload inspection
//!
//! Only the payload segment is decoded to read the `exp` claim. Signatures
//! are not verified; that is the server's job.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value;

/// Decode the claims of a compact JWT. Returns `None` for anything that is
/// not three dot-separated segments with a base64url JSON object in the middle.
pub fn parse_payload(token: &str) -> Option<Value> {
    let mut parts = token.split('.');
    let (_header, payload, _sig) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }

    // Some issuers keep the padding
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;
    claims.is_object().then_some(claims)
}

/// Remaining lifetime of a token given its claims and the current time in
/// milliseconds since the UNIX epoch. An `exp` in the past yields zero.
pub fn token_ttl(claims: &Value, now_ms: u64) -> Option<Duration> {
    let exp = claims.get("exp")?;
    let exp_secs = exp.as_u64().or_else(|| exp.as_f64().map(|f| f as u64))?;
    let exp_ms = exp_secs.checked_mul(1000)?;
    Some(Duration::from_millis(exp_ms.saturating_sub(now_ms)))
}

#[cfg(test)]
pub(crate) fn encode_test_token(claims: &Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.signature", header, payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_payload() {
        let token = encode_test_token(&json!({"sub": "alice", "exp": 1_700_000_000}));
        let claims = parse_payload(&token).unwrap();
        assert_eq!(claims["sub"], "alice");
    }

    #[test]
    fn test_parse_payload_rejects_garbage() {
        assert!(parse_payload("opaque-token").is_none());
        assert!(parse_payload("a.b").is_none());
        assert!(parse_payload("a.!!!.c").is_none());
        assert!(parse_payload("a.b.c.d").is_none());
    }

    #[test]
    fn test_token_ttl() {
        let claims = json!({"exp": 1_000});
        assert_eq!(
            token_ttl(&claims, 400_000),
            Some(Duration::from_millis(600_000))
        );
        // Already expired
        assert_eq!(token_ttl(&claims, 2_000_000), Some(Duration::ZERO));
        assert_eq!(token_ttl(&json!({"sub": "x"}), 0), None);
        assert_eq!(token_ttl(&json!({"exp": "soon"}), 0), None);
    }
}
