//! Expiry claim decoding.
//!
//! Only the payload segment of the token is read and nothing is verified: the backend is the
//! authority, this is just a local estimate of when the token stops being accepted.

use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde_json::Value;

/// `exp` claim (seconds since the epoch) of a JWT-shaped token, or `None` if the token does not
/// decode.
pub fn decode_expiry(token: &str) -> Option<u64> {
    let payload = token.split('.').nth(1)?;
    let trimmed = payload.trim_end_matches('=');
    let bytes = URL_SAFE_NO_PAD
        .decode(trimmed)
        .or_else(|_| STANDARD_NO_PAD.decode(trimmed))
        .ok()?;
    let claims: Value = serde_json::from_slice(&bytes).ok()?;
    match claims.get("exp")? {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        _ => None,
    }
}
