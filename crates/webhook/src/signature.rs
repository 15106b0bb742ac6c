//! Webhook body signing and verification.
//!
//! `X-Signature: sha256=<hex>` over the verbatim serialized body with the
//! tenant's secret. Verification compares in constant time.

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Signature";

/// Compute the signature header value for a raw body.
pub fn sign(body: &[u8], secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    let digest = mac.finalize().into_bytes();
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("sha256={hex}")
}

/// Verify a signature header against the raw body.
pub fn verify(body: &[u8], secret: &str, signature: &str) -> bool {
    let expected = sign(body, secret);
    constant_time_eq(expected.as_bytes(), signature.as_bytes())
}

/// Verify with a replay guard: the event's `timestamp` (milliseconds) must
/// be within `max_age_ms` of now.
pub fn verify_with_max_age(
    body: &[u8],
    secret: &str,
    signature: &str,
    max_age_ms: i64,
) -> bool {
    if !verify(body, secret, signature) {
        return false;
    }
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
        return false;
    };
    let Some(timestamp) = value.get("timestamp").and_then(|t| t.as_i64()) else {
        return false;
    };
    Utc::now().timestamp_millis() - timestamp <= max_age_ms
}

fn constant_time_eq(left: &[u8], right: &[u8]) -> bool {
    let max_len = left.len().max(right.len());
    let mut diff = left.len() ^ right.len();
    for i in 0..max_len {
        let left_byte = *left.get(i).unwrap_or(&0);
        let right_byte = *right.get(i).unwrap_or(&0);
        diff |= (left_byte ^ right_byte) as usize;
    }
    diff == 0
}
