//! API-key hashing and verification.
//!
//! The raw key is hashed twice: an unsalted SHA-256 serves as the database
//! index, and a salted SHA-256 is the actual authentication decision,
//! compared in constant time. Raw keys are never stored or logged.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use pixgate_core::Tenant;

/// Unsalted SHA-256 hex (the index hash).
pub fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Salted SHA-256 hex over `salt || key` (the fingerprint).
pub fn salted_fingerprint(salt: &str, key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Decide whether a presented key authenticates the tenant.
pub fn verify_api_key(tenant: &Tenant, presented_key: &str) -> bool {
    let fingerprint = salted_fingerprint(&tenant.api_key_salt, presented_key);
    constant_time_eq(
        fingerprint.as_bytes(),
        tenant.api_key_fingerprint.as_bytes(),
    )
}

/// Build a tenant row for a raw API key (seeding and tests).
pub fn tenant_for_key(
    name: impl Into<String>,
    api_key: &str,
    plan_rpm: u32,
    plan_concurrency: u32,
) -> Tenant {
    let salt = Uuid::new_v4().simple().to_string();
    Tenant {
        id: pixgate_core::TenantId::new(),
        name: name.into(),
        api_key_lookup: sha256_hex(api_key),
        api_key_fingerprint: salted_fingerprint(&salt, api_key),
        api_key_salt: salt,
        plan_rpm,
        plan_concurrency,
        webhook_url: None,
        webhook_secret: None,
        webhook_enabled: false,
    }
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn right_key_verifies_wrong_key_does_not() {
        let tenant = tenant_for_key("acme", "pk_live_abc123", 60, 5);
        assert!(verify_api_key(&tenant, "pk_live_abc123"));
        assert!(!verify_api_key(&tenant, "pk_live_abc124"));
        assert!(!verify_api_key(&tenant, ""));
    }

    #[test]
    fn fingerprints_are_salted() {
        let a = tenant_for_key("a", "same-key", 60, 5);
        let b = tenant_for_key("b", "same-key", 60, 5);
        // Same key, different salts, different fingerprints;
        // the lookup hash is the shared index.
        assert_ne!(a.api_key_fingerprint, b.api_key_fingerprint);
        assert_eq!(a.api_key_lookup, b.api_key_lookup);
    }

    #[test]
    fn raw_key_never_appears_in_the_row() {
        let tenant = tenant_for_key("acme", "pk_live_abc123", 60, 5);
        let serialized = serde_json::to_string(&tenant).unwrap();
        assert!(!serialized.contains("pk_live_abc123"));
    }
}
