//! Tenant entity: an authenticated API consumer with plan limits and an
//! optional webhook endpoint.

use serde::{Deserialize, Serialize};

use crate::id::TenantId;

/// A tenant row. Created out-of-band (seeding/admin); immutable per request.
///
/// The raw API key is never stored. `api_key_lookup` is the unsalted SHA-256
/// of the key and exists purely as an index; authentication is decided by
/// the salted `api_key_fingerprint`, compared in constant time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    /// Unsalted SHA-256 hex of the API key (index only).
    pub api_key_lookup: String,
    /// SHA-256 hex of `salt || key`; the authentication decision.
    pub api_key_fingerprint: String,
    pub api_key_salt: String,
    /// Sliding-window requests-per-minute budget.
    pub plan_rpm: u32,
    /// In-flight job budget.
    pub plan_concurrency: u32,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub webhook_enabled: bool,
}

impl Tenant {
    /// Whether terminal job transitions should enqueue a webhook event for
    /// this tenant.
    pub fn wants_webhooks(&self) -> bool {
        self.webhook_enabled && self.webhook_url.is_some() && self.webhook_secret.is_some()
    }
}
