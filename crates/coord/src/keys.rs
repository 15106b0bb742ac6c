//! Coordination-store key layout.
//!
//! Every entry carries a TTL so a crashed worker's state self-heals.

use pixgate_core::{CredentialId, EndpointTag, TenantId};

pub const GLOBAL_RPM: &str = "lim:global:rpm";
pub const GLOBAL_CONC: &str = "lim:global:conc";

pub fn credential_rpm(id: CredentialId) -> String {
    format!("lim:key:{id}:rpm")
}

pub fn credential_inflight(id: CredentialId) -> String {
    format!("lim:key:{id}:inflight")
}

pub fn tenant_rpm(id: TenantId) -> String {
    format!("lim:tenant:{id}:rpm")
}

pub fn tenant_conc(id: TenantId) -> String {
    format!("lim:tenant:{id}:conc")
}

pub fn cooldown_until(id: CredentialId) -> String {
    format!("kp:{id}:cooldown_until")
}

pub fn failures(id: CredentialId) -> String {
    format!("kp:{id}:failures")
}

pub fn successes(id: CredentialId) -> String {
    format!("kp:{id}:successes")
}

pub fn endpoint_counter(provider: &str, endpoint: EndpointTag, counter: &str) -> String {
    format!("ep:{provider}:{endpoint}:{counter}")
}

pub fn result_cache(fingerprint: &str) -> String {
    format!("rc:gemini:{fingerprint}")
}
