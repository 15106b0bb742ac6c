//! The coordination-store capability trait and its decision types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use pixgate_core::{CredentialId, EndpointTag};

use crate::cache::CachedGeneration;

/// Coordination-store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CoordError {
    #[error("coordination store unavailable: {0}")]
    Connection(String),
    #[error("script execution failed: {0}")]
    Script(String),
    #[error("serialization failed: {0}")]
    Serialize(String),
}

/// Tunables shared by the Redis and in-memory implementations.
#[derive(Debug, Clone, Copy)]
pub struct CoordConfig {
    /// Consecutive failures that trip a credential cooldown.
    pub failure_threshold: u32,
    /// How long a tripped credential stays ineligible.
    pub cooldown_ms: u64,
    /// TTL of the consecutive-failure counter.
    pub failure_ttl_ms: u64,
    /// TTL of the success rollup counter.
    pub success_ttl_ms: u64,
    /// TTL of per-endpoint rollup counters (5-minute window).
    pub endpoint_ttl_ms: u64,
    /// TTL of in-flight concurrency counters; must cover the max job time
    /// so a crashed worker's tokens expire.
    pub inflight_ttl_ms: u64,
}

impl Default for CoordConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 10 * 60 * 1000,
            failure_ttl_ms: 60 * 60 * 1000,
            success_ttl_ms: 5 * 60 * 1000,
            endpoint_ttl_ms: 5 * 60 * 1000,
            inflight_ttl_ms: 6 * 60 * 1000,
        }
    }
}

/// Outcome of a sliding-window admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpmDecision {
    pub admitted: bool,
    /// Entries in the window after the attempt.
    pub count: u64,
}

/// Outcome of a concurrency admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcDecision {
    pub admitted: bool,
    /// Counter value after the attempt.
    pub value: u64,
}

/// Credential availability as decided by the health script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CredentialHealth {
    pub available: bool,
    /// Milliseconds since epoch until which the credential cools down;
    /// zero when not cooling down.
    pub cooldown_until_ms: u64,
}

/// Success/failure rollups for one credential.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthRollup {
    pub successes: u64,
    pub failures: u64,
}

impl HealthRollup {
    /// `100 · successes / (successes + failures)`, defaulting to 100 when
    /// the rollups are empty.
    pub fn health_score(&self) -> u32 {
        let total = self.successes + self.failures;
        if total == 0 {
            100
        } else {
            ((self.successes * 100) / total) as u32
        }
    }

    pub fn failure_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            0.0
        } else {
            self.failures as f64 / total as f64
        }
    }
}

/// What happened at an endpoint, for advisory rollups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointOutcome {
    Success,
    Failure,
    /// A 503; tracked separately in the 5-minute window.
    Overload,
}

/// Atomic primitives on the shared coordination store.
///
/// Every method is safe to call from any number of worker processes
/// concurrently; atomicity is the implementation's contract.
#[async_trait]
pub trait CoordStore: Send + Sync {
    /// Sliding-window admission: admit if fewer than `limit` events fall in
    /// the trailing `window_ms`, recording the event when admitted.
    async fn rpm_admit(&self, key: &str, limit: u32, window_ms: u64)
        -> Result<RpmDecision, CoordError>;

    /// Bounded-concurrency admission: increment, deny-and-undo when the new
    /// value exceeds `limit`.
    async fn conc_acquire(&self, key: &str, limit: u32) -> Result<ConcDecision, CoordError>;

    /// Release one concurrency token, clamping at zero.
    async fn conc_release(&self, key: &str) -> Result<(), CoordError>;

    /// Current value of a concurrency counter (0 when absent).
    async fn inflight_count(&self, key: &str) -> Result<u64, CoordError>;

    /// Check availability without mutating failure state.
    async fn health_probe(&self, credential: CredentialId)
        -> Result<CredentialHealth, CoordError>;

    /// Record a consecutive failure; may trip the cooldown.
    async fn health_record_failure(
        &self,
        credential: CredentialId,
    ) -> Result<CredentialHealth, CoordError>;

    /// Reset the consecutive-failure counter and bump the success rollup.
    async fn health_record_success(&self, credential: CredentialId) -> Result<(), CoordError>;

    /// Read the success/failure rollups for scoring.
    async fn health_rollup(&self, credential: CredentialId) -> Result<HealthRollup, CoordError>;

    /// Bump a per-endpoint rollup counter. Advisory; never gates scheduling
    /// on its own.
    async fn endpoint_record(
        &self,
        provider: &str,
        endpoint: EndpointTag,
        outcome: EndpointOutcome,
    ) -> Result<(), CoordError>;

    /// Fetch a cached generation by fingerprint.
    async fn cache_get(&self, fingerprint: &str)
        -> Result<Option<CachedGeneration>, CoordError>;

    /// Store a generation under its fingerprint with the cache TTL.
    async fn cache_put(
        &self,
        fingerprint: &str,
        entry: &CachedGeneration,
    ) -> Result<(), CoordError>;
}
