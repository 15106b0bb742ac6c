//! In-memory coordination store for dev mode and tests.
//!
//! Same admission semantics as the Redis scripts, under one process-local
//! mutex. Multi-process coordination obviously does not apply.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use pixgate_core::{CredentialId, EndpointTag};

use crate::cache::CachedGeneration;
use crate::keys;
use crate::store::{
    ConcDecision, CoordConfig, CoordError, CoordStore, CredentialHealth, EndpointOutcome,
    HealthRollup, RpmDecision,
};

#[derive(Default)]
struct State {
    /// Sliding windows: key -> event timestamps (ms).
    windows: HashMap<String, Vec<i64>>,
    /// Counters with optional expiry: key -> (value, expires_at_ms).
    counters: HashMap<String, (i64, Option<i64>)>,
    /// Cooldowns: credential key -> until_ms.
    cooldowns: HashMap<String, i64>,
    cache: HashMap<String, CachedGeneration>,
}

impl State {
    fn counter(&mut self, key: &str, now: i64) -> i64 {
        match self.counters.get(key) {
            Some((_, Some(expires))) if *expires <= now => {
                self.counters.remove(key);
                0
            }
            Some((value, _)) => *value,
            None => 0,
        }
    }

    fn set_counter(&mut self, key: &str, value: i64, ttl_ms: Option<u64>, now: i64) {
        let expires = ttl_ms.map(|ttl| now + ttl as i64);
        self.counters.insert(key.to_string(), (value, expires));
    }
}

/// Process-local coordination store.
pub struct InMemoryCoordStore {
    cfg: CoordConfig,
    inner: Mutex<State>,
}

impl InMemoryCoordStore {
    pub fn new(cfg: CoordConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(State::default()),
        }
    }
}

impl Default for InMemoryCoordStore {
    fn default() -> Self {
        Self::new(CoordConfig::default())
    }
}

#[async_trait]
impl CoordStore for InMemoryCoordStore {
    async fn rpm_admit(
        &self,
        key: &str,
        limit: u32,
        window_ms: u64,
    ) -> Result<RpmDecision, CoordError> {
        let now = now_ms();
        let mut state = self.inner.lock().unwrap();
        let window = state.windows.entry(key.to_string()).or_default();
        window.retain(|ts| *ts >= now - window_ms as i64);
        let count = window.len() as u64;
        if count >= u64::from(limit) {
            return Ok(RpmDecision {
                admitted: false,
                count,
            });
        }
        window.push(now);
        Ok(RpmDecision {
            admitted: true,
            count: count + 1,
        })
    }

    async fn conc_acquire(&self, key: &str, limit: u32) -> Result<ConcDecision, CoordError> {
        let now = now_ms();
        let mut state = self.inner.lock().unwrap();
        let value = state.counter(key, now);
        if value + 1 > i64::from(limit) {
            return Ok(ConcDecision {
                admitted: false,
                value: value.max(0) as u64,
            });
        }
        let ttl = (value == 0).then_some(self.cfg.inflight_ttl_ms);
        // Preserve the existing expiry on subsequent increments.
        let expires = if ttl.is_some() {
            None
        } else {
            state.counters.get(key).and_then(|(_, e)| *e)
        };
        match (ttl, expires) {
            (Some(ttl_ms), _) => state.set_counter(key, value + 1, Some(ttl_ms), now),
            (None, Some(expires)) => {
                state
                    .counters
                    .insert(key.to_string(), (value + 1, Some(expires)));
            }
            (None, None) => state.set_counter(key, value + 1, None, now),
        }
        Ok(ConcDecision {
            admitted: true,
            value: (value + 1) as u64,
        })
    }

    async fn conc_release(&self, key: &str) -> Result<(), CoordError> {
        let now = now_ms();
        let mut state = self.inner.lock().unwrap();
        let value = state.counter(key, now);
        if value <= 1 {
            state.counters.remove(key);
        } else {
            let expires = state.counters.get(key).and_then(|(_, e)| *e);
            state.counters.insert(key.to_string(), (value - 1, expires));
        }
        Ok(())
    }

    async fn inflight_count(&self, key: &str) -> Result<u64, CoordError> {
        let now = now_ms();
        let mut state = self.inner.lock().unwrap();
        Ok(state.counter(key, now).max(0) as u64)
    }

    async fn health_probe(
        &self,
        credential: CredentialId,
    ) -> Result<CredentialHealth, CoordError> {
        let now = now_ms();
        let state = self.inner.lock().unwrap();
        let until = state
            .cooldowns
            .get(&keys::cooldown_until(credential))
            .copied()
            .unwrap_or(0);
        Ok(CredentialHealth {
            available: until <= now,
            cooldown_until_ms: if until > now { until as u64 } else { 0 },
        })
    }

    async fn health_record_failure(
        &self,
        credential: CredentialId,
    ) -> Result<CredentialHealth, CoordError> {
        let now = now_ms();
        let cooldown_key = keys::cooldown_until(credential);
        let failures_key = keys::failures(credential);
        let mut state = self.inner.lock().unwrap();

        let until = state.cooldowns.get(&cooldown_key).copied().unwrap_or(0);
        if until > now {
            return Ok(CredentialHealth {
                available: false,
                cooldown_until_ms: until as u64,
            });
        }

        let failures = state.counter(&failures_key, now) + 1;
        if failures >= i64::from(self.cfg.failure_threshold) {
            let cools_until = now + self.cfg.cooldown_ms as i64;
            state.cooldowns.insert(cooldown_key, cools_until);
            state.counters.remove(&failures_key);
            return Ok(CredentialHealth {
                available: false,
                cooldown_until_ms: cools_until as u64,
            });
        }
        state.set_counter(&failures_key, failures, Some(self.cfg.failure_ttl_ms), now);
        Ok(CredentialHealth {
            available: true,
            cooldown_until_ms: 0,
        })
    }

    async fn health_record_success(&self, credential: CredentialId) -> Result<(), CoordError> {
        let now = now_ms();
        let mut state = self.inner.lock().unwrap();
        state.counters.remove(&keys::failures(credential));
        let successes_key = keys::successes(credential);
        let successes = state.counter(&successes_key, now) + 1;
        state.set_counter(
            &successes_key,
            successes,
            Some(self.cfg.success_ttl_ms),
            now,
        );
        Ok(())
    }

    async fn health_rollup(
        &self,
        credential: CredentialId,
    ) -> Result<HealthRollup, CoordError> {
        let now = now_ms();
        let mut state = self.inner.lock().unwrap();
        let successes = state.counter(&keys::successes(credential), now).max(0) as u64;
        let failures = state.counter(&keys::failures(credential), now).max(0) as u64;
        Ok(HealthRollup {
            successes,
            failures,
        })
    }

    async fn endpoint_record(
        &self,
        provider: &str,
        endpoint: EndpointTag,
        outcome: EndpointOutcome,
    ) -> Result<(), CoordError> {
        let counter = match outcome {
            EndpointOutcome::Success => "successes",
            EndpointOutcome::Failure => "failures",
            EndpointOutcome::Overload => "503_count",
        };
        let key = keys::endpoint_counter(provider, endpoint, counter);
        let now = now_ms();
        let mut state = self.inner.lock().unwrap();
        let value = state.counter(&key, now) + 1;
        state.set_counter(&key, value, Some(self.cfg.endpoint_ttl_ms), now);
        Ok(())
    }

    async fn cache_get(
        &self,
        fingerprint: &str,
    ) -> Result<Option<CachedGeneration>, CoordError> {
        let key = keys::result_cache(fingerprint);
        let mut state = self.inner.lock().unwrap();
        match state.cache.get(&key) {
            Some(entry) if entry.is_expired() => {
                state.cache.remove(&key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.clone())),
            None => Ok(None),
        }
    }

    async fn cache_put(
        &self,
        fingerprint: &str,
        entry: &CachedGeneration,
    ) -> Result<(), CoordError> {
        let mut state = self.inner.lock().unwrap();
        state
            .cache
            .insert(keys::result_cache(fingerprint), entry.clone());
        Ok(())
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> InMemoryCoordStore {
        InMemoryCoordStore::default()
    }

    #[tokio::test]
    async fn sliding_window_denies_past_the_limit() {
        let store = store();
        for i in 0..3 {
            let decision = store.rpm_admit("lim:test:rpm", 3, 60_000).await.unwrap();
            assert!(decision.admitted, "admission {i} should pass");
        }
        let denied = store.rpm_admit("lim:test:rpm", 3, 60_000).await.unwrap();
        assert!(!denied.admitted);
        assert_eq!(denied.count, 3);
    }

    #[tokio::test]
    async fn denied_rpm_does_not_consume_window_space() {
        let store = store();
        for _ in 0..2 {
            store.rpm_admit("k", 2, 60_000).await.unwrap();
        }
        // Denials must not push the count past the limit.
        for _ in 0..5 {
            let decision = store.rpm_admit("k", 2, 60_000).await.unwrap();
            assert!(!decision.admitted);
            assert_eq!(decision.count, 2);
        }
    }

    #[tokio::test]
    async fn concurrency_acquire_and_release_round_trip() {
        let store = store();
        assert!(store.conc_acquire("c", 2).await.unwrap().admitted);
        assert!(store.conc_acquire("c", 2).await.unwrap().admitted);

        let denied = store.conc_acquire("c", 2).await.unwrap();
        assert!(!denied.admitted);
        assert_eq!(denied.value, 2);

        store.conc_release("c").await.unwrap();
        assert!(store.conc_acquire("c", 2).await.unwrap().admitted);
        assert_eq!(store.inflight_count("c").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn release_clamps_at_zero() {
        let store = store();
        store.conc_release("never-acquired").await.unwrap();
        assert_eq!(store.inflight_count("never-acquired").await.unwrap(), 0);
        assert!(store.conc_acquire("never-acquired", 1).await.unwrap().admitted);
    }

    #[tokio::test]
    async fn cooldown_trips_after_threshold_failures() {
        let store = store();
        let cred = CredentialId::new();

        for i in 0..4 {
            let health = store.health_record_failure(cred).await.unwrap();
            assert!(health.available, "failure {i} should not trip yet");
        }
        let tripped = store.health_record_failure(cred).await.unwrap();
        assert!(!tripped.available);
        assert!(tripped.cooldown_until_ms > 0);

        let probe = store.health_probe(cred).await.unwrap();
        assert!(!probe.available);
        assert_eq!(probe.cooldown_until_ms, tripped.cooldown_until_ms);
    }

    #[tokio::test]
    async fn success_resets_the_failure_streak() {
        let store = store();
        let cred = CredentialId::new();

        for _ in 0..4 {
            store.health_record_failure(cred).await.unwrap();
        }
        store.health_record_success(cred).await.unwrap();

        // The streak restarted; four more failures still do not trip.
        for _ in 0..4 {
            let health = store.health_record_failure(cred).await.unwrap();
            assert!(health.available);
        }
    }

    #[tokio::test]
    async fn rollups_feed_the_health_score() {
        let store = store();
        let cred = CredentialId::new();

        assert_eq!(store.health_rollup(cred).await.unwrap().health_score(), 100);

        for _ in 0..3 {
            store.health_record_success(cred).await.unwrap();
        }
        store.health_record_failure(cred).await.unwrap();

        let rollup = store.health_rollup(cred).await.unwrap();
        assert_eq!(rollup.successes, 3);
        assert_eq!(rollup.failures, 1);
        assert_eq!(rollup.health_score(), 75);
    }

    #[tokio::test]
    async fn cache_round_trips() {
        let store = store();
        assert!(store.cache_get("fp").await.unwrap().is_none());

        let entry = CachedGeneration::new(vec!["https://blob/1.png".to_string()], "m");
        store.cache_put("fp", &entry).await.unwrap();
        assert_eq!(store.cache_get("fp").await.unwrap().unwrap(), entry);
    }

    #[tokio::test]
    async fn expired_cache_entries_are_dropped_on_read() {
        let store = store();
        let entry = CachedGeneration {
            urls: vec!["https://blob/1.png".to_string()],
            model: "m".to_string(),
            expires_at_ms: 0,
        };
        store.cache_put("fp", &entry).await.unwrap();
        assert!(store.cache_get("fp").await.unwrap().is_none());
    }
}
