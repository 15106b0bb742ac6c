//! Redis-backed coordination store.
//!
//! Each admission primitive is one Lua script, so the read-check-mutate
//! sequence is atomic across every worker process. Scripts go through
//! `redis::Script`, which EVALSHAs by digest and transparently re-loads on a
//! `NOSCRIPT` digest miss.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, Script};

use pixgate_core::{CredentialId, EndpointTag};

use crate::cache::CachedGeneration;
use crate::keys;
use crate::store::{
    ConcDecision, CoordConfig, CoordError, CoordStore, CredentialHealth, EndpointOutcome,
    HealthRollup, RpmDecision,
};

/// Sliding-window admission. KEYS[1] window zset; ARGV: limit, window_ms,
/// now_ms, member. Returns {admitted, count}.
const RPM_ADMIT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])
local member = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now_ms - window_ms)
local count = redis.call('ZCARD', key)
if count >= limit then
  return {0, count}
end
redis.call('ZADD', key, now_ms, member)
redis.call('PEXPIRE', key, window_ms + 1000)
return {1, count + 1}
"#;

/// Bounded-concurrency acquire. KEYS[1] counter; ARGV: limit, ttl_ms.
/// Returns {admitted, value}.
const CONC_ACQUIRE: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local ttl_ms = tonumber(ARGV[2])

local value = redis.call('INCR', key)
if value > limit then
  redis.call('DECR', key)
  return {0, value - 1}
end
if value == 1 then
  redis.call('PEXPIRE', key, ttl_ms)
end
return {1, value}
"#;

/// Concurrency release. DECR clamped at zero (a missing key reads as zero).
const CONC_RELEASE: &str = r#"
local key = KEYS[1]
local value = redis.call('DECR', key)
if value < 0 then
  redis.call('DEL', key)
  return 0
end
return value
"#;

/// Credential health check and bookkeeping. KEYS[1] cooldown, KEYS[2]
/// failures; ARGV: now_ms, op (probe|record_failure|record_success),
/// threshold, cooldown_ms, failure_ttl_ms. Returns {available,
/// cooldown_until_ms}.
const CREDENTIAL_HEALTH: &str = r#"
local cooldown_key = KEYS[1]
local failures_key = KEYS[2]
local now_ms = tonumber(ARGV[1])
local op = ARGV[2]
local threshold = tonumber(ARGV[3])
local cooldown_ms = tonumber(ARGV[4])
local failure_ttl_ms = tonumber(ARGV[5])

local cooldown_until = tonumber(redis.call('GET', cooldown_key) or '0')
if cooldown_until > now_ms then
  return {0, cooldown_until}
end

if op == 'record_failure' then
  local failures = redis.call('INCR', failures_key)
  redis.call('PEXPIRE', failures_key, failure_ttl_ms)
  if failures >= threshold then
    local cools_until = now_ms + cooldown_ms
    redis.call('SET', cooldown_key, cools_until, 'PX', cooldown_ms)
    redis.call('DEL', failures_key)
    return {0, cools_until}
  end
elseif op == 'record_success' then
  redis.call('DEL', failures_key)
end

return {1, 0}
"#;

/// Coordination store backed by one shared Redis.
pub struct RedisCoordStore {
    conn: ConnectionManager,
    cfg: CoordConfig,
    rpm_admit: Script,
    conc_acquire: Script,
    conc_release: Script,
    credential_health: Script,
}

impl RedisCoordStore {
    /// Connect to Redis and prepare the scripts. Every call carries a
    /// response deadline so a stuck Redis cannot wedge the admission path.
    pub async fn connect(redis_url: &str, cfg: CoordConfig) -> Result<Self, CoordError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| CoordError::Connection(e.to_string()))?;
        let manager_config = ConnectionManagerConfig::new()
            .set_connection_timeout(Duration::from_secs(5))
            .set_response_timeout(Duration::from_secs(5));
        let conn = client
            .get_connection_manager_with_config(manager_config)
            .await
            .map_err(|e| CoordError::Connection(e.to_string()))?;
        Ok(Self::with_connection(conn, cfg))
    }

    pub fn with_connection(conn: ConnectionManager, cfg: CoordConfig) -> Self {
        Self {
            conn,
            cfg,
            rpm_admit: Script::new(RPM_ADMIT),
            conc_acquire: Script::new(CONC_ACQUIRE),
            conc_release: Script::new(CONC_RELEASE),
            credential_health: Script::new(CREDENTIAL_HEALTH),
        }
    }

    async fn run_health(
        &self,
        credential: CredentialId,
        op: &str,
    ) -> Result<CredentialHealth, CoordError> {
        let mut conn = self.conn.clone();
        let (available, cooldown_until_ms): (i64, i64) = self
            .credential_health
            .key(keys::cooldown_until(credential))
            .key(keys::failures(credential))
            .arg(now_ms())
            .arg(op)
            .arg(self.cfg.failure_threshold)
            .arg(self.cfg.cooldown_ms)
            .arg(self.cfg.failure_ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CoordError::Script(e.to_string()))?;
        Ok(CredentialHealth {
            available: available == 1,
            cooldown_until_ms: cooldown_until_ms.max(0) as u64,
        })
    }
}

#[async_trait]
impl CoordStore for RedisCoordStore {
    async fn rpm_admit(
        &self,
        key: &str,
        limit: u32,
        window_ms: u64,
    ) -> Result<RpmDecision, CoordError> {
        let mut conn = self.conn.clone();
        let now = now_ms();
        let member = format!("{now}-{}", rand::random::<u32>());
        let (admitted, count): (i64, i64) = self
            .rpm_admit
            .key(key)
            .arg(limit)
            .arg(window_ms)
            .arg(now)
            .arg(member)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CoordError::Script(e.to_string()))?;
        Ok(RpmDecision {
            admitted: admitted == 1,
            count: count.max(0) as u64,
        })
    }

    async fn conc_acquire(&self, key: &str, limit: u32) -> Result<ConcDecision, CoordError> {
        let mut conn = self.conn.clone();
        let (admitted, value): (i64, i64) = self
            .conc_acquire
            .key(key)
            .arg(limit)
            .arg(self.cfg.inflight_ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CoordError::Script(e.to_string()))?;
        Ok(ConcDecision {
            admitted: admitted == 1,
            value: value.max(0) as u64,
        })
    }

    async fn conc_release(&self, key: &str) -> Result<(), CoordError> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .conc_release
            .key(key)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| CoordError::Script(e.to_string()))?;
        Ok(())
    }

    async fn inflight_count(&self, key: &str) -> Result<u64, CoordError> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = conn
            .get(key)
            .await
            .map_err(|e| CoordError::Connection(e.to_string()))?;
        Ok(value.unwrap_or(0).max(0) as u64)
    }

    async fn health_probe(
        &self,
        credential: CredentialId,
    ) -> Result<CredentialHealth, CoordError> {
        self.run_health(credential, "probe").await
    }

    async fn health_record_failure(
        &self,
        credential: CredentialId,
    ) -> Result<CredentialHealth, CoordError> {
        self.run_health(credential, "record_failure").await
    }

    async fn health_record_success(&self, credential: CredentialId) -> Result<(), CoordError> {
        self.run_health(credential, "record_success").await?;
        let mut conn = self.conn.clone();
        let key = keys::successes(credential);
        let _: i64 = conn
            .incr(&key, 1)
            .await
            .map_err(|e| CoordError::Connection(e.to_string()))?;
        let _: bool = conn
            .pexpire(&key, self.cfg.success_ttl_ms as i64)
            .await
            .map_err(|e| CoordError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn health_rollup(
        &self,
        credential: CredentialId,
    ) -> Result<HealthRollup, CoordError> {
        let mut conn = self.conn.clone();
        let (successes, failures): (Option<u64>, Option<u64>) = redis::pipe()
            .get(keys::successes(credential))
            .get(keys::failures(credential))
            .query_async(&mut conn)
            .await
            .map_err(|e| CoordError::Connection(e.to_string()))?;
        Ok(HealthRollup {
            successes: successes.unwrap_or(0),
            failures: failures.unwrap_or(0),
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
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .incr(&key, 1)
            .await
            .map_err(|e| CoordError::Connection(e.to_string()))?;
        let _: bool = conn
            .pexpire(&key, self.cfg.endpoint_ttl_ms as i64)
            .await
            .map_err(|e| CoordError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn cache_get(
        &self,
        fingerprint: &str,
    ) -> Result<Option<CachedGeneration>, CoordError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .get(keys::result_cache(fingerprint))
            .await
            .map_err(|e| CoordError::Connection(e.to_string()))?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let entry: CachedGeneration =
            serde_json::from_str(&raw).map_err(|e| CoordError::Serialize(e.to_string()))?;
        if entry.is_expired() {
            return Ok(None);
        }
        Ok(Some(entry))
    }

    async fn cache_put(
        &self,
        fingerprint: &str,
        entry: &CachedGeneration,
    ) -> Result<(), CoordError> {
        let raw =
            serde_json::to_string(entry).map_err(|e| CoordError::Serialize(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(
                keys::result_cache(fingerprint),
                raw,
                crate::cache::CACHE_TTL_SECONDS,
            )
            .await
            .map_err(|e| CoordError::Connection(e.to_string()))?;
        Ok(())
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
