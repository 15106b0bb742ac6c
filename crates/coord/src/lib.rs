//! Coordination-store client: the atomic primitives every worker process
//! shares through Redis.
//!
//! All counter mutations go through the scripted primitives on
//! [`CoordStore`]; nothing does read-modify-write outside a script. The
//! in-memory implementation mirrors the same semantics for dev and tests.

pub mod cache;
pub mod keys;
pub mod memory;
pub mod redis;
mod store;

pub use cache::{
    cache_eligible, fingerprint, fingerprint_params, CachedGeneration, CACHE_TTL_SECONDS,
};
pub use memory::InMemoryCoordStore;
pub use redis::RedisCoordStore;
pub use store::{
    ConcDecision, CoordConfig, CoordError, CoordStore, CredentialHealth, EndpointOutcome,
    HealthRollup, RpmDecision,
};
