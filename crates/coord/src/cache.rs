//! Prompt-fingerprinted result cache.
//!
//! The cache is advisory: a stale entry whose blobs were deleted surfaces as
//! broken URLs, acceptable within the 24h TTL window.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use pixgate_core::{AspectRatio, GenerateParams, JobMode, Resolution};

/// Cache entry lifetime.
pub const CACHE_TTL_SECONDS: u64 = 24 * 60 * 60;

/// Prompts shorter than this never hit the cache; trivially short prompts
/// collide too easily to be worth caching.
pub const MIN_CACHEABLE_PROMPT_LEN: usize = 10;

/// A previously produced generation, stored under its fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedGeneration {
    pub urls: Vec<String>,
    pub model: String,
    /// Milliseconds since epoch after which the entry is dead even if the
    /// store has not evicted it yet.
    pub expires_at_ms: i64,
}

impl CachedGeneration {
    pub fn new(urls: Vec<String>, model: impl Into<String>) -> Self {
        Self {
            urls,
            model: model.into(),
            expires_at_ms: Utc::now().timestamp_millis() + (CACHE_TTL_SECONDS as i64) * 1000,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp_millis() >= self.expires_at_ms
    }
}

/// Whether this request may read or write the cache.
///
/// Only `final` mode with a non-trivial prompt participates; `draft` never
/// reads or writes.
pub fn cache_eligible(params: &GenerateParams) -> bool {
    params.mode == JobMode::Final && params.prompt.len() >= MIN_CACHEABLE_PROMPT_LEN
}

/// Hash of the fields that uniquely determine a generation result.
pub fn fingerprint(
    prompt: &str,
    model: &str,
    resolution: Option<Resolution>,
    aspect_ratio: Option<AspectRatio>,
    sample_count: Option<u32>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(b"\n");
    hasher.update(model.as_bytes());
    hasher.update(b"\n");
    hasher.update(resolution.map(|r| r.as_str()).unwrap_or("-").as_bytes());
    hasher.update(b"\n");
    hasher.update(aspect_ratio.map(|a| a.as_str()).unwrap_or("-").as_bytes());
    hasher.update(b"\n");
    hasher.update(sample_count.unwrap_or(0).to_string().as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Fingerprint for a job's parameter set against a concrete model.
pub fn fingerprint_params(params: &GenerateParams, model: &str) -> String {
    fingerprint(
        &params.prompt,
        model,
        params.resolution,
        params.aspect_ratio,
        params.sample_count,
    )
}
