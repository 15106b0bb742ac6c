//! Credential scheduler: pick one credential for a job.
//!
//! Filtering consults live coordination state (cooldowns, in-flight
//! counts); ranking is a pure comparator so two workers looking at equal
//! state choose the same winner.

use std::cmp::Ordering;

use pixgate_coord::{keys, CoordStore};
use pixgate_core::{Credential, EndpointTag};
use pixgate_provider::EndpointRegistry;
use pixgate_store::CredentialRepository;

use crate::WorkerError;

/// What the caller wants from the pool.
#[derive(Debug, Clone)]
pub struct PickRequest<'a> {
    pub provider: &'a str,
    pub model: &'a str,
    pub preferred_endpoint: Option<EndpointTag>,
    /// Endpoints already burned in the current attempt.
    pub exclude_endpoints: &'a [EndpointTag],
    /// When false, only `preferred_endpoint` credentials are considered.
    pub allow_fallback: bool,
}

/// A credential that survived filtering, annotated for ranking.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub credential: Credential,
    pub is_model_preferred: bool,
    pub is_endpoint_preferred: bool,
    pub health_score: u32,
    pub in_flight: u64,
    pub failure_rate: f64,
    /// Row-creation order; the final tie-break.
    pub insertion_index: usize,
}

/// Pick the best available credential, or `None` when the pool is drained.
pub async fn pick_credential(
    coord: &dyn CoordStore,
    credentials: &dyn CredentialRepository,
    registry: &EndpointRegistry,
    request: &PickRequest<'_>,
) -> Result<Option<Credential>, WorkerError> {
    let pool = credentials.list_enabled(request.provider).await?;

    let mut candidates = Vec::new();
    for (insertion_index, credential) in pool.into_iter().enumerate() {
        if request.exclude_endpoints.contains(&credential.endpoint) {
            continue;
        }
        if !request.allow_fallback {
            match request.preferred_endpoint {
                Some(preferred) if credential.endpoint != preferred => continue,
                _ => {}
            }
        }

        let health = coord.health_probe(credential.id).await?;
        if !health.available {
            continue;
        }
        let in_flight = coord
            .inflight_count(&keys::credential_inflight(credential.id))
            .await?;
        if in_flight >= u64::from(credential.concurrency_limit) {
            continue;
        }

        let rollup = coord.health_rollup(credential.id).await?;
        candidates.push(Candidate {
            is_model_preferred: registry.is_model_preferred(credential.endpoint, request.model),
            is_endpoint_preferred: request.preferred_endpoint == Some(credential.endpoint),
            health_score: rollup.health_score(),
            in_flight,
            failure_rate: rollup.failure_rate(),
            insertion_index,
            credential,
        });
    }

    rank_candidates(&mut candidates);
    Ok(candidates.into_iter().next().map(|c| c.credential))
}

/// Deterministic ranking: model-preferred endpoint, caller-preferred
/// endpoint, priority, health score (only when the gap exceeds 10),
/// in-flight load, failure rate, then insertion order.
pub fn rank_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(compare);
}

fn compare(a: &Candidate, b: &Candidate) -> Ordering {
    b.is_model_preferred
        .cmp(&a.is_model_preferred)
        .then(b.is_endpoint_preferred.cmp(&a.is_endpoint_preferred))
        .then(a.credential.priority.cmp(&b.credential.priority))
        .then_with(|| {
            // Health only separates candidates when the gap is meaningful;
            // small score noise must not destabilize the ordering.
            if a.health_score.abs_diff(b.health_score) > 10 {
                b.health_score.cmp(&a.health_score)
            } else {
                Ordering::Equal
            }
        })
        .then(a.in_flight.cmp(&b.in_flight))
        .then_with(|| {
            a.failure_rate
                .partial_cmp(&b.failure_rate)
                .unwrap_or(Ordering::Equal)
        })
        .then(a.insertion_index.cmp(&b.insertion_index))
}
