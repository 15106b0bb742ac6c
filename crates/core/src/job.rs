//! Job entity, status state machine, and retry policy.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult, ErrorCode};
use crate::id::{CredentialId, JobId, TenantId};
use crate::request::GenerateParams;

/// Generation mode. Draft trades quality for latency and never touches the
/// result cache.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobMode {
    Draft,
    Final,
}

impl JobMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Final => "final",
        }
    }
}

impl FromStr for JobMode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "final" => Ok(Self::Final),
            other => Err(DomainError::validation(format!(
                "mode must be draft or final (got {other})"
            ))),
        }
    }
}

/// Job execution status.
///
/// `QUEUED → RUNNING → SUCCEEDED | FAILED`, with `RETRYING` equivalent to
/// `QUEUED` for the worker but visible to pollers. `CANCELED` is reachable
/// only from `QUEUED`/`RETRYING`. Terminal rows are immutable apart from
/// timestamps.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum JobStatus {
    Queued,
    Running,
    Retrying,
    Succeeded,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Retrying => "RETRYING",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    /// Whether the queue may hand this job to a worker.
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Queued | Self::Retrying)
    }

    /// The legal transitions of the state machine.
    pub fn can_transition(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Queued, Running)
                | (Queued, Canceled)
                | (Retrying, Running)
                | (Retrying, Canceled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Retrying)
        )
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(Self::Queued),
            "RUNNING" => Ok(Self::Running),
            "RETRYING" => Ok(Self::Retrying),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            "CANCELED" => Ok(Self::Canceled),
            other => Err(DomainError::validation(format!(
                "unknown job status: {other}"
            ))),
        }
    }
}

impl From<JobStatus> for String {
    fn from(value: JobStatus) -> Self {
        value.as_str().to_string()
    }
}

impl TryFrom<String> for JobStatus {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Retry backoff policy at the queue layer.
///
/// Exponential from a 2s base; `SERVICE_OVERLOAD` gets a longer cap so an
/// overloaded upstream is probed less aggressively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub overload_max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 2_000,
            max_delay_ms: 30_000,
            overload_max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the given attempt number (1-indexed: the delay that
    /// follows failure number `attempt`).
    pub fn delay_for_attempt(&self, attempt: u32, code: ErrorCode) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let cap = if code == ErrorCode::ServiceOverload {
            self.overload_max_delay_ms
        } else {
            self.max_delay_ms
        };
        let exp = 2_u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.base_delay_ms.saturating_mul(exp).min(cap))
    }

    pub fn should_retry(&self, attempts: u32, code: ErrorCode) -> bool {
        code.is_retryable() && attempts < self.max_attempts
    }
}

/// Input for creating a job row.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub tenant_id: TenantId,
    pub idempotency_key: Option<String>,
    pub params: GenerateParams,
    pub max_attempts: u32,
}

/// A persistent record of one image-generation request and its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub idempotency_key: Option<String>,
    pub status: JobStatus,
    pub params: GenerateParams,
    pub attempts: u32,
    pub max_attempts: u32,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub credential_id: Option<CredentialId>,
    /// Append-only once the job is running; order mirrors upload completion.
    pub result_urls: Vec<String>,
    /// Earliest time the queue may hand the job out again (retry backoff).
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn create(new: NewJob) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            tenant_id: new.tenant_id,
            idempotency_key: new.idempotency_key,
            status: JobStatus::Queued,
            params: new.params,
            attempts: 0,
            max_attempts: new.max_attempts,
            error_code: None,
            error_message: None,
            credential_id: None,
            result_urls: Vec::new(),
            scheduled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a transition, enforcing state-machine legality.
    pub fn transition(&mut self, to: JobStatus) -> DomainResult<()> {
        if !self.status.can_transition(to) {
            return Err(DomainError::illegal_transition(format!(
                "{} -> {}",
                self.status, to
            )));
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::GenerateParams;

    fn new_job() -> Job {
        Job::create(NewJob {
            tenant_id: TenantId::new(),
            idempotency_key: None,
            params: GenerateParams {
                prompt: "a red apple".to_string(),
                mode: JobMode::Final,
                input_image: None,
                resolution: None,
                aspect_ratio: None,
                sample_count: None,
            },
            max_attempts: 4,
        })
    }

    #[test]
    fn happy_path_transitions() {
        let mut job = new_job();
        job.transition(JobStatus::Running).unwrap();
        job.transition(JobStatus::Succeeded).unwrap();
        assert!(job.status.is_terminal());
    }

    #[test]
    fn terminal_states_are_sticky() {
        let mut job = new_job();
        job.transition(JobStatus::Running).unwrap();
        job.transition(JobStatus::Failed).unwrap();
        assert!(job.transition(JobStatus::Running).is_err());
        assert!(job.transition(JobStatus::Queued).is_err());
    }

    #[test]
    fn cancel_only_from_queued_or_retrying() {
        let mut job = new_job();
        job.transition(JobStatus::Canceled).unwrap();

        let mut job = new_job();
        job.transition(JobStatus::Running).unwrap();
        assert!(job.transition(JobStatus::Canceled).is_err());

        let mut job = new_job();
        job.transition(JobStatus::Running).unwrap();
        job.transition(JobStatus::Retrying).unwrap();
        job.transition(JobStatus::Canceled).unwrap();
    }

    #[test]
    fn backoff_doubles_from_two_seconds() {
        let policy = RetryPolicy::default();
        let code = ErrorCode::ServerError;
        assert_eq!(
            policy.delay_for_attempt(1, code),
            Duration::from_millis(2_000)
        );
        assert_eq!(
            policy.delay_for_attempt(2, code),
            Duration::from_millis(4_000)
        );
        assert_eq!(
            policy.delay_for_attempt(3, code),
            Duration::from_millis(8_000)
        );
        // Capped at 30s for ordinary retryable failures.
        assert_eq!(
            policy.delay_for_attempt(10, code),
            Duration::from_millis(30_000)
        );
    }

    #[test]
    fn overload_extends_the_backoff_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_for_attempt(10, ErrorCode::ServiceOverload),
            Duration::from_millis(60_000)
        );
    }

    #[test]
    fn retry_requires_budget_and_retryable_code() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1, ErrorCode::ServerError));
        assert!(policy.should_retry(3, ErrorCode::ServerError));
        assert!(!policy.should_retry(4, ErrorCode::ServerError));
        assert!(!policy.should_retry(1, ErrorCode::InvalidRequest));
    }
}
