//! Persistent repositories: job rows, tenants, and the credential pool.
//!
//! Postgres implementations enforce tenant isolation and compare-and-swap
//! status transitions at the database level; the in-memory implementations
//! mirror the same contracts for dev and tests.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};

use pixgate_core::{
    Credential, CredentialId, ErrorCode, Job, JobId, JobStatus, NewJob, Tenant, TenantId,
};

pub use memory::{InMemoryCredentialRepository, InMemoryJobRepository, InMemoryTenantRepository};
pub use postgres::{PostgresCredentialRepository, PostgresJobRepository, PostgresTenantRepository};

/// Repository error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid cursor")]
    InvalidCursor,
    #[error("storage error: {0}")]
    Storage(String),
}

/// Filter/paging options for job listings.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub limit: usize,
    pub cursor: Option<JobCursor>,
}

/// One page of a job listing, newest first.
#[derive(Debug, Clone)]
pub struct JobPage {
    pub items: Vec<Job>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// Keyset cursor over `(created_at, id)`, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCursor {
    pub created_at: DateTime<Utc>,
    pub id: String,
}

impl JobCursor {
    pub fn encode(&self) -> String {
        let raw = format!("{}:{}", self.created_at.timestamp_micros(), self.id);
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(raw)
    }

    pub fn decode(encoded: &str) -> Result<Self, StoreError> {
        let raw = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|_| StoreError::InvalidCursor)?;
        let raw = String::from_utf8(raw).map_err(|_| StoreError::InvalidCursor)?;
        let (micros, id) = raw.split_once(':').ok_or(StoreError::InvalidCursor)?;
        let micros: i64 = micros.parse().map_err(|_| StoreError::InvalidCursor)?;
        let created_at = Utc
            .timestamp_micros(micros)
            .single()
            .ok_or(StoreError::InvalidCursor)?;
        if id.is_empty() {
            return Err(StoreError::InvalidCursor);
        }
        Ok(Self {
            created_at,
            id: id.to_string(),
        })
    }
}

/// Outcome of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Canceled,
    NotFound,
    /// The row exists but is not in a cancelable state.
    IllegalState(JobStatus),
}

/// Persistent job rows: creation, the queue, and CAS status transitions.
///
/// Every transition method returns whether the compare-and-swap took
/// effect; a `false` means the row moved underneath the caller (typically a
/// concurrent cancel) and the caller's result must be discarded.
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Create a job row. When `idempotency_key` is present and a row with
    /// the same `(tenant, key)` already exists, the existing row is returned
    /// and nothing is created.
    async fn create(&self, new: NewJob) -> Result<Job, StoreError>;

    /// Tenant-scoped read.
    async fn get(&self, tenant_id: TenantId, id: &JobId) -> Result<Option<Job>, StoreError>;

    /// Unscoped read (worker path).
    async fn get_any(&self, id: &JobId) -> Result<Option<Job>, StoreError>;

    /// List a tenant's jobs, newest first, with keyset paging.
    async fn list(&self, tenant_id: TenantId, filter: JobFilter) -> Result<JobPage, StoreError>;

    /// Claim the next ready job under a lease, guaranteeing at most one
    /// active consumer per job. Returns `None` when nothing is ready.
    async fn claim_next(&self) -> Result<Option<Job>, StoreError>;

    /// CAS `QUEUED|RETRYING → RUNNING`, persisting the chosen credential.
    async fn transition_running(
        &self,
        id: &JobId,
        credential: CredentialId,
    ) -> Result<bool, StoreError>;

    /// Append one result URL to a running job (progressive results).
    async fn append_result_url(&self, id: &JobId, url: &str) -> Result<bool, StoreError>;

    /// CAS `RUNNING → SUCCEEDED`.
    async fn mark_succeeded(&self, id: &JobId) -> Result<bool, StoreError>;

    /// CAS into `FAILED`, recording attempts and the error.
    async fn mark_failed(
        &self,
        id: &JobId,
        attempts: u32,
        code: ErrorCode,
        message: &str,
    ) -> Result<bool, StoreError>;

    /// CAS into `RETRYING`, recording attempts, the error, and the earliest
    /// next run time.
    async fn mark_retrying(
        &self,
        id: &JobId,
        attempts: u32,
        code: ErrorCode,
        message: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Tenant-requested cancel; legal only from `QUEUED`/`RETRYING`.
    async fn cancel(&self, tenant_id: TenantId, id: &JobId) -> Result<CancelOutcome, StoreError>;
}

/// Tenant rows. Seeded out-of-band.
#[async_trait]
pub trait TenantRepository: Send + Sync {
    async fn insert(&self, tenant: &Tenant) -> Result<(), StoreError>;

    async fn get(&self, id: TenantId) -> Result<Option<Tenant>, StoreError>;

    /// Index lookup by the unsalted key hash; the caller verifies the
    /// salted fingerprint in constant time.
    async fn find_by_api_key_lookup(&self, lookup: &str)
        -> Result<Option<Tenant>, StoreError>;
}

/// Credential pool rows. Seeded out-of-band; referenced, never copied.
#[async_trait]
pub trait CredentialRepository: Send + Sync {
    async fn insert(&self, credential: &Credential) -> Result<(), StoreError>;

    /// Enabled credentials for a provider, in row-creation order. The
    /// scheduler relies on that order for deterministic tie-breaks.
    async fn list_enabled(&self, provider: &str) -> Result<Vec<Credential>, StoreError>;
}
