//! In-memory repositories for dev mode and tests.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use pixgate_core::{
    Credential, CredentialId, ErrorCode, Job, JobId, JobStatus, NewJob, Tenant, TenantId,
};

use crate::{
    CancelOutcome, CredentialRepository, JobCursor, JobFilter, JobPage, JobRepository,
    StoreError, TenantRepository,
};

const CLAIM_LEASE_SECONDS: i64 = 5 * 60;

/// In-memory job repository.
#[derive(Default)]
pub struct InMemoryJobRepository {
    inner: RwLock<JobsState>,
}

#[derive(Default)]
struct JobsState {
    jobs: HashMap<String, Job>,
    /// Claim leases: job id -> lease expiry.
    leases: HashMap<String, DateTime<Utc>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn create(&self, new: NewJob) -> Result<Job, StoreError> {
        let mut state = self.inner.write().unwrap();

        if let Some(key) = &new.idempotency_key {
            let existing = state.jobs.values().find(|j| {
                j.tenant_id == new.tenant_id && j.idempotency_key.as_deref() == Some(key)
            });
            if let Some(existing) = existing {
                return Ok(existing.clone());
            }
        }

        let job = Job::create(new);
        state.jobs.insert(job.id.as_str().to_string(), job.clone());
        Ok(job)
    }

    async fn get(&self, tenant_id: TenantId, id: &JobId) -> Result<Option<Job>, StoreError> {
        let state = self.inner.read().unwrap();
        Ok(state
            .jobs
            .get(id.as_str())
            .filter(|j| j.tenant_id == tenant_id)
            .cloned())
    }

    async fn get_any(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        let state = self.inner.read().unwrap();
        Ok(state.jobs.get(id.as_str()).cloned())
    }

    async fn list(&self, tenant_id: TenantId, filter: JobFilter) -> Result<JobPage, StoreError> {
        let state = self.inner.read().unwrap();
        let mut items: Vec<Job> = state
            .jobs
            .values()
            .filter(|j| j.tenant_id == tenant_id)
            .filter(|j| filter.status.map_or(true, |s| j.status == s))
            .filter(|j| match &filter.cursor {
                Some(cursor) => {
                    (j.created_at, j.id.as_str()) < (cursor.created_at, cursor.id.as_str())
                }
                None => true,
            })
            .cloned()
            .collect();

        // Newest first; id as tie-break for identical timestamps.
        items.sort_by(|a, b| {
            (b.created_at, b.id.as_str()).cmp(&(a.created_at, a.id.as_str()))
        });

        let has_more = items.len() > filter.limit;
        items.truncate(filter.limit);
        let next_cursor = if has_more {
            items.last().map(|j| {
                JobCursor {
                    created_at: j.created_at,
                    id: j.id.as_str().to_string(),
                }
                .encode()
            })
        } else {
            None
        };

        Ok(JobPage {
            items,
            next_cursor,
            has_more,
        })
    }

    async fn claim_next(&self) -> Result<Option<Job>, StoreError> {
        let now = Utc::now();
        let mut state = self.inner.write().unwrap();

        let mut candidates: Vec<&Job> = state
            .jobs
            .values()
            .filter(|j| j.status.is_claimable())
            .filter(|j| j.scheduled_at.map_or(true, |at| at <= now))
            .filter(|j| {
                state
                    .leases
                    .get(j.id.as_str())
                    .map_or(true, |lease| *lease <= now)
            })
            .collect();
        candidates.sort_by_key(|j| j.created_at);

        let Some(job) = candidates.first().map(|j| (*j).clone()) else {
            return Ok(None);
        };
        state.leases.insert(
            job.id.as_str().to_string(),
            now + Duration::seconds(CLAIM_LEASE_SECONDS),
        );
        Ok(Some(job))
    }

    async fn transition_running(
        &self,
        id: &JobId,
        credential: CredentialId,
    ) -> Result<bool, StoreError> {
        let mut state = self.inner.write().unwrap();
        let Some(job) = state.jobs.get_mut(id.as_str()) else {
            return Ok(false);
        };
        if !job.status.is_claimable() {
            return Ok(false);
        }
        job.status = JobStatus::Running;
        job.credential_id = Some(credential);
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn append_result_url(&self, id: &JobId, url: &str) -> Result<bool, StoreError> {
        let mut state = self.inner.write().unwrap();
        let Some(job) = state.jobs.get_mut(id.as_str()) else {
            return Ok(false);
        };
        if job.status != JobStatus::Running {
            return Ok(false);
        }
        job.result_urls.push(url.to_string());
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_succeeded(&self, id: &JobId) -> Result<bool, StoreError> {
        let mut state = self.inner.write().unwrap();
        state.leases.remove(id.as_str());
        let Some(job) = state.jobs.get_mut(id.as_str()) else {
            return Ok(false);
        };
        if job.status != JobStatus::Running {
            return Ok(false);
        }
        job.status = JobStatus::Succeeded;
        job.error_code = None;
        job.error_message = None;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_failed(
        &self,
        id: &JobId,
        attempts: u32,
        code: ErrorCode,
        message: &str,
    ) -> Result<bool, StoreError> {
        let mut state = self.inner.write().unwrap();
        state.leases.remove(id.as_str());
        let Some(job) = state.jobs.get_mut(id.as_str()) else {
            return Ok(false);
        };
        if job.status.is_terminal() {
            return Ok(false);
        }
        job.status = JobStatus::Failed;
        job.attempts = attempts;
        job.error_code = Some(code);
        job.error_message = Some(message.to_string());
        job.scheduled_at = None;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn mark_retrying(
        &self,
        id: &JobId,
        attempts: u32,
        code: ErrorCode,
        message: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.inner.write().unwrap();
        state.leases.remove(id.as_str());
        let Some(job) = state.jobs.get_mut(id.as_str()) else {
            return Ok(false);
        };
        if job.status.is_terminal() {
            return Ok(false);
        }
        job.status = JobStatus::Retrying;
        job.attempts = attempts;
        job.error_code = Some(code);
        job.error_message = Some(message.to_string());
        job.scheduled_at = Some(next_run_at);
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn cancel(&self, tenant_id: TenantId, id: &JobId) -> Result<CancelOutcome, StoreError> {
        let mut state = self.inner.write().unwrap();
        let Some(job) = state.jobs.get_mut(id.as_str()) else {
            return Ok(CancelOutcome::NotFound);
        };
        if job.tenant_id != tenant_id {
            return Ok(CancelOutcome::NotFound);
        }
        if !job.status.is_claimable() {
            return Ok(CancelOutcome::IllegalState(job.status));
        }
        job.status = JobStatus::Canceled;
        job.updated_at = Utc::now();
        state.leases.remove(id.as_str());
        Ok(CancelOutcome::Canceled)
    }
}

/// In-memory tenant repository.
#[derive(Default)]
pub struct InMemoryTenantRepository {
    tenants: RwLock<HashMap<TenantId, Tenant>>,
}

impl InMemoryTenantRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TenantRepository for InMemoryTenantRepository {
    async fn insert(&self, tenant: &Tenant) -> Result<(), StoreError> {
        let mut tenants = self.tenants.write().unwrap();
        if tenants.contains_key(&tenant.id) {
            return Err(StoreError::Conflict(format!(
                "tenant {} already exists",
                tenant.id
            )));
        }
        tenants.insert(tenant.id, tenant.clone());
        Ok(())
    }

    async fn get(&self, id: TenantId) -> Result<Option<Tenant>, StoreError> {
        Ok(self.tenants.read().unwrap().get(&id).cloned())
    }

    async fn find_by_api_key_lookup(
        &self,
        lookup: &str,
    ) -> Result<Option<Tenant>, StoreError> {
        Ok(self
            .tenants
            .read()
            .unwrap()
            .values()
            .find(|t| t.api_key_lookup == lookup)
            .cloned())
    }
}

/// In-memory credential repository. Insertion order is preserved because
/// the scheduler tie-breaks on row-creation order.
#[derive(Default)]
pub struct InMemoryCredentialRepository {
    credentials: RwLock<Vec<Credential>>,
}

impl InMemoryCredentialRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialRepository for InMemoryCredentialRepository {
    async fn insert(&self, credential: &Credential) -> Result<(), StoreError> {
        let mut credentials = self.credentials.write().unwrap();
        if credentials.iter().any(|c| c.id == credential.id) {
            return Err(StoreError::Conflict(format!(
                "credential {} already exists",
                credential.id
            )));
        }
        credentials.push(credential.clone());
        Ok(())
    }

    async fn list_enabled(&self, provider: &str) -> Result<Vec<Credential>, StoreError> {
        Ok(self
            .credentials
            .read()
            .unwrap()
            .iter()
            .filter(|c| c.enabled && c.provider == provider)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pixgate_core::{EndpointTag, GenerateParams, JobMode};

    fn new_job(tenant_id: TenantId, idempotency_key: Option<&str>) -> NewJob {
        NewJob {
            tenant_id,
            idempotency_key: idempotency_key.map(str::to_string),
            params: GenerateParams {
                prompt: "a red apple on a table".to_string(),
                mode: JobMode::Final,
                input_image: None,
                resolution: None,
                aspect_ratio: None,
                sample_count: None,
            },
            max_attempts: 4,
        }
    }

    #[tokio::test]
    async fn idempotent_create_returns_the_same_row() {
        let repo = InMemoryJobRepository::new();
        let tenant = TenantId::new();

        let first = repo.create(new_job(tenant, Some("k1"))).await.unwrap();
        let second = repo.create(new_job(tenant, Some("k1"))).await.unwrap();
        assert_eq!(first.id, second.id);

        // A different tenant with the same key gets its own row.
        let other = repo
            .create(new_job(TenantId::new(), Some("k1")))
            .await
            .unwrap();
        assert_ne!(first.id, other.id);
    }

    #[tokio::test]
    async fn claim_is_exclusive_until_released() {
        let repo = InMemoryJobRepository::new();
        let tenant = TenantId::new();
        let job = repo.create(new_job(tenant, None)).await.unwrap();

        let claimed = repo.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, job.id);
        // Leased: a second consumer sees nothing.
        assert!(repo.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn running_transition_is_cas_guarded() {
        let repo = InMemoryJobRepository::new();
        let tenant = TenantId::new();
        let job = repo.create(new_job(tenant, None)).await.unwrap();
        let cred = CredentialId::new();

        assert!(repo.transition_running(&job.id, cred).await.unwrap());
        // Already running; the CAS fails the second time.
        assert!(!repo.transition_running(&job.id, cred).await.unwrap());

        let loaded = repo.get_any(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Running);
        assert_eq!(loaded.credential_id, Some(cred));
    }

    #[tokio::test]
    async fn cancel_from_queued_beats_the_worker() {
        let repo = InMemoryJobRepository::new();
        let tenant = TenantId::new();
        let job = repo.create(new_job(tenant, None)).await.unwrap();

        assert_eq!(
            repo.cancel(tenant, &job.id).await.unwrap(),
            CancelOutcome::Canceled
        );
        // The worker's RUNNING CAS now fails.
        assert!(!repo
            .transition_running(&job.id, CredentialId::new())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn cancel_is_illegal_once_running() {
        let repo = InMemoryJobRepository::new();
        let tenant = TenantId::new();
        let job = repo.create(new_job(tenant, None)).await.unwrap();
        repo.transition_running(&job.id, CredentialId::new())
            .await
            .unwrap();

        assert_eq!(
            repo.cancel(tenant, &job.id).await.unwrap(),
            CancelOutcome::IllegalState(JobStatus::Running)
        );
    }

    #[tokio::test]
    async fn cancel_is_tenant_scoped() {
        let repo = InMemoryJobRepository::new();
        let tenant = TenantId::new();
        let job = repo.create(new_job(tenant, None)).await.unwrap();

        assert_eq!(
            repo.cancel(TenantId::new(), &job.id).await.unwrap(),
            CancelOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn result_urls_append_only_while_running() {
        let repo = InMemoryJobRepository::new();
        let tenant = TenantId::new();
        let job = repo.create(new_job(tenant, None)).await.unwrap();

        // Not running yet.
        assert!(!repo.append_result_url(&job.id, "https://b/0.png").await.unwrap());

        repo.transition_running(&job.id, CredentialId::new())
            .await
            .unwrap();
        assert!(repo.append_result_url(&job.id, "https://b/0.png").await.unwrap());
        assert!(repo.append_result_url(&job.id, "https://b/1.png").await.unwrap());

        let loaded = repo.get_any(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.result_urls, vec!["https://b/0.png", "https://b/1.png"]);
    }

    #[tokio::test]
    async fn retrying_jobs_become_claimable_when_due() {
        let repo = InMemoryJobRepository::new();
        let tenant = TenantId::new();
        let job = repo.create(new_job(tenant, None)).await.unwrap();

        repo.claim_next().await.unwrap().unwrap();
        repo.transition_running(&job.id, CredentialId::new())
            .await
            .unwrap();
        repo.mark_retrying(
            &job.id,
            1,
            ErrorCode::ServerError,
            "boom",
            Utc::now() - Duration::seconds(1),
        )
        .await
        .unwrap();

        let reclaimed = repo.claim_next().await.unwrap().unwrap();
        assert_eq!(reclaimed.id, job.id);
        assert_eq!(reclaimed.status, JobStatus::Retrying);
        assert_eq!(reclaimed.attempts, 1);
    }

    #[tokio::test]
    async fn backoff_delays_reclaim() {
        let repo = InMemoryJobRepository::new();
        let tenant = TenantId::new();
        let job = repo.create(new_job(tenant, None)).await.unwrap();

        repo.claim_next().await.unwrap().unwrap();
        repo.transition_running(&job.id, CredentialId::new())
            .await
            .unwrap();
        repo.mark_retrying(
            &job.id,
            1,
            ErrorCode::ServerError,
            "boom",
            Utc::now() + Duration::seconds(60),
        )
        .await
        .unwrap();

        assert!(repo.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn listing_pages_newest_first() {
        let repo = InMemoryJobRepository::new();
        let tenant = TenantId::new();
        for _ in 0..5 {
            repo.create(new_job(tenant, None)).await.unwrap();
        }

        let page = repo
            .list(
                tenant,
                JobFilter {
                    status: None,
                    limit: 2,
                    cursor: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page.has_more);
        assert!(page.items[0].created_at >= page.items[1].created_at);

        let cursor = JobCursor::decode(page.next_cursor.as_deref().unwrap()).unwrap();
        let next = repo
            .list(
                tenant,
                JobFilter {
                    status: None,
                    limit: 10,
                    cursor: Some(cursor),
                },
            )
            .await
            .unwrap();
        assert_eq!(next.items.len(), 3);
        assert!(!next.has_more);

        // No overlap between pages.
        for item in &next.items {
            assert!(page.items.iter().all(|j| j.id != item.id));
        }
    }

    #[tokio::test]
    async fn credential_listing_preserves_insertion_order() {
        let repo = InMemoryCredentialRepository::new();
        let mut ids = Vec::new();
        for i in 0..3 {
            let cred = Credential {
                id: CredentialId::new(),
                provider: "gemini".to_string(),
                endpoint: EndpointTag::Primary,
                secret: format!("secret-{i}"),
                rpm_limit: 60,
                concurrency_limit: 4,
                priority: 0,
                enabled: true,
            };
            ids.push(cred.id);
            repo.insert(&cred).await.unwrap();
        }

        let listed = repo.list_enabled("gemini").await.unwrap();
        let listed_ids: Vec<_> = listed.iter().map(|c| c.id).collect();
        assert_eq!(listed_ids, ids);
        assert!(repo.list_enabled("other").await.unwrap().is_empty());
    }
}
