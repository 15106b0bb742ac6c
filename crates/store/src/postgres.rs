//! Postgres-backed repositories.
//!
//! Tenant isolation lives in every WHERE clause; status transitions are
//! compare-and-swap UPDATEs so two workers (or a worker racing a cancel)
//! can never both win. The queue claim uses `FOR UPDATE SKIP LOCKED` plus a
//! lease column, giving at most one active consumer per job even across
//! processes.
//!
//! Every public method runs under an instrumented span; CAS misses are
//! logged at debug so lost races stay visible without becoming noise.
//!
//! Schema: see `schema.sql` next to this crate.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument, Span};

use pixgate_core::{
    AspectRatio, Credential, CredentialId, EndpointTag, ErrorCode, GenerateParams, Job, JobId,
    JobMode, JobStatus, NewJob, Resolution, Tenant, TenantId,
};

use crate::{
    CancelOutcome, CredentialRepository, JobCursor, JobFilter, JobPage, JobRepository,
    StoreError, TenantRepository,
};

const CLAIM_LEASE_SECONDS: f64 = 300.0;

const JOB_COLUMNS: &str = "id, tenant_id, idempotency_key, status, mode, prompt, input_image, \
     resolution, aspect_ratio, sample_count, attempts, max_attempts, error_code, error_message, \
     credential_id, result_urls, scheduled_at, created_at, updated_at";

/// Postgres job repository.
#[derive(Clone)]
pub struct PostgresJobRepository {
    pool: Arc<PgPool>,
}

impl PostgresJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl JobRepository for PostgresJobRepository {
    #[instrument(
        skip(self, new),
        fields(
            tenant_id = %new.tenant_id,
            idempotent = new.idempotency_key.is_some(),
            job_id = tracing::field::Empty,
        ),
        err
    )]
    async fn create(&self, new: NewJob) -> Result<Job, StoreError> {
        let job = Job::create(new);

        let inserted = sqlx::query(&format!(
            r#"
            INSERT INTO jobs (
                id, tenant_id, idempotency_key, status, mode, prompt, input_image,
                resolution, aspect_ratio, sample_count, attempts, max_attempts,
                result_urls, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, '{{}}', $13, $13)
            ON CONFLICT (tenant_id, idempotency_key) DO NOTHING
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(job.id.as_str())
        .bind(job.tenant_id.as_uuid())
        .bind(job.idempotency_key.as_deref())
        .bind(job.status.as_str())
        .bind(job.params.mode.as_str())
        .bind(&job.params.prompt)
        .bind(job.params.input_image.as_deref())
        .bind(job.params.resolution.map(|r| r.as_str()))
        .bind(job.params.aspect_ratio.map(|a| a.as_str()))
        .bind(job.params.sample_count.map(|c| c as i32))
        .bind(job.attempts as i32)
        .bind(job.max_attempts as i32)
        .bind(job.created_at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("jobs.create", e))?;

        if let Some(row) = inserted {
            let job = job_from_row(&row)?;
            Span::current().record("job_id", job.id.as_str());
            return Ok(job);
        }

        // Conflict on (tenant, idempotency_key): hand back the existing row.
        let Some(key) = job.idempotency_key.as_deref() else {
            return Err(StoreError::Storage(
                "jobs.create: insert returned no row without an idempotency key".to_string(),
            ));
        };
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE tenant_id = $1 AND idempotency_key = $2"
        ))
        .bind(job.tenant_id.as_uuid())
        .bind(key)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("jobs.create.lookup", e))?;
        let existing = job_from_row(&row)?;
        Span::current().record("job_id", existing.id.as_str());
        debug!("idempotency key matched an existing job");
        Ok(existing)
    }

    #[instrument(skip(self, id), fields(tenant_id = %tenant_id, job_id = %id), err)]
    async fn get(&self, tenant_id: TenantId, id: &JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id.as_uuid())
        .bind(id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("jobs.get", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self, id), fields(job_id = %id), err)]
    async fn get_any(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("jobs.get_any", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(
        skip(self, filter),
        fields(tenant_id = %tenant_id, limit = filter.limit),
        err
    )]
    async fn list(&self, tenant_id: TenantId, filter: JobFilter) -> Result<JobPage, StoreError> {
        // Fetch one extra row to compute has_more without a COUNT.
        let fetch = (filter.limit + 1) as i64;
        let cursor = filter.cursor;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE tenant_id = $1
              AND ($2::text IS NULL OR status = $2)
              AND ($3::timestamptz IS NULL OR (created_at, id) < ($3, $4))
            ORDER BY created_at DESC, id DESC
            LIMIT $5
            "#
        ))
        .bind(tenant_id.as_uuid())
        .bind(filter.status.map(|s| s.as_str()))
        .bind(cursor.as_ref().map(|c| c.created_at))
        .bind(cursor.as_ref().map(|c| c.id.as_str()).unwrap_or(""))
        .bind(fetch)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("jobs.list", e))?;

        let mut items = rows
            .iter()
            .map(job_from_row)
            .collect::<Result<Vec<_>, _>>()?;

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

    #[instrument(skip(self), fields(job_id = tracing::field::Empty), err)]
    async fn claim_next(&self) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            WITH next AS (
                SELECT id FROM jobs
                WHERE status IN ('QUEUED', 'RETRYING')
                  AND (scheduled_at IS NULL OR scheduled_at <= now())
                  AND (claimed_until IS NULL OR claimed_until <= now())
                ORDER BY created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET claimed_until = now() + make_interval(secs => $1)
            WHERE id IN (SELECT id FROM next)
            RETURNING {JOB_COLUMNS}
            "#
        ))
        .bind(CLAIM_LEASE_SECONDS)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("jobs.claim_next", e))?;

        let claimed = row.as_ref().map(job_from_row).transpose()?;
        if let Some(job) = &claimed {
            Span::current().record("job_id", job.id.as_str());
            debug!(attempts = job.attempts, "claimed job under lease");
        }
        Ok(claimed)
    }

    #[instrument(
        skip(self, id, credential),
        fields(job_id = %id, credential_id = %credential),
        err
    )]
    async fn transition_running(
        &self,
        id: &JobId,
        credential: CredentialId,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'RUNNING', credential_id = $2, updated_at = now()
            WHERE id = $1 AND status IN ('QUEUED', 'RETRYING')
            "#,
        )
        .bind(id.as_str())
        .bind(credential.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("jobs.transition_running", e))?;

        let won = result.rows_affected() == 1;
        if !won {
            debug!("RUNNING transition lost the race (row settled elsewhere)");
        }
        Ok(won)
    }

    #[instrument(skip(self, id, url), fields(job_id = %id), err)]
    async fn append_result_url(&self, id: &JobId, url: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET result_urls = array_append(result_urls, $2), updated_at = now()
            WHERE id = $1 AND status = 'RUNNING'
            "#,
        )
        .bind(id.as_str())
        .bind(url)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("jobs.append_result_url", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, id), fields(job_id = %id), err)]
    async fn mark_succeeded(&self, id: &JobId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'SUCCEEDED', error_code = NULL, error_message = NULL,
                claimed_until = NULL, updated_at = now()
            WHERE id = $1 AND status = 'RUNNING'
            "#,
        )
        .bind(id.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("jobs.mark_succeeded", e))?;

        let won = result.rows_affected() == 1;
        if !won {
            debug!("SUCCEEDED transition lost the race; result discarded");
        }
        Ok(won)
    }

    #[instrument(
        skip(self, id, message),
        fields(job_id = %id, attempts, code = %code),
        err
    )]
    async fn mark_failed(
        &self,
        id: &JobId,
        attempts: u32,
        code: ErrorCode,
        message: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'FAILED', attempts = $2, error_code = $3, error_message = $4,
                scheduled_at = NULL, claimed_until = NULL, updated_at = now()
            WHERE id = $1 AND status IN ('QUEUED', 'RETRYING', 'RUNNING')
            "#,
        )
        .bind(id.as_str())
        .bind(attempts as i32)
        .bind(code.as_str())
        .bind(message)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("jobs.mark_failed", e))?;

        let won = result.rows_affected() == 1;
        if !won {
            debug!("FAILED transition lost the race");
        }
        Ok(won)
    }

    #[instrument(
        skip(self, id, message),
        fields(job_id = %id, attempts, code = %code),
        err
    )]
    async fn mark_retrying(
        &self,
        id: &JobId,
        attempts: u32,
        code: ErrorCode,
        message: &str,
        next_run_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'RETRYING', attempts = $2, error_code = $3, error_message = $4,
                scheduled_at = $5, claimed_until = NULL, updated_at = now()
            WHERE id = $1 AND status IN ('QUEUED', 'RETRYING', 'RUNNING')
            "#,
        )
        .bind(id.as_str())
        .bind(attempts as i32)
        .bind(code.as_str())
        .bind(message)
        .bind(next_run_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("jobs.mark_retrying", e))?;

        let won = result.rows_affected() == 1;
        if !won {
            debug!("RETRYING transition lost the race");
        }
        Ok(won)
    }

    #[instrument(skip(self, id), fields(tenant_id = %tenant_id, job_id = %id), err)]
    async fn cancel(&self, tenant_id: TenantId, id: &JobId) -> Result<CancelOutcome, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'CANCELED', claimed_until = NULL, updated_at = now()
            WHERE tenant_id = $1 AND id = $2 AND status IN ('QUEUED', 'RETRYING')
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(id.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("jobs.cancel", e))?;

        if result.rows_affected() == 1 {
            debug!("job canceled");
            return Ok(CancelOutcome::Canceled);
        }
        match self.get(tenant_id, id).await? {
            Some(job) => {
                debug!(status = %job.status, "cancel refused, job is not cancelable");
                Ok(CancelOutcome::IllegalState(job.status))
            }
            None => Ok(CancelOutcome::NotFound),
        }
    }
}

/// Postgres tenant repository.
#[derive(Clone)]
pub struct PostgresTenantRepository {
    pool: Arc<PgPool>,
}

impl PostgresTenantRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

const TENANT_COLUMNS: &str = "id, name, api_key_lookup, api_key_fingerprint, api_key_salt, \
     plan_rpm, plan_concurrency, webhook_url, webhook_secret, webhook_enabled";

#[async_trait]
impl TenantRepository for PostgresTenantRepository {
    #[instrument(skip(self, tenant), fields(tenant_id = %tenant.id), err)]
    async fn insert(&self, tenant: &Tenant) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO tenants (
                id, name, api_key_lookup, api_key_fingerprint, api_key_salt,
                plan_rpm, plan_concurrency, webhook_url, webhook_secret, webhook_enabled
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(tenant.id.as_uuid())
        .bind(&tenant.name)
        .bind(&tenant.api_key_lookup)
        .bind(&tenant.api_key_fingerprint)
        .bind(&tenant.api_key_salt)
        .bind(tenant.plan_rpm as i32)
        .bind(tenant.plan_concurrency as i32)
        .bind(tenant.webhook_url.as_deref())
        .bind(tenant.webhook_secret.as_deref())
        .bind(tenant.webhook_enabled)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("tenants.insert", e))?;
        Ok(())
    }

    #[instrument(skip(self, id), fields(tenant_id = %id), err)]
    async fn get(&self, id: TenantId) -> Result<Option<Tenant>, StoreError> {
        let row = sqlx::query(&format!("SELECT {TENANT_COLUMNS} FROM tenants WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("tenants.get", e))?;
        row.as_ref().map(tenant_from_row).transpose()
    }

    // The lookup hash stays out of the span; auth material never logs.
    #[instrument(skip(self, lookup), err)]
    async fn find_by_api_key_lookup(
        &self,
        lookup: &str,
    ) -> Result<Option<Tenant>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TENANT_COLUMNS} FROM tenants WHERE api_key_lookup = $1"
        ))
        .bind(lookup)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("tenants.find_by_api_key_lookup", e))?;
        row.as_ref().map(tenant_from_row).transpose()
    }
}

/// Postgres credential repository.
#[derive(Clone)]
pub struct PostgresCredentialRepository {
    pool: Arc<PgPool>,
}

impl PostgresCredentialRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl CredentialRepository for PostgresCredentialRepository {
    #[instrument(
        skip(self, credential),
        fields(credential_id = %credential.id, endpoint = %credential.endpoint),
        err
    )]
    async fn insert(&self, credential: &Credential) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO credentials (
                id, provider, endpoint, secret, rpm_limit, concurrency_limit,
                priority, enabled, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now())
            "#,
        )
        .bind(credential.id.as_uuid())
        .bind(&credential.provider)
        .bind(credential.endpoint.as_str())
        .bind(&credential.secret)
        .bind(credential.rpm_limit as i32)
        .bind(credential.concurrency_limit as i32)
        .bind(credential.priority)
        .bind(credential.enabled)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("credentials.insert", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list_enabled(&self, provider: &str) -> Result<Vec<Credential>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, provider, endpoint, secret, rpm_limit, concurrency_limit,
                   priority, enabled
            FROM credentials
            WHERE provider = $1 AND enabled
            ORDER BY created_at
            "#,
        )
        .bind(provider)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("credentials.list_enabled", e))?;
        rows.iter().map(credential_from_row).collect()
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let status: String = get(row, "status")?;
    let mode: String = get(row, "mode")?;
    let resolution: Option<String> = get(row, "resolution")?;
    let aspect_ratio: Option<String> = get(row, "aspect_ratio")?;
    let sample_count: Option<i32> = get(row, "sample_count")?;
    let error_code: Option<String> = get(row, "error_code")?;
    let credential_id: Option<uuid::Uuid> = get(row, "credential_id")?;
    let id: String = get(row, "id")?;
    let tenant_id: uuid::Uuid = get(row, "tenant_id")?;
    let attempts: i32 = get(row, "attempts")?;
    let max_attempts: i32 = get(row, "max_attempts")?;

    Ok(Job {
        id: JobId::from(id),
        tenant_id: TenantId::from_uuid(tenant_id),
        idempotency_key: get(row, "idempotency_key")?,
        status: parse_column::<JobStatus>("status", &status)?,
        params: GenerateParams {
            prompt: get(row, "prompt")?,
            mode: parse_column::<JobMode>("mode", &mode)?,
            input_image: get(row, "input_image")?,
            resolution: resolution
                .as_deref()
                .map(|s| parse_column::<Resolution>("resolution", s))
                .transpose()?,
            aspect_ratio: aspect_ratio
                .as_deref()
                .map(|s| parse_column::<AspectRatio>("aspect_ratio", s))
                .transpose()?,
            sample_count: sample_count.map(|c| c as u32),
        },
        attempts: attempts.max(0) as u32,
        max_attempts: max_attempts.max(0) as u32,
        error_code: error_code
            .as_deref()
            .map(|s| parse_column::<ErrorCode>("error_code", s))
            .transpose()?,
        error_message: get(row, "error_message")?,
        credential_id: credential_id.map(CredentialId::from_uuid),
        result_urls: get(row, "result_urls")?,
        scheduled_at: get(row, "scheduled_at")?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

fn tenant_from_row(row: &PgRow) -> Result<Tenant, StoreError> {
    let id: uuid::Uuid = get(row, "id")?;
    let plan_rpm: i32 = get(row, "plan_rpm")?;
    let plan_concurrency: i32 = get(row, "plan_concurrency")?;
    Ok(Tenant {
        id: TenantId::from_uuid(id),
        name: get(row, "name")?,
        api_key_lookup: get(row, "api_key_lookup")?,
        api_key_fingerprint: get(row, "api_key_fingerprint")?,
        api_key_salt: get(row, "api_key_salt")?,
        plan_rpm: plan_rpm.max(0) as u32,
        plan_concurrency: plan_concurrency.max(0) as u32,
        webhook_url: get(row, "webhook_url")?,
        webhook_secret: get(row, "webhook_secret")?,
        webhook_enabled: get(row, "webhook_enabled")?,
    })
}

fn credential_from_row(row: &PgRow) -> Result<Credential, StoreError> {
    let id: uuid::Uuid = get(row, "id")?;
    let endpoint: String = get(row, "endpoint")?;
    let rpm_limit: i32 = get(row, "rpm_limit")?;
    let concurrency_limit: i32 = get(row, "concurrency_limit")?;
    Ok(Credential {
        id: CredentialId::from_uuid(id),
        provider: get(row, "provider")?,
        endpoint: parse_column::<EndpointTag>("endpoint", &endpoint)?,
        secret: get(row, "secret")?,
        rpm_limit: rpm_limit.max(0) as u32,
        concurrency_limit: concurrency_limit.max(0) as u32,
        priority: get(row, "priority")?,
        enabled: get(row, "enabled")?,
    })
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::Storage(format!("column {column}: {e}")))
}

fn parse_column<T>(column: &str, raw: &str) -> Result<T, StoreError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e| StoreError::Storage(format!("column {column}: {e}")))
}

fn map_sqlx_error(operation: &str, error: sqlx::Error) -> StoreError {
    match &error {
        sqlx::Error::RowNotFound => StoreError::NotFound,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
            StoreError::Conflict(format!("{operation}: unique violation"))
        }
        _ => StoreError::Storage(format!("{operation}: {error}")),
    }
}
