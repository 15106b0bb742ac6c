//! The job executor: one job through the admission pipeline, the provider,
//! storage, and notification.
//!
//! Admission tokens are acquired Global → Credential → Tenant and released
//! in reverse on every exit path; the fixed order keeps two workers from
//! deadlocking across credential-scope and tenant-scope counters.

use std::sync::Arc;

use base64::Engine as _;
use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use pixgate_coord::{
    cache_eligible, fingerprint_params, keys, CachedGeneration, CoordStore, EndpointOutcome,
};
use pixgate_core::{request::split_data_uri, ErrorCode, Job, JobStatus, RetryPolicy, Tenant};
use pixgate_provider::{EndpointRegistry, GenerateRequest, ImageProvider};
use pixgate_storage::BlobStore;
use pixgate_store::{JobRepository, TenantRepository};
use pixgate_webhook::{WebhookEvent, WebhookSender};

use crate::scheduler::{pick_credential, PickRequest};
use crate::WorkerError;

/// Executor tunables.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Provider tag the credential pool is filtered on.
    pub provider: String,
    pub model: String,
    pub global_rpm: u32,
    pub global_concurrency: u32,
    /// Sliding-window length for every RPM scope.
    pub rpm_window_ms: u64,
    pub retry_policy: RetryPolicy,
    pub endpoint_fallback: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            provider: "gemini".to_string(),
            model: pixgate_provider::DEFAULT_MODEL.to_string(),
            global_rpm: 600,
            global_concurrency: 100,
            rpm_window_ms: 60_000,
            retry_policy: RetryPolicy::default(),
            endpoint_fallback: true,
        }
    }
}

/// How one execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    Succeeded { cached: bool },
    Retrying { code: ErrorCode },
    Failed { code: ErrorCode },
    /// The row was canceled or already terminal before work began.
    Skipped,
    /// The row moved underneath a finished run; the result was discarded.
    Discarded,
}

enum Run {
    Completed(ExecOutcome),
    Denied { code: ErrorCode, message: String },
}

/// Executes one claimed job end to end.
#[derive(Clone)]
pub struct JobExecutor {
    coord: Arc<dyn CoordStore>,
    jobs: Arc<dyn JobRepository>,
    tenants: Arc<dyn TenantRepository>,
    credentials: Arc<dyn pixgate_store::CredentialRepository>,
    provider: Arc<dyn ImageProvider>,
    blobs: Arc<dyn BlobStore>,
    webhooks: WebhookSender,
    registry: EndpointRegistry,
    config: ExecutorConfig,
}

impl JobExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        coord: Arc<dyn CoordStore>,
        jobs: Arc<dyn JobRepository>,
        tenants: Arc<dyn TenantRepository>,
        credentials: Arc<dyn pixgate_store::CredentialRepository>,
        provider: Arc<dyn ImageProvider>,
        blobs: Arc<dyn BlobStore>,
        webhooks: WebhookSender,
        registry: EndpointRegistry,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            coord,
            jobs,
            tenants,
            credentials,
            provider,
            blobs,
            webhooks,
            registry,
            config,
        }
    }

    /// Run one claimed job. Admission counters acquired along the way are
    /// released in reverse order on every path out.
    pub async fn execute(&self, claimed: Job) -> Result<ExecOutcome, WorkerError> {
        // The row is the source of truth; a cancel may have landed since
        // the claim.
        let Some(job) = self.jobs.get_any(&claimed.id).await? else {
            return Ok(ExecOutcome::Skipped);
        };
        if job.status.is_terminal() || job.status == JobStatus::Running {
            debug!(job_id = %job.id, status = %job.status, "skipping settled job");
            return Ok(ExecOutcome::Skipped);
        }

        let Some(tenant) = self.tenants.get(job.tenant_id).await? else {
            warn!(job_id = %job.id, tenant_id = %job.tenant_id, "job without tenant");
            self.jobs
                .mark_failed(&job.id, job.attempts + 1, ErrorCode::UnknownError, "tenant missing")
                .await?;
            return Ok(ExecOutcome::Failed {
                code: ErrorCode::UnknownError,
            });
        };

        let mut held_tokens: Vec<String> = Vec::new();
        let run = self.run_pipeline(&job, &tenant, &mut held_tokens).await;

        // Reverse-order release on every exit path, including errors.
        for key in held_tokens.iter().rev() {
            if let Err(e) = self.coord.conc_release(key).await {
                error!(job_id = %job.id, key, error = %e, "failed to release concurrency token");
            }
        }

        match run? {
            Run::Completed(outcome) => Ok(outcome),
            Run::Denied { code, message } => self.settle_failure(&job, &tenant, code, message).await,
        }
    }

    async fn run_pipeline(
        &self,
        job: &Job,
        tenant: &Tenant,
        held_tokens: &mut Vec<String>,
    ) -> Result<Run, WorkerError> {
        // Global window first: cheapest deny, protects everything below.
        let global = self
            .coord
            .rpm_admit(keys::GLOBAL_RPM, self.config.global_rpm, self.config.rpm_window_ms)
            .await?;
        if !global.admitted {
            return Ok(denied(ErrorCode::GlobalRateLimit, "global request budget exhausted"));
        }

        let global_conc = self
            .coord
            .conc_acquire(keys::GLOBAL_CONC, self.config.global_concurrency)
            .await?;
        if !global_conc.admitted {
            return Ok(denied(ErrorCode::GlobalConcLimit, "global concurrency exhausted"));
        }
        held_tokens.push(keys::GLOBAL_CONC.to_string());

        let picked = pick_credential(
            self.coord.as_ref(),
            self.credentials.as_ref(),
            &self.registry,
            &PickRequest {
                provider: &self.config.provider,
                model: &self.config.model,
                preferred_endpoint: None,
                exclude_endpoints: &[],
                allow_fallback: self.config.endpoint_fallback,
            },
        )
        .await?;
        let Some(credential) = picked else {
            return Ok(denied(
                ErrorCode::NoProviderKeyAvailable,
                "every credential is cooling down or saturated",
            ));
        };

        let key_rpm = self
            .coord
            .rpm_admit(
                &keys::credential_rpm(credential.id),
                credential.rpm_limit,
                self.config.rpm_window_ms,
            )
            .await?;
        if !key_rpm.admitted {
            return Ok(denied(ErrorCode::KeyRateLimit, "credential request budget exhausted"));
        }

        let inflight_key = keys::credential_inflight(credential.id);
        let key_conc = self
            .coord
            .conc_acquire(&inflight_key, credential.concurrency_limit)
            .await?;
        if !key_conc.admitted {
            return Ok(denied(ErrorCode::KeyConcLimit, "credential concurrency exhausted"));
        }
        held_tokens.push(inflight_key);

        let tenant_rpm = self
            .coord
            .rpm_admit(
                &keys::tenant_rpm(tenant.id),
                tenant.plan_rpm,
                self.config.rpm_window_ms,
            )
            .await?;
        if !tenant_rpm.admitted {
            return Ok(denied(ErrorCode::TenantRateLimit, "tenant request budget exhausted"));
        }

        let tenant_conc_key = keys::tenant_conc(tenant.id);
        let tenant_conc = self
            .coord
            .conc_acquire(&tenant_conc_key, tenant.plan_concurrency)
            .await?;
        if !tenant_conc.admitted {
            return Ok(denied(ErrorCode::TenantConcLimit, "tenant concurrency exhausted"));
        }
        held_tokens.push(tenant_conc_key);

        // Admission done; this worker owns the job now.
        if !self.jobs.transition_running(&job.id, credential.id).await? {
            debug!(job_id = %job.id, "lost the RUNNING race (canceled underneath)");
            return Ok(Run::Completed(ExecOutcome::Skipped));
        }

        // Tokens were deliberately acquired before the cache check; a cache
        // stampede still sees backpressure.
        let fingerprint = cache_eligible(&job.params)
            .then(|| fingerprint_params(&job.params, &self.config.model));
        if let Some(fingerprint) = &fingerprint {
            if let Some(entry) = self.coord.cache_get(fingerprint).await? {
                info!(job_id = %job.id, "result cache hit");
                for url in &entry.urls {
                    self.jobs.append_result_url(&job.id, url).await?;
                }
                if !self.jobs.mark_succeeded(&job.id).await? {
                    return Ok(Run::Completed(ExecOutcome::Discarded));
                }
                self.coord.health_record_success(credential.id).await?;
                self.notify_success(&job.id, tenant).await?;
                return Ok(Run::Completed(ExecOutcome::Succeeded { cached: true }));
            }
        }

        let request = GenerateRequest {
            credential: credential.clone(),
            prompt: job.params.prompt.clone(),
            reference_image: job.params.input_image.clone(),
            mode: job.params.mode,
            resolution: job.params.resolution,
            aspect_ratio: job.params.aspect_ratio,
            sample_count: job.params.sample_count,
            model: self.config.model.clone(),
        };

        let outcome = match self.provider.generate(&request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.code.is_provider_failure() {
                    self.coord.health_record_failure(credential.id).await?;
                    let endpoint_outcome = if e.code == ErrorCode::ServiceOverload {
                        EndpointOutcome::Overload
                    } else {
                        EndpointOutcome::Failure
                    };
                    self.coord
                        .endpoint_record(&credential.provider, credential.endpoint, endpoint_outcome)
                        .await?;
                }
                return Ok(Run::Denied {
                    code: e.code,
                    message: e.message,
                });
            }
        };

        // Uploads run in parallel; each appends its URL as it lands so
        // pollers see results progressively.
        let uploads = outcome.images.iter().enumerate().map(|(index, image)| {
            let blobs = Arc::clone(&self.blobs);
            let jobs = Arc::clone(&self.jobs);
            let job_id = job.id.clone();
            let data_uri = image.url.clone();
            async move {
                let (mime, payload) = split_data_uri(&data_uri)
                    .ok_or_else(|| "provider emitted a malformed data URI".to_string())?;
                let bytes = base64::engine::general_purpose::STANDARD
                    .decode(payload)
                    .map_err(|e| format!("image {index} is not valid base64: {e}"))?;
                let key = format!("jobs/{job_id}/{index}.{}", extension_for(&mime));
                let url = blobs
                    .put(&key, Bytes::from(bytes), &mime)
                    .await
                    .map_err(|e| e.to_string())?;
                // CAS-guarded; a false here means the row settled elsewhere.
                let _ = jobs.append_result_url(&job_id, &url).await;
                Ok::<String, String>(url)
            }
        });

        let mut urls = Vec::with_capacity(outcome.images.len());
        for result in futures::future::join_all(uploads).await {
            match result {
                Ok(url) => urls.push(url),
                Err(message) => {
                    return Ok(Run::Denied {
                        code: ErrorCode::StorageError,
                        message,
                    })
                }
            }
        }

        if !self.jobs.mark_succeeded(&job.id).await? {
            // Canceled mid-flight; the produced result is discarded.
            return Ok(Run::Completed(ExecOutcome::Discarded));
        }

        if let Some(fingerprint) = &fingerprint {
            if !urls.is_empty() {
                self.coord
                    .cache_put(
                        fingerprint,
                        &CachedGeneration::new(urls.clone(), outcome.model_used.clone()),
                    )
                    .await?;
            }
        }

        self.coord.health_record_success(credential.id).await?;
        self.coord
            .endpoint_record(
                &credential.provider,
                outcome.endpoint_used,
                EndpointOutcome::Success,
            )
            .await?;

        info!(
            job_id = %job.id,
            images = urls.len(),
            endpoint = %outcome.endpoint_used,
            "job succeeded"
        );
        self.notify_success(&job.id, tenant).await?;
        Ok(Run::Completed(ExecOutcome::Succeeded { cached: false }))
    }

    async fn settle_failure(
        &self,
        job: &Job,
        tenant: &Tenant,
        code: ErrorCode,
        message: String,
    ) -> Result<ExecOutcome, WorkerError> {
        let attempts = job.attempts + 1;

        if code.is_retryable() && attempts < job.max_attempts {
            let delay = self.config.retry_policy.delay_for_attempt(attempts, code);
            let next_run_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            if self
                .jobs
                .mark_retrying(&job.id, attempts, code, &message, next_run_at)
                .await?
            {
                debug!(
                    job_id = %job.id,
                    attempts,
                    code = %code,
                    backoff_ms = delay.as_millis() as u64,
                    "job will retry"
                );
                return Ok(ExecOutcome::Retrying { code });
            }
            return Ok(ExecOutcome::Skipped);
        }

        if self
            .jobs
            .mark_failed(&job.id, attempts, code, &message)
            .await?
        {
            warn!(job_id = %job.id, attempts, code = %code, "job failed terminally");
            self.webhooks
                .enqueue(tenant, WebhookEvent::failed(job, code, message));
            return Ok(ExecOutcome::Failed { code });
        }
        Ok(ExecOutcome::Skipped)
    }

    async fn notify_success(
        &self,
        job_id: &pixgate_core::JobId,
        tenant: &Tenant,
    ) -> Result<(), WorkerError> {
        if let Some(final_row) = self.jobs.get_any(job_id).await? {
            self.webhooks
                .enqueue(tenant, WebhookEvent::succeeded(&final_row));
        }
        Ok(())
    }
}

fn denied(code: ErrorCode, message: &str) -> Run {
    Run::Denied {
        code,
        message: message.to_string(),
    }
}

fn extension_for(mime: &str) -> &'static str {
    match mime {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        _ => "bin",
    }
}
