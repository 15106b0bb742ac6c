//! Routing tree and handlers for the intake API.

use std::str::FromStr;
use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;

use pixgate_core::{
    AspectRatio, GenerateParams, JobId, JobMode, JobStatus, NewJob, Resolution,
};
use pixgate_store::{CancelOutcome, JobCursor, JobFilter};

use crate::context::TenantContext;
use crate::dto::{
    GenerateRequestBody, JobAccepted, JobListResponse, JobResponse, ListJobsQuery,
};
use crate::errors::{json_error, store_error_to_response};
use crate::middleware::AuthState;
use crate::services::AppServices;

const DEFAULT_LIST_LIMIT: usize = 20;
const MAX_LIST_LIMIT: usize = 100;

/// Build the full router: open health endpoint plus the authenticated
/// tenant surface.
pub fn build_router(services: Arc<AppServices>, auth: AuthState) -> Router {
    let protected = Router::new()
        .route("/v1/images/generate", axum::routing::post(generate_image))
        .route("/v1/jobs", get(list_jobs))
        .route(
            "/v1/jobs/:job_id",
            get(get_job).delete(cancel_job),
        )
        .layer(Extension(services))
        .layer(axum::middleware::from_fn_with_state(
            auth,
            crate::middleware::auth_middleware,
        ));

    Router::new().route("/health", get(health)).merge(protected)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "timestamp": Utc::now().timestamp_millis(),
    }))
}

async fn generate_image(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    headers: HeaderMap,
    Json(body): Json<GenerateRequestBody>,
) -> axum::response::Response {
    let mode = match body.mode.as_deref() {
        None => JobMode::Final,
        Some(raw) => match JobMode::from_str(raw) {
            Ok(mode) => mode,
            Err(e) => return invalid_request(e.to_string()),
        },
    };
    let resolution = match body.resolution.as_deref().map(Resolution::from_str) {
        None => None,
        Some(Ok(resolution)) => Some(resolution),
        Some(Err(e)) => return invalid_request(e.to_string()),
    };
    let aspect_ratio = match body.aspect_ratio.as_deref().map(AspectRatio::from_str) {
        None => None,
        Some(Ok(aspect_ratio)) => Some(aspect_ratio),
        Some(Err(e)) => return invalid_request(e.to_string()),
    };

    let params = GenerateParams {
        prompt: body.prompt,
        mode,
        input_image: body.input_image,
        resolution,
        aspect_ratio,
        sample_count: body.sample_count,
    };
    if let Err(e) = params.validate() {
        return invalid_request(e.to_string());
    }

    let idempotency_key = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string);

    let job = match services
        .jobs
        .create(NewJob {
            tenant_id: tenant.tenant_id(),
            idempotency_key,
            params,
            max_attempts: services.max_attempts,
        })
        .await
    {
        Ok(job) => job,
        Err(e) => return store_error_to_response(e),
    };

    tracing::info!(job_id = %job.id, tenant_id = %job.tenant_id, "job accepted");
    (
        StatusCode::ACCEPTED,
        Json(JobAccepted {
            job_id: job.id.to_string(),
            status: job.status,
        }),
    )
        .into_response()
}

async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id = JobId::from(job_id);
    match services.jobs.get(tenant.tenant_id(), &job_id).await {
        Ok(Some(job)) => (StatusCode::OK, Json(JobResponse::from_job(&job))).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "NOT_FOUND", "job not found"),
        Err(e) => store_error_to_response(e),
    }
}

async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Query(query): Query<ListJobsQuery>,
) -> axum::response::Response {
    let status = match query.status.as_deref().map(JobStatus::from_str) {
        None => None,
        Some(Ok(status)) => Some(status),
        Some(Err(e)) => return invalid_request(e.to_string()),
    };
    let cursor = match query.cursor.as_deref().map(JobCursor::decode) {
        None => None,
        Some(Ok(cursor)) => Some(cursor),
        Some(Err(_)) => return invalid_request("invalid cursor"),
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);

    match services
        .jobs
        .list(
            tenant.tenant_id(),
            JobFilter {
                status,
                limit,
                cursor,
            },
        )
        .await
    {
        Ok(page) => (
            StatusCode::OK,
            Json(JobListResponse {
                items: page.items.iter().map(JobResponse::from_job).collect(),
                next_cursor: page.next_cursor,
                has_more: page.has_more,
            }),
        )
            .into_response(),
        Err(e) => store_error_to_response(e),
    }
}

async fn cancel_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id = JobId::from(job_id);
    match services.jobs.cancel(tenant.tenant_id(), &job_id).await {
        Ok(CancelOutcome::Canceled) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "jobId": job_id.to_string(),
                "status": JobStatus::Canceled,
            })),
        )
            .into_response(),
        Ok(CancelOutcome::NotFound) => {
            json_error(StatusCode::NOT_FOUND, "NOT_FOUND", "job not found")
        }
        Ok(CancelOutcome::IllegalState(status)) => json_error(
            StatusCode::BAD_REQUEST,
            "INVALID_STATE",
            format!("job is {status} and can no longer be canceled"),
        ),
        Err(e) => store_error_to_response(e),
    }
}

fn invalid_request(message: impl Into<String>) -> axum::response::Response {
    json_error(StatusCode::BAD_REQUEST, "INVALID_REQUEST", message)
}
