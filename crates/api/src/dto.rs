//! Request/response DTOs and mapping to/from domain types.

use serde::{Deserialize, Serialize};

use pixgate_core::{Job, JobStatus};

/// `POST /v1/images/generate` body.
///
/// `mode`, `resolution`, and `aspectRatio` arrive as strings and are parsed
/// against the declared enums so a bad value turns into a 400
/// `INVALID_REQUEST` rather than a framework rejection. `mode` defaults to
/// `final`; `resolution` is the `1K|2K|4K` tier contract.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequestBody {
    pub prompt: String,
    pub input_image: Option<String>,
    pub mode: Option<String>,
    pub resolution: Option<String>,
    pub aspect_ratio: Option<String>,
    pub sample_count: Option<u32>,
}

/// `202` response for a submitted job.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobAccepted {
    pub job_id: String,
    pub status: JobStatus,
}

/// Error detail on a failed job.
#[derive(Debug, Serialize)]
pub struct JobErrorBody {
    pub code: String,
    pub message: String,
}

/// Full job view for polling.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub result_urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobErrorBody>,
    pub created_at: String,
    pub updated_at: String,
}

impl JobResponse {
    pub fn from_job(job: &Job) -> Self {
        let error = match (&job.error_code, &job.error_message) {
            (Some(code), message) if job.status == JobStatus::Failed => Some(JobErrorBody {
                code: code.as_str().to_string(),
                message: message.clone().unwrap_or_default(),
            }),
            _ => None,
        };
        Self {
            job_id: job.id.to_string(),
            status: job.status,
            result_urls: job.result_urls.clone(),
            error,
            created_at: job.created_at.to_rfc3339(),
            updated_at: job.updated_at.to_rfc3339(),
        }
    }
}

/// `GET /v1/jobs` page.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobListResponse {
    pub items: Vec<JobResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// `GET /v1/jobs` query params.
#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub cursor: Option<String>,
}
