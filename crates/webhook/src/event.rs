//! Webhook event payloads.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use pixgate_core::{ErrorCode, EventId, Job, JobStatus};

/// Error detail carried on `FAILED` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookEventError {
    pub code: ErrorCode,
    pub message: String,
}

/// One terminal-transition notification.
///
/// `event_id` is fresh per enqueue, so a redelivered event keeps its id and
/// receivers can dedupe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub event_id: EventId,
    pub job_id: String,
    pub tenant_id: String,
    /// `SUCCEEDED` or `FAILED`.
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_urls: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WebhookEventError>,
    /// Milliseconds since epoch at enqueue time.
    pub timestamp: i64,
}

impl WebhookEvent {
    pub fn succeeded(job: &Job) -> Self {
        Self {
            event_id: EventId::new(),
            job_id: job.id.to_string(),
            tenant_id: job.tenant_id.to_string(),
            status: JobStatus::Succeeded,
            result_urls: Some(job.result_urls.clone()),
            error: None,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn failed(job: &Job, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            event_id: EventId::new(),
            job_id: job.id.to_string(),
            tenant_id: job.tenant_id.to_string(),
            status: JobStatus::Failed,
            result_urls: None,
            error: Some(WebhookEventError {
                code,
                message: message.into(),
            }),
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}
