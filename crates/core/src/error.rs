//! Error model: the gateway-wide error-code taxonomy and domain errors.
//!
//! `ErrorCode` is the deterministic vocabulary shared by persisted job rows,
//! API responses, and webhook payloads. Each code knows whether the failure
//! it describes is worth retrying; the executor combines that with the
//! attempt budget to decide between `RETRYING` and `FAILED`.

use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic failure codes for jobs and webhook events.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum ErrorCode {
    /// Provider rejected the inputs (4xx semantics).
    InvalidRequest,
    /// Credential rejected by the provider.
    InvalidApiKey,
    /// Provider returned 429.
    RateLimitExceeded,
    /// Provider returned 503; eligible for endpoint fallback.
    ServiceOverload,
    /// Provider returned another 5xx.
    ServerError,
    /// Provider returned an unclassified non-2xx.
    GeminiError,
    /// Global sliding-window admission denied.
    GlobalRateLimit,
    /// Global concurrency admission denied.
    GlobalConcLimit,
    /// Credential sliding-window admission denied.
    KeyRateLimit,
    /// Credential concurrency admission denied.
    KeyConcLimit,
    /// Tenant sliding-window admission denied.
    TenantRateLimit,
    /// Tenant concurrency admission denied.
    TenantConcLimit,
    /// Every credential is cooling down or saturated.
    NoProviderKeyAvailable,
    /// Provider answered 2xx but carried no image parts.
    NoImages,
    /// Blob store write failed.
    StorageError,
    /// Anything unclassified.
    UnknownError,
}

impl ErrorCode {
    /// The persisted / wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::InvalidApiKey => "INVALID_API_KEY",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::ServiceOverload => "SERVICE_OVERLOAD",
            Self::ServerError => "SERVER_ERROR",
            Self::GeminiError => "GEMINI_ERROR",
            Self::GlobalRateLimit => "GLOBAL_RATE_LIMIT",
            Self::GlobalConcLimit => "GLOBAL_CONC_LIMIT",
            Self::KeyRateLimit => "KEY_RATE_LIMIT",
            Self::KeyConcLimit => "KEY_CONC_LIMIT",
            Self::TenantRateLimit => "TENANT_RATE_LIMIT",
            Self::TenantConcLimit => "TENANT_CONC_LIMIT",
            Self::NoProviderKeyAvailable => "NO_PROVIDER_KEY_AVAILABLE",
            Self::NoImages => "NO_IMAGES",
            Self::StorageError => "STORAGE_ERROR",
            Self::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// Whether a job failing with this code may be re-attempted.
    ///
    /// Retry still requires `attempts < max_attempts`; that gate lives in
    /// the executor.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::InvalidRequest | Self::InvalidApiKey | Self::NoImages => false,
            Self::RateLimitExceeded
            | Self::ServiceOverload
            | Self::ServerError
            | Self::GeminiError
            | Self::GlobalRateLimit
            | Self::GlobalConcLimit
            | Self::KeyRateLimit
            | Self::KeyConcLimit
            | Self::TenantRateLimit
            | Self::TenantConcLimit
            | Self::NoProviderKeyAvailable
            | Self::StorageError
            | Self::UnknownError => true,
        }
    }

    /// Whether this code came out of a provider call (as opposed to
    /// admission control). Provider-originated failures count against the
    /// credential's health.
    pub fn is_provider_failure(&self) -> bool {
        matches!(
            self,
            Self::InvalidApiKey
                | Self::RateLimitExceeded
                | Self::ServiceOverload
                | Self::ServerError
                | Self::GeminiError
        )
    }
}

impl core::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = match s {
            "INVALID_REQUEST" => Self::InvalidRequest,
            "INVALID_API_KEY" => Self::InvalidApiKey,
            "RATE_LIMIT_EXCEEDED" => Self::RateLimitExceeded,
            "SERVICE_OVERLOAD" => Self::ServiceOverload,
            "SERVER_ERROR" => Self::ServerError,
            "GEMINI_ERROR" => Self::GeminiError,
            "GLOBAL_RATE_LIMIT" => Self::GlobalRateLimit,
            "GLOBAL_CONC_LIMIT" => Self::GlobalConcLimit,
            "KEY_RATE_LIMIT" => Self::KeyRateLimit,
            "KEY_CONC_LIMIT" => Self::KeyConcLimit,
            "TENANT_RATE_LIMIT" => Self::TenantRateLimit,
            "TENANT_CONC_LIMIT" => Self::TenantConcLimit,
            "NO_PROVIDER_KEY_AVAILABLE" => Self::NoProviderKeyAvailable,
            "NO_IMAGES" => Self::NoImages,
            "STORAGE_ERROR" => Self::StorageError,
            "UNKNOWN_ERROR" => Self::UnknownError,
            other => {
                return Err(DomainError::validation(format!(
                    "unknown error code: {other}"
                )))
            }
        };
        Ok(code)
    }
}

impl From<ErrorCode> for String {
    fn from(value: ErrorCode) -> Self {
        value.as_str().to_string()
    }
}

impl TryFrom<String> for ErrorCode {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Domain-level error (business logic failures).
///
/// Keep this focused on deterministic failures (validation, invariants,
/// illegal state transitions). Infrastructure concerns (Redis, Postgres,
/// HTTP) live in each infrastructure crate's own error type.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A status transition the state machine forbids.
    #[error("illegal transition: {0}")]
    IllegalTransition(String),

    /// A requested resource was not found (domain-level).
    #[error("not found")]
    NotFound,
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn illegal_transition(msg: impl Into<String>) -> Self {
        Self::IllegalTransition(msg.into())
    }
}
