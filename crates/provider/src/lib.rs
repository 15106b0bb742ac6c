//! Provider drivers: the upstream generative API behind one contract.
//!
//! The driver builds the wire request, resolves URL and auth from the
//! endpoint registry, classifies HTTP failures into the gateway's error
//! taxonomy, and falls back across endpoints on overload. Credential
//! *selection* is not its business; it uses the credential it is given.

pub mod endpoint;
pub mod fake;
pub mod gemini;
pub mod wire;

use async_trait::async_trait;

use pixgate_core::{AspectRatio, Credential, EndpointTag, ErrorCode, JobMode, Resolution};

pub use endpoint::{AuthStyle, EndpointDescriptor, EndpointRegistry};
pub use fake::FakeProvider;
pub use gemini::GeminiDriver;

/// Model requested when the caller has no preference.
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-image";

/// A provider-call failure, classified into the taxonomy.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ProviderError {
    pub code: ErrorCode,
    pub message: String,
}

impl ProviderError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// One generation request against a concrete credential.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub credential: Credential,
    pub prompt: String,
    /// `data:image/...;base64,...` reference image.
    pub reference_image: Option<String>,
    pub mode: JobMode,
    pub resolution: Option<Resolution>,
    pub aspect_ratio: Option<AspectRatio>,
    pub sample_count: Option<u32>,
    pub model: String,
}

/// An inline image produced by the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineImage {
    /// `data:<mime>;base64,<data>`.
    pub url: String,
    pub mime: String,
}

/// Result of a successful generation.
#[derive(Debug, Clone)]
pub struct GenerateOutcome {
    pub images: Vec<InlineImage>,
    pub model_used: String,
    pub endpoint_used: EndpointTag,
}

/// The upstream generative API contract.
#[async_trait]
pub trait ImageProvider: Send + Sync {
    async fn generate(&self, request: &GenerateRequest)
        -> Result<GenerateOutcome, ProviderError>;
}
