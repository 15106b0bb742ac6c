//! The Gemini driver: HTTP POST, status classification, endpoint fallback.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, warn};

use pixgate_core::ErrorCode;

use crate::endpoint::{AuthStyle, EndpointRegistry};
use crate::wire::{build_body, classify_status, parse_images, GenerateResponse};
use crate::{GenerateOutcome, GenerateRequest, ImageProvider, ProviderError};

/// Driver over the Gemini generateContent surface.
pub struct GeminiDriver {
    http: Client,
    registry: EndpointRegistry,
    fallback_enabled: bool,
    request_timeout: Duration,
}

impl GeminiDriver {
    pub fn new(registry: EndpointRegistry, fallback_enabled: bool) -> Self {
        Self {
            http: Client::new(),
            registry,
            fallback_enabled,
            request_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    async fn attempt(
        &self,
        endpoint: pixgate_core::EndpointTag,
        request: &GenerateRequest,
    ) -> Result<GenerateOutcome, ProviderError> {
        let descriptor = self.registry.descriptor(endpoint).ok_or_else(|| {
            ProviderError::new(
                ErrorCode::UnknownError,
                format!("endpoint {endpoint} is not configured"),
            )
        })?;

        let url = descriptor.generate_url(&request.model, &request.credential.secret);
        let body = build_body(request);

        let mut builder = self
            .http
            .post(&url)
            .timeout(self.request_timeout)
            .json(&body);
        if descriptor.auth == AuthStyle::Bearer {
            builder = builder.bearer_auth(&request.credential.secret);
        }

        let response = builder.send().await.map_err(|e| {
            // reqwest errors redact the URL's query (where the key lives)
            // is not guaranteed; keep the message to the error kind.
            ProviderError::new(
                ErrorCode::UnknownError,
                format!("request to {endpoint} failed: {}", e.without_url()),
            )
        })?;

        let status = response.status();
        if !status.is_success() {
            let code = classify_status(status.as_u16());
            let detail = response.text().await.unwrap_or_default();
            let message = extract_error_message(&detail)
                .unwrap_or_else(|| format!("{endpoint} returned {status}"));
            return Err(ProviderError::new(code, message));
        }

        let parsed: GenerateResponse = response.json().await.map_err(|e| {
            ProviderError::new(
                ErrorCode::GeminiError,
                format!("malformed provider response: {e}"),
            )
        })?;

        let images = parse_images(parsed)?;
        debug!(
            endpoint = %endpoint,
            model = %request.model,
            images = images.len(),
            "generation succeeded"
        );
        Ok(GenerateOutcome {
            images,
            model_used: request.model.clone(),
            endpoint_used: endpoint,
        })
    }
}

#[async_trait]
impl ImageProvider for GeminiDriver {
    async fn generate(
        &self,
        request: &GenerateRequest,
    ) -> Result<GenerateOutcome, ProviderError> {
        let primary = request.credential.endpoint;
        let first = self.attempt(primary, request).await;

        let Err(original) = first else {
            return first;
        };

        // 503 gets one shot through each other configured endpoint; the
        // first success wins, otherwise the original overload surfaces.
        if original.code == ErrorCode::ServiceOverload && self.fallback_enabled {
            for tag in self.registry.fallback_order() {
                if *tag == primary {
                    continue;
                }
                warn!(from = %primary, to = %tag, "endpoint overloaded, trying fallback");
                match self.attempt(*tag, request).await {
                    Ok(outcome) => return Ok(outcome),
                    Err(e) => {
                        debug!(endpoint = %tag, error = %e, "fallback endpoint failed");
                    }
                }
            }
        }

        Err(original)
    }
}

/// Pull `error.message` out of a non-2xx body when it is the standard shape.
fn extract_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("error")?
        .get("message")?
        .as_str()
        .map(str::to_string)
}
