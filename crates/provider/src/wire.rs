//! Gemini wire format: request construction and response parsing.
//!
//! Kept free of HTTP so the serialization rules are testable in isolation.
//! Response parsing accepts both the camel-case and snake-case spellings of
//! the inline-data fields; the upstream emits either depending on revision.

use serde::{Deserialize, Serialize};

use pixgate_core::{ErrorCode, JobMode};

use crate::{GenerateRequest, InlineImage, ProviderError};

pub const DRAFT_TEMPERATURE: f32 = 0.7;
pub const FINAL_TEMPERATURE: f32 = 1.0;

#[derive(Debug, Serialize)]
pub struct GenerateBody {
    pub contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    pub generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
pub struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Part {
    Text {
        text: String,
    },
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

#[derive(Debug, Serialize)]
pub struct InlineData {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Serialize)]
pub struct GenerationConfig {
    pub temperature: f32,
    #[serde(rename = "responseModalities")]
    pub response_modalities: Vec<&'static str>,
    #[serde(rename = "imageConfig", skip_serializing_if = "Option::is_none")]
    pub image_config: Option<ImageConfig>,
}

#[derive(Debug, Serialize)]
pub struct ImageConfig {
    #[serde(rename = "imageSize", skip_serializing_if = "Option::is_none")]
    pub image_size: Option<String>,
    #[serde(rename = "aspectRatio", skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<String>,
    #[serde(rename = "numberOfImages", skip_serializing_if = "Option::is_none")]
    pub number_of_images: Option<u32>,
}

/// Build the request body for one generation.
pub fn build_body(request: &GenerateRequest) -> GenerateBody {
    let mut parts = vec![Part::Text {
        text: request.prompt.clone(),
    }];

    if let Some(image) = &request.reference_image {
        if let Some((mime, data)) = pixgate_core::request::split_data_uri(image) {
            parts.push(Part::Inline {
                inline_data: InlineData {
                    mime_type: mime,
                    data,
                },
            });
        }
    }

    let temperature = match request.mode {
        JobMode::Draft => DRAFT_TEMPERATURE,
        JobMode::Final => FINAL_TEMPERATURE,
    };

    // Image config fields only when the caller provided them.
    let image_config = if request.resolution.is_some()
        || request.aspect_ratio.is_some()
        || request.sample_count.is_some()
    {
        Some(ImageConfig {
            image_size: request.resolution.map(|r| r.as_str().to_string()),
            aspect_ratio: request.aspect_ratio.map(|a| a.as_str().to_string()),
            number_of_images: request.sample_count,
        })
    } else {
        None
    };

    GenerateBody {
        contents: vec![Content {
            role: "user".to_string(),
            parts,
        }],
        generation_config: GenerationConfig {
            temperature,
            response_modalities: vec!["TEXT", "IMAGE"],
            image_config,
        },
    }
}

#[derive(Debug, Deserialize)]
pub struct GenerateResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    pub error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
pub struct Candidate {
    pub content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
pub struct CandidateContent {
    #[serde(default)]
    pub parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
pub struct ResponsePart {
    #[serde(rename = "inlineData", alias = "inline_data", default)]
    pub inline_data: Option<ResponseInline>,
}

#[derive(Debug, Deserialize)]
pub struct ResponseInline {
    #[serde(rename = "mimeType", alias = "mime_type")]
    pub mime_type: String,
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct ApiError {
    pub code: Option<i64>,
    pub message: String,
    pub status: Option<String>,
}

/// Extract inline images from a 2xx response body.
pub fn parse_images(response: GenerateResponse) -> Result<Vec<InlineImage>, ProviderError> {
    if let Some(error) = response.error {
        return Err(ProviderError::new(ErrorCode::GeminiError, error.message));
    }

    let mut images = Vec::new();
    for candidate in response.candidates {
        let Some(content) = candidate.content else {
            continue;
        };
        for part in content.parts {
            if let Some(inline) = part.inline_data {
                images.push(InlineImage {
                    url: format!("data:{};base64,{}", inline.mime_type, inline.data),
                    mime: inline.mime_type,
                });
            }
        }
    }

    if images.is_empty() {
        return Err(ProviderError::new(
            ErrorCode::NoImages,
            "provider returned no image parts",
        ));
    }
    Ok(images)
}

/// Map an HTTP status to the taxonomy.
pub fn classify_status(status: u16) -> ErrorCode {
    match status {
        400 => ErrorCode::InvalidRequest,
        401 => ErrorCode::InvalidApiKey,
        429 => ErrorCode::RateLimitExceeded,
        503 => ErrorCode::ServiceOverload,
        s if s >= 500 => ErrorCode::ServerError,
        _ => ErrorCode::GeminiError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pixgate_core::{
        AspectRatio, Credential, CredentialId, EndpointTag, Resolution,
    };

    fn request(mode: JobMode) -> GenerateRequest {
        GenerateRequest {
            credential: Credential {
                id: CredentialId::new(),
                provider: "gemini".to_string(),
                endpoint: EndpointTag::Primary,
                secret: "sk".to_string(),
                rpm_limit: 60,
                concurrency_limit: 4,
                priority: 0,
                enabled: true,
            },
            prompt: "a red apple".to_string(),
            reference_image: None,
            mode,
            resolution: None,
            aspect_ratio: None,
            sample_count: None,
            model: "gemini-2.5-flash-image".to_string(),
        }
    }

    #[test]
    fn draft_and_final_temperatures() {
        assert_eq!(build_body(&request(JobMode::Draft)).generation_config.temperature, 0.7);
        assert_eq!(build_body(&request(JobMode::Final)).generation_config.temperature, 1.0);
    }

    #[test]
    fn image_config_is_omitted_without_caller_fields() {
        let body = build_body(&request(JobMode::Final));
        assert!(body.generation_config.image_config.is_none());

        let raw = serde_json::to_value(&body).unwrap();
        assert!(raw["generationConfig"].get("imageConfig").is_none());
        assert_eq!(
            raw["generationConfig"]["responseModalities"],
            serde_json::json!(["TEXT", "IMAGE"])
        );
    }

    #[test]
    fn image_config_carries_only_provided_fields() {
        let mut req = request(JobMode::Final);
        req.resolution = Some(Resolution::TwoK);
        req.sample_count = Some(3);
        let raw = serde_json::to_value(build_body(&req)).unwrap();
        let config = &raw["generationConfig"]["imageConfig"];
        assert_eq!(config["imageSize"], "2K");
        assert_eq!(config["numberOfImages"], 3);
        assert!(config.get("aspectRatio").is_none());
    }

    #[test]
    fn aspect_ratio_uses_wire_spelling() {
        let mut req = request(JobMode::Final);
        req.aspect_ratio = Some(AspectRatio::Wide);
        let raw = serde_json::to_value(build_body(&req)).unwrap();
        assert_eq!(raw["generationConfig"]["imageConfig"]["aspectRatio"], "16:9");
    }

    #[test]
    fn reference_image_becomes_an_inline_part() {
        let mut req = request(JobMode::Final);
        req.reference_image = Some("data:image/png;base64,aGk=".to_string());
        let raw = serde_json::to_value(build_body(&req)).unwrap();
        let parts = raw["contents"][0]["parts"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1]["inlineData"]["mimeType"], "image/png");
        assert_eq!(parts[1]["inlineData"]["data"], "aGk=");
    }

    #[test]
    fn parses_camel_case_inline_data() {
        let response: GenerateResponse = serde_json::from_value(serde_json::json!({
            "candidates": [{
                "content": {"parts": [
                    {"text": "here you go"},
                    {"inlineData": {"mimeType": "image/png", "data": "QUJD"}}
                ]}
            }]
        }))
        .unwrap();
        let images = parse_images(response).unwrap();
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].url, "data:image/png;base64,QUJD");
        assert_eq!(images[0].mime, "image/png");
    }

    #[test]
    fn parses_snake_case_inline_data_identically() {
        let response: GenerateResponse = serde_json::from_value(serde_json::json!({
            "candidates": [{
                "content": {"parts": [
                    {"inline_data": {"mime_type": "image/png", "data": "QUJD"}}
                ]}
            }]
        }))
        .unwrap();
        let images = parse_images(response).unwrap();
        assert_eq!(images[0].url, "data:image/png;base64,QUJD");
    }

    #[test]
    fn zero_images_is_a_no_images_failure() {
        let response: GenerateResponse = serde_json::from_value(serde_json::json!({
            "candidates": [{"content": {"parts": [{"text": "sorry"}]}}]
        }))
        .unwrap();
        let err = parse_images(response).unwrap_err();
        assert_eq!(err.code, ErrorCode::NoImages);
    }

    #[test]
    fn top_level_error_object_wins() {
        let response: GenerateResponse = serde_json::from_value(serde_json::json!({
            "error": {"code": 403, "message": "blocked", "status": "PERMISSION_DENIED"}
        }))
        .unwrap();
        let err = parse_images(response).unwrap_err();
        assert_eq!(err.code, ErrorCode::GeminiError);
        assert_eq!(err.message, "blocked");
    }

    #[test]
    fn status_classification_table() {
        assert_eq!(classify_status(400), ErrorCode::InvalidRequest);
        assert_eq!(classify_status(401), ErrorCode::InvalidApiKey);
        assert_eq!(classify_status(429), ErrorCode::RateLimitExceeded);
        assert_eq!(classify_status(503), ErrorCode::ServiceOverload);
        assert_eq!(classify_status(500), ErrorCode::ServerError);
        assert_eq!(classify_status(502), ErrorCode::ServerError);
        assert_eq!(classify_status(404), ErrorCode::GeminiError);
        assert_eq!(classify_status(418), ErrorCode::GeminiError);
    }
}
