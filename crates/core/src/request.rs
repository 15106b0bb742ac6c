//! Generation request parameters and validation.
//!
//! The API layer deserializes tenant input into [`GenerateParams`] and calls
//! [`GenerateParams::validate`] before a job row is created; the worker can
//! then trust every row it claims.

use core::str::FromStr;
use std::sync::OnceLock;

use base64::Engine as _;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::job::JobMode;

/// Maximum decoded size of an inline reference image.
pub const MAX_INPUT_IMAGE_BYTES: usize = 4 * 1024 * 1024;

/// Valid sample-count range, inclusive.
pub const SAMPLE_COUNT_RANGE: (u32, u32) = (1, 10);

/// Output resolution tier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "1K")]
    OneK,
    #[serde(rename = "2K")]
    TwoK,
    #[serde(rename = "4K")]
    FourK,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneK => "1K",
            Self::TwoK => "2K",
            Self::FourK => "4K",
        }
    }
}

impl FromStr for Resolution {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1K" => Ok(Self::OneK),
            "2K" => Ok(Self::TwoK),
            "4K" => Ok(Self::FourK),
            other => Err(DomainError::validation(format!(
                "resolution must be one of 1K, 2K, 4K (got {other})"
            ))),
        }
    }
}

/// Output aspect ratio.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AspectRatio {
    #[serde(rename = "1:1")]
    Square,
    #[serde(rename = "4:3")]
    Landscape,
    #[serde(rename = "3:4")]
    Portrait,
    #[serde(rename = "16:9")]
    Wide,
    #[serde(rename = "9:16")]
    Tall,
}

impl AspectRatio {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Square => "1:1",
            Self::Landscape => "4:3",
            Self::Portrait => "3:4",
            Self::Wide => "16:9",
            Self::Tall => "9:16",
        }
    }
}

impl FromStr for AspectRatio {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1:1" => Ok(Self::Square),
            "4:3" => Ok(Self::Landscape),
            "3:4" => Ok(Self::Portrait),
            "16:9" => Ok(Self::Wide),
            "9:16" => Ok(Self::Tall),
            other => Err(DomainError::validation(format!(
                "aspect ratio must be one of 1:1, 4:3, 3:4, 16:9, 9:16 (got {other})"
            ))),
        }
    }
}

/// Validated generation parameters carried on the job row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateParams {
    pub prompt: String,
    pub mode: JobMode,
    /// `data:image/<type>;base64,<data>` reference image, if any.
    pub input_image: Option<String>,
    pub resolution: Option<Resolution>,
    pub aspect_ratio: Option<AspectRatio>,
    pub sample_count: Option<u32>,
}

impl GenerateParams {
    /// Validate the full parameter set. Returns the first violation found.
    pub fn validate(&self) -> DomainResult<()> {
        if self.prompt.trim().is_empty() {
            return Err(DomainError::validation("prompt must not be empty"));
        }

        if let Some(image) = &self.input_image {
            validate_input_image(image)?;
        }

        if let Some(count) = self.sample_count {
            let (lo, hi) = SAMPLE_COUNT_RANGE;
            if count < lo || count > hi {
                return Err(DomainError::validation(format!(
                    "sampleCount must be between {lo} and {hi} (got {count})"
                )));
            }
        }

        Ok(())
    }
}

fn data_uri_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^data:image/(png|jpeg|jpg|gif|webp);base64,([A-Za-z0-9+/]+=*)$")
            .expect("input image pattern is valid")
    })
}

/// Check shape and decoded size of an inline reference image.
pub fn validate_input_image(image: &str) -> DomainResult<()> {
    let captures = data_uri_regex()
        .captures(image)
        .ok_or_else(|| DomainError::validation("inputImage must be a base64 image data URI"))?;

    let payload = captures
        .get(2)
        .map(|m| m.as_str())
        .unwrap_or_default();

    let decoded = base64::engine::general_purpose::STANDARD
        .decode(payload)
        .map_err(|_| DomainError::validation("inputImage payload is not valid base64"))?;

    if decoded.len() > MAX_INPUT_IMAGE_BYTES {
        return Err(DomainError::validation(format!(
            "inputImage exceeds {} bytes after decoding",
            MAX_INPUT_IMAGE_BYTES
        )));
    }

    Ok(())
}

/// Split a validated data URI into `(mime, base64 payload)`.
///
/// Callers must have validated the URI first; malformed input yields `None`.
pub fn split_data_uri(image: &str) -> Option<(String, String)> {
    let rest = image.strip_prefix("data:")?;
    let (mime, payload) = rest.split_once(";base64,")?;
    Some((mime.to_string(), payload.to_string()))
}
