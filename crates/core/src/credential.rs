//! Provider credential entity and the endpoint taxonomy.

use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::CredentialId;

/// Named variant of the upstream provider URL + auth style.
///
/// Each endpoint carries its own health rollups and may declare preferred
/// models; the descriptor (URL, auth style, fallback order) lives in the
/// provider crate's registry.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum EndpointTag {
    /// The provider's own API surface.
    Primary,
    /// Proxy relay, used as overflow when the primary is overloaded.
    ProxyA,
}

impl EndpointTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::ProxyA => "proxy-a",
        }
    }
}

impl core::fmt::Display for EndpointTag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EndpointTag {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "primary" => Ok(Self::Primary),
            "proxy-a" => Ok(Self::ProxyA),
            other => Err(DomainError::validation(format!(
                "unknown endpoint tag: {other}"
            ))),
        }
    }
}

impl From<EndpointTag> for String {
    fn from(value: EndpointTag) -> Self {
        value.as_str().to_string()
    }
}

impl TryFrom<String> for EndpointTag {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One entry in the provider credential pool. Set out-of-band.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: CredentialId,
    /// Provider tag, e.g. `gemini`.
    pub provider: String,
    pub endpoint: EndpointTag,
    /// The opaque upstream secret. Never logged, never serialized into
    /// responses or webhook payloads.
    pub secret: String,
    pub rpm_limit: u32,
    pub concurrency_limit: u32,
    /// Lower = preferred.
    pub priority: i32,
    pub enabled: bool,
}

// Manual Debug so the secret cannot leak through `{:?}` in logs.
impl core::fmt::Debug for Credential {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("provider", &self.provider)
            .field("endpoint", &self.endpoint)
            .field("secret", &"<redacted>")
            .field("rpm_limit", &self.rpm_limit)
            .field("concurrency_limit", &self.concurrency_limit)
            .field("priority", &self.priority)
            .field("enabled", &self.enabled)
            .finish()
    }
}
