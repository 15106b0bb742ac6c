//! Endpoint registry: the named variants of the upstream URL + auth style.

use pixgate_core::EndpointTag;

/// How a credential secret is presented to an endpoint.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AuthStyle {
    /// `?key=<secret>` appended to the URL.
    QueryKey,
    /// `Authorization: Bearer <secret>` header.
    Bearer,
}

/// One upstream endpoint variant.
#[derive(Debug, Clone)]
pub struct EndpointDescriptor {
    pub tag: EndpointTag,
    /// Base URL up to and including the API version segment.
    pub base_url: String,
    pub auth: AuthStyle,
    /// Models this endpoint is tuned for; the scheduler prefers an endpoint
    /// whose list contains the requested model.
    pub preferred_models: Vec<String>,
}

impl EndpointDescriptor {
    /// Resolve the generateContent URL for a model. The secret is appended
    /// only for query-key auth; bearer endpoints carry it in a header.
    pub fn generate_url(&self, model: &str, secret: &str) -> String {
        let base = self.base_url.trim_end_matches('/');
        match self.auth {
            AuthStyle::QueryKey => {
                format!("{base}/models/{model}:generateContent?key={secret}")
            }
            AuthStyle::Bearer => format!("{base}/models/{model}:generateContent"),
        }
    }
}

/// The set of configured endpoints and their overload-fallback order.
#[derive(Debug, Clone)]
pub struct EndpointRegistry {
    endpoints: Vec<EndpointDescriptor>,
    fallback_order: Vec<EndpointTag>,
}

impl EndpointRegistry {
    pub fn new(endpoints: Vec<EndpointDescriptor>, fallback_order: Vec<EndpointTag>) -> Self {
        Self {
            endpoints,
            fallback_order,
        }
    }

    /// The stock Gemini layout: the Google API surface plus a bearer-auth
    /// proxy relay, overflowing primary -> proxy.
    pub fn default_gemini() -> Self {
        Self::new(
            vec![
                EndpointDescriptor {
                    tag: EndpointTag::Primary,
                    base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
                    auth: AuthStyle::QueryKey,
                    preferred_models: vec![super::DEFAULT_MODEL.to_string()],
                },
                EndpointDescriptor {
                    tag: EndpointTag::ProxyA,
                    base_url: "https://gemini-proxy.internal/v1beta".to_string(),
                    auth: AuthStyle::Bearer,
                    preferred_models: Vec::new(),
                },
            ],
            vec![EndpointTag::Primary, EndpointTag::ProxyA],
        )
    }

    pub fn descriptor(&self, tag: EndpointTag) -> Option<&EndpointDescriptor> {
        self.endpoints.iter().find(|e| e.tag == tag)
    }

    pub fn fallback_order(&self) -> &[EndpointTag] {
        &self.fallback_order
    }

    pub fn is_model_preferred(&self, tag: EndpointTag, model: &str) -> bool {
        self.descriptor(tag)
            .map(|e| e.preferred_models.iter().any(|m| m == model))
            .unwrap_or(false)
    }

    /// Replace an endpoint's base URL (config override).
    pub fn with_base_url(mut self, tag: EndpointTag, base_url: impl Into<String>) -> Self {
        if let Some(endpoint) = self.endpoints.iter_mut().find(|e| e.tag == tag) {
            endpoint.base_url = base_url.into();
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_key_auth_appends_the_secret() {
        let registry = EndpointRegistry::default_gemini();
        let primary = registry.descriptor(EndpointTag::Primary).unwrap();
        let url = primary.generate_url("gemini-2.5-flash-image", "sk-123");
        assert_eq!(
            url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash-image:generateContent?key=sk-123"
        );
    }

    #[test]
    fn bearer_auth_keeps_the_secret_out_of_the_url() {
        let registry = EndpointRegistry::default_gemini();
        let proxy = registry.descriptor(EndpointTag::ProxyA).unwrap();
        let url = proxy.generate_url("gemini-2.5-flash-image", "sk-123");
        assert!(!url.contains("sk-123"));
        assert_eq!(proxy.auth, AuthStyle::Bearer);
    }

    #[test]
    fn model_preference_is_per_endpoint() {
        let registry = EndpointRegistry::default_gemini();
        assert!(registry.is_model_preferred(EndpointTag::Primary, super::super::DEFAULT_MODEL));
        assert!(!registry.is_model_preferred(EndpointTag::ProxyA, super::super::DEFAULT_MODEL));
    }

    #[test]
    fn base_url_override() {
        let registry = EndpointRegistry::default_gemini()
            .with_base_url(EndpointTag::Primary, "http://127.0.0.1:9999/v1beta");
        let primary = registry.descriptor(EndpointTag::Primary).unwrap();
        assert!(primary
            .generate_url("m", "s")
            .starts_with("http://127.0.0.1:9999/v1beta/models/m"));
    }
}
