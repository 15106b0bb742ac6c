//! Scripted in-memory provider for tests and dev mode.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use pixgate_core::{EndpointTag, ErrorCode};

use crate::{GenerateOutcome, GenerateRequest, ImageProvider, InlineImage, ProviderError};

/// Replays scripted outcomes in order; once the script runs dry, every call
/// succeeds with a single image. Records the prompts it saw.
#[derive(Default)]
pub struct FakeProvider {
    script: Mutex<VecDeque<Result<GenerateOutcome, ProviderError>>>,
    prompts: Mutex<Vec<String>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a success with `count` inline images.
    pub fn push_success(&self, count: usize) {
        self.script
            .lock()
            .unwrap()
            .push_back(Ok(outcome(count, EndpointTag::Primary)));
    }

    /// Queue a success attributed to a specific endpoint.
    pub fn push_success_via(&self, count: usize, endpoint: EndpointTag) {
        self.script
            .lock()
            .unwrap()
            .push_back(Ok(outcome(count, endpoint)));
    }

    /// Queue a failure with the given code.
    pub fn push_error(&self, code: ErrorCode) {
        self.script
            .lock()
            .unwrap()
            .push_back(Err(ProviderError::new(code, format!("scripted {code}"))));
    }

    /// Number of generate calls observed so far.
    pub fn call_count(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

fn outcome(count: usize, endpoint: EndpointTag) -> GenerateOutcome {
    use base64::Engine as _;
    let images = (0..count)
        .map(|i| {
            let payload =
                base64::engine::general_purpose::STANDARD.encode(format!("fake-image-{i}"));
            InlineImage {
                url: format!("data:image/png;base64,{payload}"),
                mime: "image/png".to_string(),
            }
        })
        .collect();
    GenerateOutcome {
        images,
        model_used: crate::DEFAULT_MODEL.to_string(),
        endpoint_used: endpoint,
    }
}

#[async_trait]
impl ImageProvider for FakeProvider {
    async fn generate(
        &self,
        request: &GenerateRequest,
    ) -> Result<GenerateOutcome, ProviderError> {
        self.prompts.lock().unwrap().push(request.prompt.clone());
        match self.script.lock().unwrap().pop_front() {
            Some(result) => result,
            None => Ok(outcome(1, request.credential.endpoint)),
        }
    }
}
