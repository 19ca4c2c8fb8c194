//! OpenAI-compatible Backend
//!
//! Streams chat completions from any endpoint speaking the OpenAI chat
//! completion protocol (OpenAI, Azure OpenAI, local gateways).
//!
//! # Wire format
//!
//! ```text
//! POST {base_url}{path}
//! Content-Type: application/json
//! Accept: text/event-stream
//! api-key: ...  |  Authorization: Bearer ...
//!
//! data: {"choices":[{"delta":{"content":"Hi"}}]}
//!
//! data: [DONE]
//! ```

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION};

use super::sse::decode_sse;
use super::traits::{AuthScheme, BackendConfig, CompletionBackend, FrameStream};
use crate::error::RelayError;
use crate::prompt::CompletionRequest;

/// Azure-style key header
const API_KEY_HEADER: &str = "api-key";

/// OpenAI-compatible streaming backend
#[derive(Clone, Debug)]
pub struct OpenAiBackend {
    config: BackendConfig,
    endpoint: String,
    http_client: reqwest::Client,
}

impl OpenAiBackend {
    /// Create a backend from connection settings
    ///
    /// # Errors
    ///
    /// Fails when the HTTP client cannot be constructed.
    pub fn new(config: BackendConfig) -> Result<Self, RelayError> {
        let mut builder = reqwest::Client::builder().connect_timeout(config.connect_timeout);
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let http_client = builder.build().map_err(|e| {
            RelayError::UpstreamConnection(format!("failed to create HTTP client: {e}"))
        })?;

        Ok(Self {
            endpoint: config.endpoint(),
            config,
            http_client,
        })
    }

    /// The configured endpoint URL
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn build_request(&self, request: &CompletionRequest) -> reqwest::RequestBuilder {
        let mut body = request.clone();
        body.stream = true;
        if body.model.is_none() {
            body.model.clone_from(&self.config.model);
        }

        let mut builder = self
            .http_client
            .post(&self.endpoint)
            .header(ACCEPT, "text/event-stream")
            .json(&body);

        if let Some(key) = &self.config.api_key {
            builder = match self.config.auth {
                AuthScheme::ApiKeyHeader => builder.header(API_KEY_HEADER, key),
                AuthScheme::Bearer => builder.header(AUTHORIZATION, format!("Bearer {key}")),
            };
        }
        builder
    }
}

#[async_trait]
impl CompletionBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    async fn open_stream(&self, request: &CompletionRequest) -> Result<FrameStream, RelayError> {
        tracing::debug!(
            endpoint = %self.endpoint,
            messages = request.messages.len(),
            "Opening completion stream"
        );

        let response = self.build_request(request).send().await.map_err(|e| {
            if e.is_timeout() {
                RelayError::UpstreamTimeout(
                    self.config
                        .request_timeout
                        .unwrap_or(self.config.connect_timeout),
                )
            } else {
                RelayError::UpstreamConnection(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::UpstreamStatus {
                status: status.as_u16(),
                body,
            });
        }

        Ok(decode_sse(Box::pin(response.bytes_stream())))
    }
}
