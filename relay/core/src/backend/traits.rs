//! Completion Backend Traits
//!
//! The relay only needs one thing from a completion provider: open a
//! streaming call and hand back raw frames in arrival order. Decoding the
//! frames into deltas is the relay's job, so the same backend can be replayed
//! from a script in tests.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::prompt::CompletionRequest;

/// Raw frames of one streaming call
///
/// Each item is one SSE `data:` payload (including the `[DONE]` sentinel).
/// An `Err` item ends the call.
pub type FrameStream = BoxStream<'static, Result<String, RelayError>>;

/// Completion backend trait
///
/// Implement this to relay from a different provider or from a fixture.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Backend name for logs (e.g. "openai")
    fn name(&self) -> &str;

    /// Open one streaming completion call
    ///
    /// # Errors
    ///
    /// Fails with an upstream error when the call cannot be established or
    /// the provider rejects it.
    async fn open_stream(&self, request: &CompletionRequest) -> Result<FrameStream, RelayError>;
}

/// How the API key is presented to the provider
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthScheme {
    /// `api-key: <key>` header (Azure OpenAI)
    #[default]
    ApiKeyHeader,
    /// `Authorization: Bearer <key>`
    Bearer,
}

impl AuthScheme {
    /// Parse the config/env spelling
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "api_key" | "api-key" | "apikey" | "azure" => Some(Self::ApiKeyHeader),
            "bearer" | "openai" => Some(Self::Bearer),
            _ => None,
        }
    }
}

/// Connection settings for an OpenAI-compatible chat completion endpoint
#[derive(Clone)]
pub struct BackendConfig {
    /// Scheme and host, e.g. `https://example.openai.azure.com`
    pub base_url: String,
    /// Request path including any deployment segment and query string
    pub path: String,
    /// Secret presented according to `auth`
    pub api_key: Option<String>,
    /// Header style for the key
    pub auth: AuthScheme,
    /// Model name sent in the body (omitted when `None`)
    pub model: Option<String>,
    /// Upper bound on a whole call
    pub request_timeout: Option<Duration>,
    /// Upper bound on establishing the connection
    pub connect_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            path: "/v1/chat/completions".to_string(),
            api_key: None,
            auth: AuthScheme::Bearer,
            model: None,
            request_timeout: None,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl BackendConfig {
    /// Full endpoint URL
    #[must_use]
    pub fn endpoint(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        if self.path.is_empty() {
            base.to_string()
        } else if self.path.starts_with('/') {
            format!("{base}{}", self.path)
        } else {
            format!("{base}/{}", self.path)
        }
    }
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConfig")
            .field("base_url", &self.base_url)
            .field("path", &self.path)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("auth", &self.auth)
            .field("model", &self.model)
            .field("request_timeout", &self.request_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_base_and_path() {
        let mut config = BackendConfig {
            base_url: "https://host.example/".to_string(),
            path: "openai/deployments/gpt/chat/completions?api-version=2024-02-01".to_string(),
            ..BackendConfig::default()
        };
        assert_eq!(
            config.endpoint(),
            "https://host.example/openai/deployments/gpt/chat/completions?api-version=2024-02-01"
        );

        config.path = "/v1/chat/completions".to_string();
        assert_eq!(config.endpoint(), "https://host.example/v1/chat/completions");
    }

    #[test]
    fn test_debug_redacts_key() {
        let config = BackendConfig {
            api_key: Some("sk-secret".to_string()),
            ..BackendConfig::default()
        };
        let printed = format!("{config:?}");
        assert!(!printed.contains("sk-secret"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn test_auth_scheme_parse() {
        assert_eq!(AuthScheme::parse("Bearer"), Some(AuthScheme::Bearer));
        assert_eq!(AuthScheme::parse("api-key"), Some(AuthScheme::ApiKeyHeader));
        assert_eq!(AuthScheme::parse("basic"), None);
    }
}
