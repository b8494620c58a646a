use async_trait::async_trait;
use devmon_core::{truncate_chars, Depth};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_MODEL: &str = "claude-3-5-haiku-latest";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderFailureKind {
    NotConfigured,
    Timeout,
    Transport,
    Status,
    InvalidResponse,
}

impl ProviderFailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotConfigured => "not_configured",
            Self::Timeout => "timeout",
            Self::Transport => "transport",
            Self::Status => "status",
            Self::InvalidResponse => "invalid_response",
        }
    }
}

impl fmt::Display for ProviderFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderFailureKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            ProviderFailureKind::Timeout
        } else if err.is_decode() {
            ProviderFailureKind::InvalidResponse
        } else {
            ProviderFailureKind::Transport
        };
        Self::new(kind, err.to_string())
    }
}

/// Opaque text-analysis capability. Implementations take a prepared payload
/// and return free text; an empty string means "nothing to report".
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn analyze(&self, payload: &str, depth: Depth) -> Result<String, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

fn max_tokens_for(depth: Depth) -> u32 {
    match depth {
        Depth::Quick => 300,
        Depth::Standard => 700,
        Depth::Deep => 1_500,
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<RequestMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct RequestMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
}

#[derive(Debug, Deserialize)]
struct ResponseBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

/// Messages-API client.
pub struct AnthropicProvider {
    client: reqwest::Client,
    config: ProviderConfig,
}

impl AnthropicProvider {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        if config
            .api_key
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .is_empty()
        {
            return Err(ProviderError::new(
                ProviderFailureKind::NotConfigured,
                "no API key configured; set ANTHROPIC_API_KEY or pass --api-key",
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(ProviderError::from)?;

        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl AnalysisProvider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn analyze(&self, payload: &str, depth: Depth) -> Result<String, ProviderError> {
        let api_key = self.config.api_key.as_deref().unwrap_or_default();
        let request = MessagesRequest {
            model: &self.config.model,
            max_tokens: max_tokens_for(depth),
            messages: vec![RequestMessage {
                role: "user",
                content: payload,
            }],
        };

        debug!(model = %self.config.model, depth = %depth, "provider request");
        let response = self
            .client
            .post(self.endpoint())
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::new(
                ProviderFailureKind::Status,
                format!("HTTP {}: {}", status.as_u16(), truncate_chars(body.trim(), 200)),
            ));
        }

        let parsed: MessagesResponse = response.json().await?;
        let text = parsed
            .content
            .into_iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text)
            .collect::<Vec<_>>()
            .join("\n");
        Ok(text)
    }
}

/// Tries each provider in order and returns the first success.
pub struct FallbackChain {
    providers: Vec<Arc<dyn AnalysisProvider>>,
}

impl FallbackChain {
    pub fn new(providers: Vec<Arc<dyn AnalysisProvider>>) -> Self {
        Self { providers }
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

#[async_trait]
impl AnalysisProvider for FallbackChain {
    fn name(&self) -> &str {
        "fallback-chain"
    }

    async fn analyze(&self, payload: &str, depth: Depth) -> Result<String, ProviderError> {
        let mut last_error = ProviderError::new(
            ProviderFailureKind::NotConfigured,
            "no providers configured",
        );
        for provider in &self.providers {
            match provider.analyze(payload, depth).await {
                Ok(text) => return Ok(text),
                Err(err) => {
                    warn!(provider = provider.name(), "provider_failed: {err}");
                    last_error = err;
                }
            }
        }
        Err(last_error)
    }
}
