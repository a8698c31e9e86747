//! Model backends.
//!
//! Every runtime the router can dispatch to implements [`ModelBackend`]. The
//! implementation for each provider is chosen from configuration
//! ([`BackendRegistry::from_config`]); nothing inspects a client at runtime
//! to guess what it can do.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use sb_core::config::{BackendKind, ProviderEndpoint, ProvidersConfig};
use sb_core::types::Provider;
use serde::Deserialize;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Connection failure, DNS, TLS and similar transport problems.
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("rate limited: retry after {retry_after_secs:?}s")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("request timed out")]
    Timeout,

    #[error("parse error: {0}")]
    Parse(String),

    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl BackendError {
    pub fn kind(&self) -> &'static str {
        match self {
            BackendError::Http(_) => "http",
            BackendError::Api { .. } => "api",
            BackendError::RateLimited { .. } => "rate_limited",
            BackendError::Timeout => "timeout",
            BackendError::Parse(_) => "parse",
            BackendError::Unsupported(_) => "unsupported",
        }
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            BackendError::Timeout
        } else {
            BackendError::Http(err.to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ModelBackend: Send + Sync {
    fn provider(&self) -> Provider;

    /// One-shot completion of `prompt` on `model_id`. Returns the raw text.
    async fn generate(&self, model_id: &str, prompt: &str) -> Result<String, BackendError>;

    /// Models the runtime currently serves.
    async fn list_models(&self) -> Result<Vec<String>, BackendError>;
}

/// Map 429 and other non-2xx statuses to typed errors.
async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = resp.status();
    if status.as_u16() == 429 {
        let retry_after_secs = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        return Err(BackendError::RateLimited { retry_after_secs });
    }
    if !status.is_success() {
        let message = resp.text().await.unwrap_or_default();
        return Err(BackendError::Api {
            status: status.as_u16(),
            message,
        });
    }
    Ok(resp)
}

async fn parse_json<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<T, BackendError> {
    resp.json::<T>()
        .await
        .map_err(|e| BackendError::Parse(e.to_string()))
}

fn trim_base(url: impl Into<String>) -> String {
    url.into().trim_end_matches('/').to_string()
}

// ---------------------------------------------------------------------------
// OllamaBackend
// ---------------------------------------------------------------------------

pub struct OllamaBackend {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Deserialize)]
struct OllamaGenerateResponse {
    response: String,
}

#[derive(Deserialize)]
struct OllamaTags {
    #[serde(default)]
    models: Vec<OllamaTag>,
}

#[derive(Deserialize)]
struct OllamaTag {
    name: String,
}

impl OllamaBackend {
    pub const DEFAULT_URL: &'static str = "http://localhost:11434";

    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: trim_base(base_url),
        }
    }
}

#[async_trait]
impl ModelBackend for OllamaBackend {
    fn provider(&self) -> Provider {
        Provider::Ollama
    }

    async fn generate(&self, model_id: &str, prompt: &str) -> Result<String, BackendError> {
        let body = serde_json::json!({
            "model": model_id,
            "prompt": prompt,
            "stream": false,
        });
        let resp = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&body)
            .send()
            .await?;
        let parsed: OllamaGenerateResponse = parse_json(check_status(resp).await?).await?;
        Ok(parsed.response)
    }

    async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        let resp = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await?;
        let tags: OllamaTags = parse_json(check_status(resp).await?).await?;
        Ok(tags.models.into_iter().map(|t| t.name).collect())
    }
}

// ---------------------------------------------------------------------------
// OpenAiBackend
// ---------------------------------------------------------------------------

pub struct OpenAiBackend {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

#[derive(Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// `{"data": [{"id": ...}]}`, shared by the OpenAI and Anthropic listings.
#[derive(Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelListEntry>,
}

#[derive(Deserialize)]
struct ModelListEntry {
    id: String,
}

impl OpenAiBackend {
    pub const DEFAULT_URL: &'static str = "https://api.openai.com";

    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: trim_base(base_url),
        }
    }
}

#[async_trait]
impl ModelBackend for OpenAiBackend {
    fn provider(&self) -> Provider {
        Provider::OpenAi
    }

    async fn generate(&self, model_id: &str, prompt: &str) -> Result<String, BackendError> {
        let body = serde_json::json!({
            "model": model_id,
            "messages": [{ "role": "user", "content": prompt }],
        });
        let resp = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let completion: ChatCompletion = parse_json(check_status(resp).await?).await?;
        completion
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.unwrap_or_default())
            .ok_or_else(|| BackendError::Parse("response has no choices".into()))
    }

    async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        let resp = self
            .client
            .get(format!("{}/v1/models", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        let list: ModelList = parse_json(check_status(resp).await?).await?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }
}

// ---------------------------------------------------------------------------
// AnthropicBackend
// ---------------------------------------------------------------------------

pub struct AnthropicBackend {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct AnthropicMessage {
    content: Vec<AnthropicBlock>,
}

#[derive(Deserialize)]
struct AnthropicBlock {
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicBackend {
    pub const DEFAULT_URL: &'static str = "https://api.anthropic.com";
    const API_VERSION: &'static str = "2023-06-01";

    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: trim_base(base_url),
            max_tokens: 4096,
        }
    }
}

#[async_trait]
impl ModelBackend for AnthropicBackend {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    async fn generate(&self, model_id: &str, prompt: &str) -> Result<String, BackendError> {
        let body = serde_json::json!({
            "model": model_id,
            "max_tokens": self.max_tokens,
            "messages": [{ "role": "user", "content": prompt }],
        });
        let resp = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", Self::API_VERSION)
            .json(&body)
            .send()
            .await?;
        let message: AnthropicMessage = parse_json(check_status(resp).await?).await?;
        Ok(message
            .content
            .iter()
            .filter_map(|b| b.text.as_deref())
            .collect::<Vec<_>>()
            .join(""))
    }

    async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        let resp = self
            .client
            .get(format!("{}/v1/models", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", Self::API_VERSION)
            .send()
            .await?;
        let list: ModelList = parse_json(check_status(resp).await?).await?;
        Ok(list.data.into_iter().map(|m| m.id).collect())
    }
}

// ---------------------------------------------------------------------------
// MockBackend
// ---------------------------------------------------------------------------

/// In-process backend for tests and offline runs (`backend = "mock"`).
///
/// Queued results are returned in order; once the queue is empty every call
/// answers `"mock response from <model>"`.
pub struct MockBackend {
    provider: Provider,
    models: Vec<String>,
    listing_fails: bool,
    delay: Option<Duration>,
    responses: Mutex<VecDeque<Result<String, BackendError>>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl MockBackend {
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            models: Vec::new(),
            listing_fails: false,
            delay: None,
            responses: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_models<I, S>(mut self, models: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }

    /// Make `list_models` fail so callers exercise their static fallback.
    pub fn with_failing_listing(mut self) -> Self {
        self.listing_fails = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_response(self, text: impl Into<String>) -> Self {
        self.push(Ok(text.into()));
        self
    }

    pub fn with_error(self, error: BackendError) -> Self {
        self.push(Err(error));
        self
    }

    pub fn push(&self, result: Result<String, BackendError>) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(result);
    }

    /// `(model_id, prompt)` for every generate call, in order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[async_trait]
impl ModelBackend for MockBackend {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn generate(&self, model_id: &str, prompt: &str) -> Result<String, BackendError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((model_id.to_string(), prompt.to_string()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let queued = self
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        queued.unwrap_or_else(|| Ok(format!("mock response from {model_id}")))
    }

    async fn list_models(&self) -> Result<Vec<String>, BackendError> {
        if self.listing_fails {
            return Err(BackendError::Http("connection refused".into()));
        }
        Ok(self.models.clone())
    }
}

// ---------------------------------------------------------------------------
// BackendRegistry
// ---------------------------------------------------------------------------

/// Provider → backend. A provider with no entry is treated as offline.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: HashMap<Provider, Arc<dyn ModelBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, backend: Arc<dyn ModelBackend>) -> Self {
        self.insert(backend);
        self
    }

    pub fn insert(&mut self, backend: Arc<dyn ModelBackend>) {
        self.backends.insert(backend.provider(), backend);
    }

    pub fn get(&self, provider: Provider) -> Option<Arc<dyn ModelBackend>> {
        self.backends.get(&provider).cloned()
    }

    pub fn providers(&self) -> Vec<Provider> {
        let mut providers: Vec<Provider> = self.backends.keys().copied().collect();
        providers.sort();
        providers
    }

    /// Build one backend per enabled provider. Hosted providers whose API
    /// key variable is unset are skipped with a warning.
    pub fn from_config(config: &ProvidersConfig) -> Self {
        let mut registry = Self::new();
        for provider in Provider::ALL {
            let endpoint = config.endpoint(provider);
            if !endpoint.enabled {
                debug!(%provider, "provider disabled");
                continue;
            }
            if let Some(backend) = build_backend(provider, endpoint) {
                registry.insert(backend);
            }
        }
        registry
    }
}

fn build_backend(provider: Provider, endpoint: &ProviderEndpoint) -> Option<Arc<dyn ModelBackend>> {
    if endpoint.backend == BackendKind::Mock {
        return Some(Arc::new(
            MockBackend::new(provider).with_models(endpoint.static_models.clone()),
        ));
    }

    let api_key = endpoint
        .api_key_env
        .as_deref()
        .and_then(|var| std::env::var(var).ok())
        .filter(|k| !k.is_empty());

    match provider {
        Provider::Ollama => {
            let url = endpoint
                .base_url
                .clone()
                .unwrap_or_else(|| OllamaBackend::DEFAULT_URL.to_string());
            Some(Arc::new(OllamaBackend::new(url)))
        }
        Provider::OpenAi => {
            let Some(key) = api_key else {
                warn!(%provider, env = ?endpoint.api_key_env, "API key not set, provider offline");
                return None;
            };
            let url = endpoint
                .base_url
                .clone()
                .unwrap_or_else(|| OpenAiBackend::DEFAULT_URL.to_string());
            Some(Arc::new(OpenAiBackend::new(key, url)))
        }
        Provider::Anthropic => {
            let Some(key) = api_key else {
                warn!(%provider, env = ?endpoint.api_key_env, "API key not set, provider offline");
                return None;
            };
            let url = endpoint
                .base_url
                .clone()
                .unwrap_or_else(|| AnthropicBackend::DEFAULT_URL.to_string());
            Some(Arc::new(AnthropicBackend::new(key, url)))
        }
    }
}
