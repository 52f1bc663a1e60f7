//! HTTP generator providers
//!
//! Both providers are plain chat endpoints taking a system and a user message.
//! Each request is stateless; nothing is carried between calls except the
//! circuit breaker.

use crate::circuit_breaker::CircuitBreaker;
use crate::generator::{GenerationRequest, Generator};
use async_trait::async_trait;
use kiln_core::config::{GeneratorConfig, GeneratorMode};
use kiln_core::{KilnError, Result};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Where completions come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provider {
    /// `POST {base}/api/chat`
    Ollama { base_url: String },
    /// `POST {base}/v1/chat/completions` with bearer auth
    OpenAiCompat { base_url: String, api_key: String },
}

impl Provider {
    pub fn endpoint(&self) -> String {
        match self {
            Self::Ollama { base_url } => format!("{}/api/chat", base_url.trim_end_matches('/')),
            Self::OpenAiCompat { base_url, .. } => {
                format!("{}/v1/chat/completions", base_url.trim_end_matches('/'))
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ollama { .. } => "ollama",
            Self::OpenAiCompat { .. } => "openai-compatible",
        }
    }

    fn body(&self, request: &GenerationRequest) -> Value {
        let messages = json!([
            {"role": "system", "content": request.system},
            {"role": "user", "content": request.user},
        ]);
        match self {
            Self::Ollama { .. } => json!({
                "model": request.model,
                "messages": messages,
                "stream": false,
                "options": {"num_predict": request.max_tokens},
            }),
            Self::OpenAiCompat { .. } => json!({
                "model": request.model,
                "messages": messages,
                "temperature": 0.2,
                "max_tokens": request.max_tokens,
            }),
        }
    }

    fn reply_text(&self, body: &Value) -> Option<String> {
        let content = match self {
            Self::Ollama { .. } => body.pointer("/message/content"),
            Self::OpenAiCompat { .. } => body.pointer("/choices/0/message/content"),
        };
        content.and_then(Value::as_str).map(str::to_string)
    }
}

/// Backoff for 429 and 5xx responses
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Generator backed by an HTTP chat endpoint
#[derive(Clone)]
pub struct HttpGenerator {
    provider: Provider,
    http: reqwest::Client,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
}

impl HttpGenerator {
    pub fn new(provider: Provider, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| KilnError::Generator(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            provider,
            http,
            breaker: Arc::new(CircuitBreaker::default()),
            retry: RetryPolicy::default(),
        })
    }

    /// Build the provider selected by `generator.mode`
    pub fn from_config(config: &GeneratorConfig, api_key: Option<String>) -> Result<Self> {
        let provider = match config.mode {
            GeneratorMode::Ollama => Provider::Ollama {
                base_url: config.ollama_base_url.clone(),
            },
            GeneratorMode::Api => {
                if config.api_base_url.trim().is_empty() {
                    return Err(KilnError::Config(
                        "generator.api_base_url (API_BASE_URL) is required in api mode".to_string(),
                    ));
                }
                let api_key = api_key.ok_or_else(|| {
                    KilnError::Config(format!(
                        "{} must be set in api mode",
                        config.api_key_env
                    ))
                })?;
                Provider::OpenAiCompat {
                    base_url: config.api_base_url.clone(),
                    api_key,
                }
            }
        };
        Self::new(provider, Duration::from_secs(config.request_timeout_secs))
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    fn fail(&self, message: String) -> KilnError {
        self.breaker.record_failure();
        warn!(
            "{} request failed (consecutive failures: {}): {}",
            self.provider.name(),
            self.breaker.failure_count(),
            message
        );
        KilnError::Generator(message)
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    #[instrument(skip(self, request), fields(provider = self.provider.name(), model = %request.model))]
    async fn complete(&self, request: &GenerationRequest) -> Result<String> {
        self.breaker.check()?;

        let url = self.provider.endpoint();
        let body = self.provider.body(request);
        let mut retries = 0;
        let mut backoff = self.retry.initial_backoff;

        loop {
            debug!("POST {} (attempt {})", url, retries + 1);

            let mut builder = self.http.post(&url).json(&body);
            if let Provider::OpenAiCompat { api_key, .. } = &self.provider {
                builder = builder.bearer_auth(api_key);
            }

            let response = match builder.send().await {
                Ok(response) => response,
                Err(e) => return Err(self.fail(format!("request to {} failed: {}", url, e))),
            };

            let status = response.status();
            let retryable = status.as_u16() == 429 || status.is_server_error();

            if retryable && retries < self.retry.max_retries {
                retries += 1;
                let wait = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .map(Duration::from_secs)
                    .unwrap_or(backoff);
                warn!(
                    "{} returned {}. Waiting {:?} before retry {}/{}",
                    self.provider.name(),
                    status,
                    wait,
                    retries,
                    self.retry.max_retries
                );
                tokio::time::sleep(wait).await;
                backoff = (backoff * 2).min(self.retry.max_backoff);
                continue;
            }

            if !status.is_success() {
                let text = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unknown".to_string());
                return Err(self.fail(format!("{} error {}: {}", self.provider.name(), status, text)));
            }

            let payload: Value = match response.json().await {
                Ok(payload) => payload,
                Err(e) => return Err(self.fail(format!("unreadable response body: {}", e))),
            };
            let Some(text) = self.provider.reply_text(&payload) else {
                return Err(self.fail("response has no message content".to_string()));
            };

            self.breaker.record_success();
            info!("{} completion ({} chars)", self.provider.name(), text.len());
            return Ok(text);
        }
    }
}
