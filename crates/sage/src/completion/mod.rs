//! Completion service abstraction
//!
//! The pipeline only needs "prompt in, text out". Structured answers are
//! requested with `json_mode` and parsed on our side with [`Completion::parse_json`],
//! which tolerates code fences and chatter around the object.

mod cache;
mod openai;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::de::DeserializeOwned;

pub use cache::{CacheStats, CachedCompletion};
pub use openai::OpenAiCompletion;

use crate::{
    config::CompletionConfig,
    retry::{Classify, FailureClass},
};

/// Per-request generation knobs; `None` falls back to the service defaults
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub json_mode: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    /// Short tag for logs and cache keys ("plan", "write", ...)
    pub kind: String,
    pub system_prompt: String,
    pub user_prompt: String,
    pub options: CompletionOptions,
}

impl CompletionRequest {
    pub fn new(
        kind: impl Into<String>,
        system_prompt: impl Into<String>,
        user_prompt: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            system_prompt: system_prompt.into(),
            user_prompt: user_prompt.into(),
            options: CompletionOptions::default(),
        }
    }

    pub fn json(mut self) -> Self {
        self.options.json_mode = true;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.options.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.options.max_tokens = Some(max_tokens);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub model: Option<String>,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model: None,
        }
    }

    /// Deserialize the JSON object embedded in the completion text
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, CompletionError> {
        serde_json::from_str(extract_json(&self.text))
            .map_err(|e| CompletionError::Parse(format!("{} in {:?}", e, truncate(&self.text, 120))))
    }
}

/// Errors from a completion service
#[derive(Debug, Clone, thiserror::Error)]
pub enum CompletionError {
    #[error("Rate limited: retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Response parse error: {0}")]
    Parse(String),

    #[error("Completion service not configured")]
    NotConfigured,
}

impl Classify for CompletionError {
    fn classify(&self) -> FailureClass {
        match self {
            CompletionError::RateLimited { retry_after_ms } => FailureClass::RateLimited {
                retry_after: retry_after_ms.map(Duration::from_millis),
            },
            CompletionError::QuotaExceeded(_) => FailureClass::RateLimited { retry_after: None },
            CompletionError::Timeout | CompletionError::Network(_) => FailureClass::Retryable,
            CompletionError::Server { status, .. } if *status >= 500 => FailureClass::Retryable,
            CompletionError::Server { .. }
            | CompletionError::InvalidRequest(_)
            | CompletionError::Parse(_)
            | CompletionError::NotConfigured => FailureClass::Fatal,
        }
    }
}

/// A text-completion backend
#[async_trait]
pub trait CompletionService: Send + Sync {
    fn is_configured(&self) -> bool {
        true
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, CompletionError>;
}

/// Stand-in used when no credentials are available; every call fails fatally
/// so the pipeline goes straight to its fallbacks.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledCompletion;

#[async_trait]
impl CompletionService for DisabledCompletion {
    fn is_configured(&self) -> bool {
        false
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<Completion, CompletionError> {
        Err(CompletionError::NotConfigured)
    }
}

/// Build the completion service described by `config`
pub fn completion_from_config(config: &CompletionConfig) -> Arc<dyn CompletionService> {
    let openai = OpenAiCompletion::from_config(config);
    if !openai.is_configured() {
        tracing::warn!(
            "[COMPLETION] {} not set, completion calls will use fallbacks",
            config.api_key_env
        );
        return Arc::new(DisabledCompletion);
    }

    if config.cache_capacity == 0 {
        return Arc::new(openai);
    }

    Arc::new(CachedCompletion::new(
        openai,
        config.cache_capacity,
        Duration::from_secs(config.cache_ttl_secs),
    ))
}

/// Strip code fences or surrounding prose from a JSON answer
pub(crate) fn extract_json(response: &str) -> &str {
    let trimmed = response.trim();

    if trimmed.starts_with("```") {
        if let Some(start) = trimmed.find('\n') {
            let after_fence = &trimmed[start + 1..];
            if let Some(end) = after_fence.rfind("```") {
                return after_fence[..end].trim();
            }
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            return &trimmed[start..=end];
        }
    }

    trimmed
}

pub(crate) fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
