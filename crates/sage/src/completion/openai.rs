//! OpenAI-compatible chat completion client

use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, Client, Response};
use serde_json::{json, Value};

use super::{Completion, CompletionError, CompletionRequest, CompletionService};
use crate::config::CompletionConfig;

pub struct OpenAiCompletion {
    client: Client,
    api_key: Option<String>,
    endpoint: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiCompletion {
    /// Reads the API key from the environment variable named in `config`
    pub fn from_config(config: &CompletionConfig) -> Self {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty());

        if api_key.is_some() {
            tracing::info!("[COMPLETION] OpenAI client initialized (model {})", config.model);
        }

        Self {
            client: Client::new(),
            api_key,
            endpoint: config.endpoint.clone(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    fn build_payload(&self, request: &CompletionRequest) -> Value {
        let mut payload = json!({
            "model": self.model,
            "temperature": request.options.temperature.unwrap_or(self.temperature),
            "max_tokens": request.options.max_tokens.unwrap_or(self.max_tokens),
            "messages": [
                { "role": "system", "content": request.system_prompt },
                { "role": "user", "content": request.user_prompt },
            ]
        });

        if request.options.json_mode {
            payload["response_format"] = json!({ "type": "json_object" });
        }

        payload
    }

    async fn error_from_response(response: Response) -> CompletionError {
        let status = response.status().as_u16();
        let retry_after_ms = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<f64>().ok())
            .map(|secs| (secs * 1000.0) as u64);
        let body = response.text().await.unwrap_or_default();
        error_from_status(status, retry_after_ms, &body)
    }
}

/// Map a non-success HTTP status to a classified error
pub(crate) fn error_from_status(status: u16, retry_after_ms: Option<u64>, body: &str) -> CompletionError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|json| json["error"]["message"].as_str().map(String::from))
        .unwrap_or_else(|| super::truncate(body, 200).to_string());

    match status {
        429 if body.contains("insufficient_quota") => CompletionError::QuotaExceeded(message),
        429 => CompletionError::RateLimited { retry_after_ms },
        400 | 401 | 403 | 404 | 422 => CompletionError::InvalidRequest(format!("{status}: {message}")),
        408 | 504 => CompletionError::Timeout,
        _ => CompletionError::Server { status, message },
    }
}

/// Pull the assistant message out of a chat completion body
pub(crate) fn parse_response(json: &Value) -> Result<Completion, CompletionError> {
    let content = json["choices"][0]["message"]["content"]
        .as_str()
        .map(str::trim)
        .filter(|content| !content.is_empty())
        .ok_or_else(|| CompletionError::Parse("response contained no message content".to_string()))?;

    Ok(Completion {
        text: content.to_string(),
        model: json["model"].as_str().map(String::from),
    })
}

#[async_trait]
impl CompletionService for OpenAiCompletion {
    fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn complete(&self, request: CompletionRequest) -> Result<Completion, CompletionError> {
        let api_key = self.api_key.as_ref().ok_or(CompletionError::NotConfigured)?;
        let payload = self.build_payload(&request);

        tracing::debug!(
            "[COMPLETION] Sending {} request: model={}, json={}",
            request.kind,
            self.model,
            request.options.json_mode
        );

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CompletionError::Timeout
                } else {
                    CompletionError::Network(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response).await);
        }

        let json: Value = response
            .json()
            .await
            .map_err(|e| CompletionError::Parse(e.to_string()))?;

        parse_response(&json)
    }
}
