//! Configuration for Sage
//!
//! Layered as defaults, then an optional TOML file, then `SAGE__SECTION__KEY`
//! environment variables (e.g. `SAGE__RETRY__MAX_RETRIES=4`).

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{retry::RetryPolicy, Result, SageError};

/// Circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_healthy_threshold_ms")]
    pub healthy_threshold_ms: u64,
}

fn default_max_failures() -> u32 {
    3
}

fn default_cooldown_ms() -> u64 {
    60_000
}

fn default_healthy_threshold_ms() -> u64 {
    5 * 60_000
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            max_failures: default_max_failures(),
            cooldown_ms: default_cooldown_ms(),
            healthy_threshold_ms: default_healthy_threshold_ms(),
        }
    }
}

/// Retry policy applied around every provider and completion call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_true")]
    pub exponential: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_rate_limit_max_retries")]
    pub rate_limit_max_retries: u32,
    /// Cap on any single backoff, including server `Retry-After` hints
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_retries() -> u32 {
    2
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_rate_limit_max_retries() -> u32 {
    4
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            exponential: true,
            timeout_ms: default_timeout_ms(),
            rate_limit_max_retries: default_rate_limit_max_retries(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            exponential: self.exponential,
            timeout: Duration::from_millis(self.timeout_ms),
            rate_limit_max_retries: self.rate_limit_max_retries,
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }
}

/// Admission window for a rate-limited dependency
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_max_requests_per_window")]
    pub max_requests_per_window: u32,
    #[serde(default = "default_window_length_ms")]
    pub window_length_ms: u64,
    #[serde(default = "default_queue_rate_limit_retries")]
    pub rate_limit_retries: u32,
    #[serde(default = "default_queue_rate_limit_base_delay_ms")]
    pub rate_limit_base_delay_ms: u64,
}

fn default_max_requests_per_window() -> u32 {
    50
}

fn default_window_length_ms() -> u64 {
    60_000
}

fn default_queue_rate_limit_retries() -> u32 {
    3
}

fn default_queue_rate_limit_base_delay_ms() -> u64 {
    2_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_requests_per_window: default_max_requests_per_window(),
            window_length_ms: default_window_length_ms(),
            rate_limit_retries: default_queue_rate_limit_retries(),
            rate_limit_base_delay_ms: default_queue_rate_limit_base_delay_ms(),
        }
    }
}

impl QueueConfig {
    pub fn window_length(&self) -> Duration {
        Duration::from_millis(self.window_length_ms)
    }

    /// Short policy used inside the queue worker: only rate-limit errors are retried
    pub fn retry_policy(&self, timeout: Duration) -> RetryPolicy {
        RetryPolicy::rate_limit_only(
            self.rate_limit_retries,
            Duration::from_millis(self.rate_limit_base_delay_ms),
            timeout,
        )
    }
}

/// Hard ceiling on provider calls in flight during retrieval
pub const MAX_PERSPECTIVE_CONCURRENCY: usize = 3;

/// Pipeline stage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_max_perspectives")]
    pub max_perspectives: usize,
    #[serde(default = "default_perspective_concurrency")]
    pub perspective_concurrency: usize,
    #[serde(default = "default_perspective_stagger_ms")]
    pub perspective_stagger_ms: u64,
    #[serde(default = "default_max_sources")]
    pub max_sources: usize,
    #[serde(default = "default_follow_up_count")]
    pub follow_up_count: usize,
}

fn default_max_perspectives() -> usize {
    3
}

fn default_perspective_concurrency() -> usize {
    3
}

fn default_perspective_stagger_ms() -> u64 {
    500
}

fn default_max_sources() -> usize {
    10
}

fn default_follow_up_count() -> usize {
    3
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_perspectives: default_max_perspectives(),
            perspective_concurrency: default_perspective_concurrency(),
            perspective_stagger_ms: default_perspective_stagger_ms(),
            max_sources: default_max_sources(),
            follow_up_count: default_follow_up_count(),
        }
    }
}

/// Completion service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionConfig {
    #[serde(default = "default_completion_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_completion_model")]
    pub model: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_true")]
    pub rate_limited: bool,
}

fn default_completion_endpoint() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_completion_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_cache_capacity() -> u64 {
    500
}

fn default_cache_ttl_secs() -> u64 {
    3600
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            endpoint: default_completion_endpoint(),
            model: default_completion_model(),
            api_key_env: default_api_key_env(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            cache_capacity: default_cache_capacity(),
            cache_ttl_secs: default_cache_ttl_secs(),
            rate_limited: true,
        }
    }
}

/// Search provider selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Provider names in priority order
    #[serde(default = "default_providers")]
    pub providers: Vec<String>,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Providers whose calls are serialized through a rate-limited queue
    #[serde(default)]
    pub rate_limited: Vec<String>,
}

fn default_providers() -> Vec<String> {
    vec!["tavily".to_string(), "exa".to_string(), "brave".to_string()]
}

fn default_max_results() -> usize {
    8
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            providers: default_providers(),
            max_results: default_max_results(),
            rate_limited: Vec::new(),
        }
    }
}

impl SearchConfig {
    pub fn is_rate_limited(&self, provider: &str) -> bool {
        self.rate_limited.iter().any(|p| p.eq_ignore_ascii_case(provider))
    }
}

/// Core configuration for Sage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SageConfig {
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

impl SageConfig {
    /// Load configuration from an optional TOML file plus `SAGE__*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            tracing::info!("[CONFIG] Loading configuration from {}", path.display());
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(
                ::config::Environment::with_prefix("SAGE")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("search.providers")
                    .with_list_parse_key("search.rate_limited")
                    .try_parsing(true),
            )
            .build()?;

        let config: SageConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue.max_requests_per_window == 0 {
            return Err(SageError::Config(
                "queue.max_requests_per_window must be at least 1".to_string(),
            ));
        }
        if self.queue.window_length_ms == 0 {
            return Err(SageError::Config("queue.window_length_ms must be positive".to_string()));
        }
        if !(1..=MAX_PERSPECTIVE_CONCURRENCY).contains(&self.pipeline.perspective_concurrency) {
            return Err(SageError::Config(format!(
                "pipeline.perspective_concurrency must be between 1 and {}",
                MAX_PERSPECTIVE_CONCURRENCY
            )));
        }
        if self.retry.max_backoff_ms == 0 {
            return Err(SageError::Config("retry.max_backoff_ms must be positive".to_string()));
        }
        if self.retry.timeout_ms == 0 {
            return Err(SageError::Config("retry.timeout_ms must be positive".to_string()));
        }
        Ok(())
    }
}
