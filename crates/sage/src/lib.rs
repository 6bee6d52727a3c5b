//! # Sage - Resilient Answer Engine
//!
//! Answers a user query by composing results from several independently unreliable
//! services (a completion service and multiple web-search providers) into one
//! best-effort response. The crate is the resilience and orchestration core:
//! circuit breakers, bounded retries, rate-limited queues, ordered provider
//! fallback, and a multi-stage pipeline that never fails for environmental reasons.

pub mod completion;
pub mod config;
pub mod health;
pub mod pipeline;
pub mod queue;
pub mod retry;
pub mod search;

#[cfg(test)]
pub(crate) mod testing;

pub use completion::{
    completion_from_config, CachedCompletion, Completion, CompletionError, CompletionOptions,
    CompletionRequest, CompletionService, DisabledCompletion, OpenAiCompletion,
};
pub use config::SageConfig;
pub use health::{HealthMonitor, ServiceHealthRecord, ServiceHealthSnapshot};
pub use pipeline::{
    BroadcastProgress, LogProgress, NoopProgress, PipelineArtifact, PipelineError, PipelineEvent,
    PipelineOrchestrator, PipelineRequest, PipelineResult, ProgressSink, Source, StageName,
    StageStatus, Tier,
};
pub use queue::{QueueError, RateLimitedQueue};
pub use retry::{AttemptError, Classify, FailureClass, RetryError, RetryExecutor, RetryPolicy};
pub use search::{
    providers_from_config, BraveSearch, ExaSearch, ImageResult, Perspective, ProviderFallbackSearch,
    SearchError, SearchOutcome, SearchProvider, SearchResponse, SearchResult, TavilySearch,
    VideoResult,
};

/// Main error type for Sage operations outside the pipeline's absorbing boundary
#[derive(Debug, thiserror::Error)]
pub enum SageError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<::config::ConfigError> for SageError {
    fn from(err: ::config::ConfigError) -> Self {
        SageError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SageError>;
