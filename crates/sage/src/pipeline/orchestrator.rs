use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{
    stages::{self, CompletionGate, StageContext},
    LogProgress, PipelineArtifact, PipelineError, PipelineEvent, PipelineResult, ProgressSink,
    StageName, StageStatus, Tier,
};
use crate::{
    completion::{completion_from_config, CompletionService},
    config::{PipelineConfig, SageConfig},
    health::HealthMonitor,
    queue::RateLimitedQueue,
    retry::RetryPolicy,
    search::ProviderFallbackSearch,
};

/// One question to answer
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRequest {
    pub query: String,
    pub tier: Tier,
}

impl PipelineRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            tier: Tier::Standard,
        }
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }
}

/// Sequences the pipeline stages over an immutable artifact
pub struct PipelineOrchestrator {
    completion: CompletionGate,
    search: Arc<ProviderFallbackSearch>,
    health: Arc<HealthMonitor>,
    config: PipelineConfig,
    progress: Arc<dyn ProgressSink>,
}

impl PipelineOrchestrator {
    /// `health` must be the same monitor the search engine was built with
    pub fn new(
        health: Arc<HealthMonitor>,
        completion: Arc<dyn CompletionService>,
        search: ProviderFallbackSearch,
    ) -> Self {
        Self {
            completion: CompletionGate::new(completion, health.clone(), RetryPolicy::default()),
            search: Arc::new(search),
            health,
            config: PipelineConfig::default(),
            progress: Arc::new(LogProgress),
        }
    }

    /// Wire every collaborator from configuration around a shared health monitor
    pub fn from_config(config: &SageConfig, health: Arc<HealthMonitor>) -> Self {
        let policy = config.retry.policy();
        let search = ProviderFallbackSearch::from_config(config, health.clone());
        let completion = completion_from_config(&config.completion);

        let mut orchestrator = Self::new(health, completion, search)
            .with_config(config.pipeline.clone())
            .with_retry_policy(policy.clone());

        if config.completion.rate_limited {
            orchestrator = orchestrator.with_completion_queue(RateLimitedQueue::from_config(
                stages::COMPLETION_SERVICE,
                &config.queue,
                policy.timeout,
            ));
        }

        orchestrator
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Retry policy for completion calls; search keeps its own
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.completion.set_policy(policy);
        self
    }

    /// Route completion calls through `queue`
    pub fn with_completion_queue(mut self, queue: RateLimitedQueue) -> Self {
        self.completion.set_queue(queue);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Search providers in fallback order
    pub fn provider_names(&self) -> Vec<&str> {
        self.search.provider_names()
    }

    /// Answer `query` at the standard tier
    pub async fn run(&self, query: &str) -> Result<PipelineResult, PipelineError> {
        self.run_with(PipelineRequest::new(query), &CancellationToken::new())
            .await
    }

    pub async fn run_with(
        &self,
        request: PipelineRequest,
        cancel: &CancellationToken,
    ) -> Result<PipelineResult, PipelineError> {
        self.run_artifact(request, cancel).await.map(PipelineResult::from)
    }

    /// Run every stage and return the terminal artifact, including its log.
    ///
    /// Fails only for an empty query or when `cancel` fires.
    pub async fn run_artifact(
        &self,
        request: PipelineRequest,
        cancel: &CancellationToken,
    ) -> Result<PipelineArtifact, PipelineError> {
        let query = request.query.trim();
        if query.is_empty() {
            return Err(PipelineError::InvalidQuery("query must not be empty".to_string()));
        }
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let ctx = StageContext {
            completion: &self.completion,
            search: &self.search,
            config: &self.config,
            progress: &self.progress,
            cancel,
        };

        let mut artifact = PipelineArtifact::new(query, request.tier);
        tracing::info!(
            "[PIPELINE] Run {} started: '{}' ({:?})",
            artifact.id,
            artifact.query,
            artifact.tier
        );

        for stage in StageName::ALL {
            artifact = artifact.with_stage_status(stage, StageStatus::InProgress);
            self.progress.on_event(&PipelineEvent::StageStarted { stage });
            tracing::debug!("[STAGE:{}] {}", stage.as_str(), stage.description());

            artifact = stages::run(&ctx, stage, artifact).await;

            if cancel.is_cancelled() {
                let artifact = artifact
                    .with_stage_status(stage, StageStatus::Error)
                    .logged(format!("{}: cancelled", stage.as_str()));
                tracing::info!(
                    "[PIPELINE] Run {} cancelled during {} ({} log lines)",
                    artifact.id,
                    stage.as_str(),
                    artifact.log.len()
                );
                return Err(PipelineError::Cancelled);
            }

            artifact = artifact.with_stage_status(stage, StageStatus::Complete);
            self.progress.on_event(&PipelineEvent::StageCompleted {
                stage,
                status: StageStatus::Complete,
                degraded: artifact.is_degraded(),
            });
        }

        let artifact = artifact.completed();
        self.progress.on_event(&PipelineEvent::Completed {
            degraded: artifact.is_degraded(),
            source_count: artifact.sources.len(),
        });
        tracing::info!(
            "[PIPELINE] Run {} complete in {}ms: {} sources, degraded={}",
            artifact.id,
            artifact.elapsed_ms().unwrap_or_default(),
            artifact.sources.len(),
            artifact.is_degraded()
        );

        Ok(artifact)
    }
}
