//! Ordered provider fallback
//!
//! Providers are tried strictly in priority order, one at a time. The first
//! provider that returns a non-empty result set wins and later providers are
//! never called. Providers whose circuit is open are skipped without a call.

use std::{fmt, sync::Arc};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::{providers_from_config, ImageResult, SearchProvider, SearchResponse, SearchResult, VideoResult};
use crate::{
    config::SageConfig,
    health::HealthMonitor,
    pipeline::{PipelineEvent, ProgressSink},
    queue::RateLimitedQueue,
    retry::{RetryError, RetryExecutor, RetryPolicy},
};

/// What happened when a provider was considered
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum AttemptOutcome {
    /// Circuit open, no call made
    Skipped,
    /// Call succeeded with zero results
    Empty,
    /// Call succeeded with this many results
    Succeeded(usize),
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderAttemptLog {
    pub provider: String,
    pub outcome: AttemptOutcome,
}

/// Result of one fallback search; never an error
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub results: Vec<SearchResult>,
    pub images: Vec<ImageResult>,
    pub videos: Vec<VideoResult>,
    pub used_provider: Option<String>,
    /// Set when every provider was exhausted, or any provider failed or was skipped first
    pub degraded: bool,
    pub log: Vec<ProviderAttemptLog>,
}

impl SearchOutcome {
    fn exhausted(log: Vec<ProviderAttemptLog>) -> Self {
        Self {
            degraded: true,
            log,
            ..Default::default()
        }
    }
}

struct ProviderSlot {
    provider: Arc<dyn SearchProvider>,
    queue: Option<RateLimitedQueue>,
}

enum CallError {
    Cancelled,
    Failed(String),
}

impl<E: fmt::Display> From<RetryError<E>> for CallError {
    fn from(err: RetryError<E>) -> Self {
        if err.is_cancelled() {
            CallError::Cancelled
        } else {
            CallError::Failed(err.to_string())
        }
    }
}

/// Searches an ordered provider list with health gating and per-call retry
pub struct ProviderFallbackSearch {
    providers: Vec<ProviderSlot>,
    health: Arc<HealthMonitor>,
    retry: RetryExecutor,
    queued_retry: RetryExecutor,
}

impl ProviderFallbackSearch {
    pub fn new(health: Arc<HealthMonitor>, policy: RetryPolicy) -> Self {
        Self {
            providers: Vec::new(),
            health,
            queued_retry: RetryExecutor::new(policy.for_queued_calls()),
            retry: RetryExecutor::new(policy),
        }
    }

    /// Append a provider at the lowest priority
    pub fn with_provider(mut self, provider: Arc<dyn SearchProvider>) -> Self {
        self.providers.push(ProviderSlot {
            provider,
            queue: None,
        });
        self
    }

    /// Append a provider whose calls go through `queue`
    pub fn with_queued_provider(mut self, provider: Arc<dyn SearchProvider>, queue: RateLimitedQueue) -> Self {
        self.providers.push(ProviderSlot {
            provider,
            queue: Some(queue),
        });
        self
    }

    pub fn from_config(config: &SageConfig, health: Arc<HealthMonitor>) -> Self {
        let policy = config.retry.policy();
        let timeout = policy.timeout;
        let mut search = Self::new(health, policy);

        for provider in providers_from_config(&config.search) {
            search = if config.search.is_rate_limited(provider.name()) {
                let queue = RateLimitedQueue::from_config(provider.name(), &config.queue, timeout);
                search.with_queued_provider(provider, queue)
            } else {
                search.with_provider(provider)
            };
        }

        search
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers.iter().map(|slot| slot.provider.name()).collect()
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Try providers in order until one returns results
    pub async fn search(
        &self,
        query: &str,
        cancel: &CancellationToken,
        progress: &dyn ProgressSink,
    ) -> SearchOutcome {
        let mut log = Vec::with_capacity(self.providers.len());
        let mut had_failure = false;

        for slot in &self.providers {
            let name = slot.provider.name();

            if cancel.is_cancelled() {
                log.push(ProviderAttemptLog {
                    provider: name.to_string(),
                    outcome: AttemptOutcome::Cancelled,
                });
                return SearchOutcome::exhausted(log);
            }

            if !self.health.is_healthy(name) {
                tracing::info!("[SEARCH] Skipping {} (circuit open)", name);
                progress.on_event(&PipelineEvent::ProviderSkipped {
                    provider: name.to_string(),
                });
                log.push(ProviderAttemptLog {
                    provider: name.to_string(),
                    outcome: AttemptOutcome::Skipped,
                });
                had_failure = true;
                continue;
            }

            progress.on_event(&PipelineEvent::ProviderAttempt {
                provider: name.to_string(),
                query: query.to_string(),
            });

            let outcome = match self.call(slot, query, cancel).await {
                Err(_) if cancel.is_cancelled() => Err(CallError::Cancelled),
                other => other,
            };

            match outcome {
                Ok(response) if response.has_results() => {
                    self.health.report_success(name);
                    tracing::info!(
                        "[SEARCH] {} returned {} results for '{}'",
                        name,
                        response.results.len(),
                        query
                    );
                    log.push(ProviderAttemptLog {
                        provider: name.to_string(),
                        outcome: AttemptOutcome::Succeeded(response.results.len()),
                    });
                    return SearchOutcome {
                        results: response.results,
                        images: response.images,
                        videos: response.videos,
                        used_provider: Some(name.to_string()),
                        degraded: had_failure,
                        log,
                    };
                }
                Ok(_) => {
                    self.health.report_success(name);
                    tracing::info!("[SEARCH] {} returned no results, trying next provider", name);
                    log.push(ProviderAttemptLog {
                        provider: name.to_string(),
                        outcome: AttemptOutcome::Empty,
                    });
                }
                Err(CallError::Cancelled) => {
                    log.push(ProviderAttemptLog {
                        provider: name.to_string(),
                        outcome: AttemptOutcome::Cancelled,
                    });
                    return SearchOutcome::exhausted(log);
                }
                Err(CallError::Failed(message)) => {
                    self.health.report_failure(name);
                    tracing::warn!("[SEARCH] {} failed: {}", name, message);
                    log.push(ProviderAttemptLog {
                        provider: name.to_string(),
                        outcome: AttemptOutcome::Failed(message),
                    });
                    had_failure = true;
                }
            }
        }

        tracing::warn!("[SEARCH] All providers exhausted for '{}'", query);
        SearchOutcome::exhausted(log)
    }

    async fn call(
        &self,
        slot: &ProviderSlot,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<SearchResponse, CallError> {
        let label = format!("search:{}", slot.provider.name());

        let Some(queue) = &slot.queue else {
            return self
                .retry
                .execute(&label, cancel, || slot.provider.query(query))
                .await
                .map_err(CallError::from);
        };

        let provider = slot.provider.clone();
        let text: Arc<str> = Arc::from(query);
        self.queued_retry
            .execute(&label, cancel, || {
                let provider = provider.clone();
                let text = text.clone();
                async move {
                    queue
                        .enqueue_with_cancel(cancel, move || {
                            let provider = provider.clone();
                            let text = text.clone();
                            async move { provider.query(&text).await }
                        })
                        .await
                }
            })
            .await
            .map_err(CallError::from)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        pipeline::NoopProgress,
        search::SearchError,
        testing::{response, ScriptedProvider},
    };

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(10),
            exponential: true,
            timeout: Duration::from_secs(1),
            rate_limit_max_retries: 1,
            max_backoff: Duration::from_secs(30),
        }
    }

    fn engine(health: &Arc<HealthMonitor>) -> ProviderFallbackSearch {
        ProviderFallbackSearch::new(health.clone(), fast_policy())
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_non_empty_provider_wins() {
        let health = Arc::new(HealthMonitor::new());
        let a = ScriptedProvider::returning("a", &[]);
        let b = ScriptedProvider::returning("b", &[]);
        let c = ScriptedProvider::returning("c", &["https://c.example"]);
        let d = ScriptedProvider::returning("d", &["https://d.example"]);

        let search = engine(&health)
            .with_provider(a.clone())
            .with_provider(b.clone())
            .with_provider(c.clone())
            .with_provider(d.clone());

        let outcome = search.search("rust", &CancellationToken::new(), &NoopProgress).await;

        assert_eq!(outcome.used_provider.as_deref(), Some("c"));
        assert_eq!(outcome.results[0].url, "https://c.example");
        assert!(!outcome.degraded);
        assert_eq!((a.calls(), b.calls(), c.calls(), d.calls()), (1, 1, 1, 0));
        assert_eq!(outcome.log[0].outcome, AttemptOutcome::Empty);

        // Empty answers are successes, not failures
        assert_eq!(health.record("a").unwrap().failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_providers_failing_yields_degraded_empty_outcome() {
        let health = Arc::new(HealthMonitor::new());
        let a = ScriptedProvider::failing("a", SearchError::Network("reset".into()));
        let b = ScriptedProvider::failing("b", SearchError::AuthError("bad key".into()));

        let search = engine(&health).with_provider(a.clone()).with_provider(b.clone());
        let outcome = search.search("rust", &CancellationToken::new(), &NoopProgress).await;

        assert!(outcome.results.is_empty());
        assert!(outcome.used_provider.is_none());
        assert!(outcome.degraded);
        // Retryable error gets one retry, auth error none
        assert_eq!(a.calls(), 2);
        assert_eq!(b.calls(), 1);
        assert_eq!(health.record("a").unwrap().failure_count, 1);
        assert_eq!(health.record("b").unwrap().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_day_long_retry_after_does_not_stall_search() {
        let health = Arc::new(HealthMonitor::new());
        let throttled = ScriptedProvider::failing(
            "throttled",
            SearchError::RateLimited {
                retry_after_ms: Some(86_400_000),
            },
        );
        let backup = ScriptedProvider::returning("backup", &["https://backup.example"]);

        let search = engine(&health).with_provider(throttled.clone()).with_provider(backup);
        let start = tokio::time::Instant::now();
        let outcome = search.search("rust", &CancellationToken::new(), &NoopProgress).await;

        assert_eq!(outcome.used_provider.as_deref(), Some("backup"));
        assert!(outcome.degraded);
        assert_eq!(throttled.calls(), 2);
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_after_failure_is_degraded() {
        let health = Arc::new(HealthMonitor::new());
        let a = ScriptedProvider::failing("a", SearchError::Parse("garbage".into()));
        let b = ScriptedProvider::returning("b", &["https://b.example"]);

        let search = engine(&health).with_provider(a).with_provider(b);
        let outcome = search.search("rust", &CancellationToken::new(), &NoopProgress).await;

        assert_eq!(outcome.used_provider.as_deref(), Some("b"));
        assert!(outcome.degraded);
        assert!(matches!(outcome.log[0].outcome, AttemptOutcome::Failed(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_is_skipped_without_a_call() {
        let health = Arc::new(HealthMonitor::new());
        for _ in 0..3 {
            health.report_failure("a");
        }
        let a = ScriptedProvider::returning("a", &["https://a.example"]);
        let b = ScriptedProvider::returning("b", &["https://b.example"]);

        let search = engine(&health).with_provider(a.clone()).with_provider(b);
        let outcome = search.search("rust", &CancellationToken::new(), &NoopProgress).await;

        assert_eq!(a.calls(), 0);
        assert_eq!(outcome.used_provider.as_deref(), Some("b"));
        assert!(outcome.degraded);
        assert_eq!(outcome.log[0].outcome, AttemptOutcome::Skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_discards_partial_work_and_counts_as_failure() {
        let health = Arc::new(HealthMonitor::new());
        let slow = ScriptedProvider::slow(
            "slow",
            Duration::from_secs(5),
            vec![Ok(response(&["https://late.example"]))],
        );
        let b = ScriptedProvider::returning("b", &["https://b.example"]);

        let search = engine(&health).with_provider(slow.clone()).with_provider(b);
        let outcome = search.search("rust", &CancellationToken::new(), &NoopProgress).await;

        assert_eq!(slow.calls(), 2);
        assert_eq!(outcome.used_provider.as_deref(), Some("b"));
        assert!(outcome.results.iter().all(|r| r.url != "https://late.example"));
        assert_eq!(health.record("slow").unwrap().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_providers() {
        let health = Arc::new(HealthMonitor::new());
        let outcome = engine(&health)
            .search("rust", &CancellationToken::new(), &NoopProgress)
            .await;
        assert!(outcome.results.is_empty());
        assert!(outcome.degraded);
        assert!(outcome.log.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_provider_retries_rate_limits_inside_queue() {
        let health = Arc::new(HealthMonitor::new());
        let limited = ScriptedProvider::new(
            "limited",
            vec![
                Err(SearchError::RateLimited { retry_after_ms: None }),
                Ok(response(&["https://limited.example"])),
            ],
        );
        let queue = RateLimitedQueue::new(
            "limited",
            10,
            Duration::from_secs(60),
            RetryPolicy::rate_limit_only(2, Duration::from_millis(100), Duration::from_secs(1)),
        );

        let search = engine(&health).with_queued_provider(limited.clone(), queue);
        let outcome = search.search("rust", &CancellationToken::new(), &NoopProgress).await;

        assert_eq!(outcome.used_provider.as_deref(), Some("limited"));
        assert!(!outcome.degraded);
        assert_eq!(limited.calls(), 2);
        let started = limited.started();
        assert_eq!(started[1] - started[0], Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_search_does_not_touch_health() {
        let health = Arc::new(HealthMonitor::new());
        let slow = ScriptedProvider::slow("slow", Duration::from_millis(500), vec![Ok(response(&[]))]);
        let search = engine(&health).with_provider(slow);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let outcome = search.search("rust", &cancel, &NoopProgress).await;
        assert_eq!(outcome.log[0].outcome, AttemptOutcome::Cancelled);
        assert_eq!(health.record("slow").unwrap().failure_count, 0);
    }
}
