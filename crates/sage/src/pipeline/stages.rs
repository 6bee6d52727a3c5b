//! Stage implementations
//!
//! Each stage is `(context, artifact) -> artifact`. A stage never fails: when
//! its collaborator is unavailable or answers with garbage it substitutes a
//! fallback payload, marks the artifact degraded and logs why.

use std::{fmt, sync::Arc, time::Duration};

use serde::Deserialize;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    artifact::{PerspectiveSeed, ResearchPlan, Retrieval},
    PipelineArtifact, ProgressSink, StageName, Tier,
};
use crate::{
    completion::{truncate, Completion, CompletionError, CompletionRequest, CompletionService},
    config::{PipelineConfig, MAX_PERSPECTIVE_CONCURRENCY},
    health::HealthMonitor,
    queue::{QueueError, RateLimitedQueue},
    retry::{RetryError, RetryExecutor, RetryPolicy},
    search::{Perspective, ProviderFallbackSearch, SearchOutcome},
};

/// Health-tracking key for the completion service
pub const COMPLETION_SERVICE: &str = "completion";

const PLAN_SYSTEM_PROMPT: &str = "You plan web research. Reply with a JSON object \
{\"searchQuery\": string, \"perspectives\": [{\"title\": string, \"description\": string, \"query\": string}]}. \
The searchQuery is a concise web search for the user's question. Each perspective is a distinct \
angle on the question with its own search query.";

const WRITE_SYSTEM_PROMPT: &str = "You answer questions using the numbered sources provided. \
Write a clear, well-structured answer in Markdown. Cite sources inline as [n]. \
If the sources are insufficient, say so and answer from general knowledge.";

const FOLLOW_UP_SYSTEM_PROMPT: &str = "You suggest follow-up questions. Reply with a JSON object \
{\"questions\": [string]} containing short questions a curious reader might ask next.";

const SOURCE_PROMPT_CHARS: usize = 1_000;

/// Why a guarded call produced nothing
#[derive(Debug)]
pub(crate) enum CallFailure {
    CircuitOpen,
    /// No backend is configured; not an outage
    NotConfigured,
    Cancelled,
    Failed(String),
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallFailure::CircuitOpen => write!(f, "completion service temporarily unavailable"),
            CallFailure::NotConfigured => write!(f, "completion service not configured"),
            CallFailure::Cancelled => write!(f, "cancelled"),
            CallFailure::Failed(message) => write!(f, "{message}"),
        }
    }
}

impl<E: fmt::Display> From<RetryError<E>> for CallFailure {
    fn from(err: RetryError<E>) -> Self {
        if err.is_cancelled() {
            CallFailure::Cancelled
        } else {
            CallFailure::Failed(err.to_string())
        }
    }
}

/// Completion service behind the circuit breaker, retry, and optional queue
pub(crate) struct CompletionGate {
    service: Arc<dyn CompletionService>,
    queue: Option<RateLimitedQueue>,
    health: Arc<HealthMonitor>,
    retry: RetryExecutor,
    queued_retry: RetryExecutor,
}

impl CompletionGate {
    pub(crate) fn new(service: Arc<dyn CompletionService>, health: Arc<HealthMonitor>, policy: RetryPolicy) -> Self {
        Self {
            service,
            queue: None,
            health,
            queued_retry: RetryExecutor::new(policy.for_queued_calls()),
            retry: RetryExecutor::new(policy),
        }
    }

    pub(crate) fn set_queue(&mut self, queue: RateLimitedQueue) {
        self.queue = Some(queue);
    }

    pub(crate) fn set_policy(&mut self, policy: RetryPolicy) {
        self.queued_retry = RetryExecutor::new(policy.for_queued_calls());
        self.retry = RetryExecutor::new(policy);
    }

    pub(crate) async fn complete(
        &self,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Completion, CallFailure> {
        if !self.health.is_healthy(COMPLETION_SERVICE) {
            return Err(CallFailure::CircuitOpen);
        }

        let label = format!("{}:{}", COMPLETION_SERVICE, request.kind);
        let outcome = match &self.queue {
            None => self
                .retry
                .execute(&label, cancel, || self.service.complete(request.clone()))
                .await
                .map_err(|err| {
                    if matches!(err.last_error(), Some(CompletionError::NotConfigured)) {
                        CallFailure::NotConfigured
                    } else {
                        CallFailure::from(err)
                    }
                }),
            Some(queue) => {
                let service = self.service.clone();
                let request = Arc::new(request);
                self.queued_retry
                    .execute(&label, cancel, || {
                        let service = service.clone();
                        let request = request.clone();
                        async move {
                            queue
                                .enqueue_with_cancel(cancel, move || {
                                    let service = service.clone();
                                    let request = CompletionRequest::clone(&request);
                                    async move { service.complete(request).await }
                                })
                                .await
                        }
                    })
                    .await
                    .map_err(|err| {
                        let not_configured = matches!(
                            err.last_error(),
                            Some(QueueError::Retry(inner))
                                if matches!(inner.last_error(), Some(CompletionError::NotConfigured))
                        );
                        if not_configured {
                            CallFailure::NotConfigured
                        } else {
                            CallFailure::from(err)
                        }
                    })
            }
        };

        match outcome {
            Ok(completion) => {
                self.health.report_success(COMPLETION_SERVICE);
                Ok(completion)
            }
            Err(_) if cancel.is_cancelled() => Err(CallFailure::Cancelled),
            Err(CallFailure::Cancelled) => Err(CallFailure::Cancelled),
            Err(CallFailure::NotConfigured) => {
                tracing::debug!("[COMPLETION] {} skipped: no completion backend configured", label);
                Err(CallFailure::NotConfigured)
            }
            Err(failure) => {
                self.health.report_failure(COMPLETION_SERVICE);
                Err(failure)
            }
        }
    }
}

/// Borrowed collaborators for one pipeline run
pub(crate) struct StageContext<'a> {
    pub completion: &'a CompletionGate,
    pub search: &'a Arc<ProviderFallbackSearch>,
    pub config: &'a PipelineConfig,
    pub progress: &'a Arc<dyn ProgressSink>,
    pub cancel: &'a CancellationToken,
}

/// Dispatch one stage; `Deliver` has no work of its own
pub(crate) async fn run(ctx: &StageContext<'_>, stage: StageName, artifact: PipelineArtifact) -> PipelineArtifact {
    match stage {
        StageName::Plan => plan(ctx, artifact).await,
        StageName::Retrieve => retrieve(ctx, artifact).await,
        StageName::Write => write(ctx, artifact).await,
        StageName::Format => format(ctx, artifact).await,
        StageName::Deliver => artifact,
    }
}

fn note(artifact: PipelineArtifact, stage: StageName, line: impl fmt::Display) -> PipelineArtifact {
    tracing::info!("[STAGE:{}] {}", stage.as_str(), line);
    artifact.logged(format!("{}: {}", stage.as_str(), line))
}

fn fall_back(artifact: PipelineArtifact, stage: StageName, reason: impl fmt::Display) -> PipelineArtifact {
    tracing::warn!("[STAGE:{}] Using fallback: {}", stage.as_str(), reason);
    artifact.degraded(format!("{}: fallback used ({})", stage.as_str(), reason))
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlanResponse {
    #[serde(default)]
    search_query: String,
    #[serde(default)]
    perspectives: Vec<PerspectiveSeed>,
}

pub(crate) async fn plan(ctx: &StageContext<'_>, artifact: PipelineArtifact) -> PipelineArtifact {
    let wanted = match artifact.tier {
        Tier::Pro => ctx.config.max_perspectives,
        Tier::Standard => 0,
    };

    let request = CompletionRequest::new(
        "plan",
        PLAN_SYSTEM_PROMPT,
        format!(
            "Question: {}\n\nReturn at most {} perspectives.",
            artifact.query, wanted
        ),
    )
    .json();

    let parsed = match ctx.completion.complete(request, ctx.cancel).await {
        Ok(completion) => completion
            .parse_json::<PlanResponse>()
            .map_err(|e| CallFailure::Failed(e.to_string())),
        Err(failure) => Err(failure),
    };

    match parsed {
        Ok(response) => {
            let search_query = match response.search_query.trim() {
                "" => artifact.query.clone(),
                query => query.to_string(),
            };
            let perspectives: Vec<PerspectiveSeed> = response
                .perspectives
                .into_iter()
                .filter(|seed| !seed.title.trim().is_empty() && !seed.query.trim().is_empty())
                .take(wanted)
                .collect();

            if wanted > 0 && perspectives.is_empty() {
                let plan = ResearchPlan {
                    perspectives: default_perspectives(&artifact.query, wanted),
                    search_query,
                };
                return fall_back(artifact.with_plan(plan), StageName::Plan, "planner suggested no perspectives");
            }

            let line = format!(
                "searching for '{}' with {} perspectives",
                search_query,
                perspectives.len()
            );
            note(
                artifact.with_plan(ResearchPlan {
                    search_query,
                    perspectives,
                }),
                StageName::Plan,
                line,
            )
        }
        Err(CallFailure::Cancelled) => artifact,
        Err(failure) => {
            let plan = ResearchPlan {
                search_query: artifact.query.clone(),
                perspectives: default_perspectives(&artifact.query, wanted),
            };
            fall_back(artifact.with_plan(plan), StageName::Plan, failure)
        }
    }
}

/// Deterministic angles used when the planner is unavailable
pub(crate) fn default_perspectives(query: &str, count: usize) -> Vec<PerspectiveSeed> {
    let angles = [
        ("Background", "History and context", "history and background"),
        ("Recent developments", "What changed lately", "latest developments"),
        ("Debate", "Criticism and open questions", "criticism and challenges"),
        ("Applications", "How it is used in practice", "real-world applications"),
        ("Comparisons", "How it relates to alternatives", "compared to alternatives"),
    ];

    angles
        .iter()
        .take(count)
        .map(|(title, description, suffix)| PerspectiveSeed {
            title: title.to_string(),
            description: description.to_string(),
            query: format!("{query} {suffix}"),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Retrieve
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Expansion {
    perspectives: Vec<Perspective>,
    problems: Vec<String>,
}

pub(crate) async fn retrieve(ctx: &StageContext<'_>, artifact: PipelineArtifact) -> PipelineArtifact {
    let seeds = match artifact.tier {
        Tier::Pro => artifact
            .plan
            .perspectives
            .iter()
            .take(ctx.config.max_perspectives)
            .cloned()
            .collect(),
        Tier::Standard => Vec::new(),
    };

    // Main query first; the fan-out then owns every in-flight slot
    let main = ctx
        .search
        .search(&artifact.plan.search_query, ctx.cancel, ctx.progress.as_ref())
        .await;
    let expansion = if ctx.cancel.is_cancelled() {
        Expansion::default()
    } else {
        expand_perspectives(ctx, seeds).await
    };

    let mut artifact = note(
        artifact,
        StageName::Retrieve,
        format!(
            "{} results from {}",
            main.results.len(),
            main.used_provider.as_deref().unwrap_or("no provider")
        ),
    );
    if main.degraded && !ctx.cancel.is_cancelled() {
        artifact = fall_back(artifact, StageName::Retrieve, describe_search(&main));
    }
    for problem in expansion.problems {
        artifact = fall_back(artifact, StageName::Retrieve, problem);
    }

    let retrieval = Retrieval {
        results: main.results,
        images: main.images,
        videos: main.videos,
        perspectives: expansion.perspectives,
    };
    artifact.with_retrieval(retrieval, ctx.config.max_sources)
}

fn describe_search(outcome: &SearchOutcome) -> String {
    if outcome.log.is_empty() {
        return "no search providers available".to_string();
    }
    let attempts: Vec<String> = outcome
        .log
        .iter()
        .map(|entry| format!("{} {:?}", entry.provider, entry.outcome))
        .collect();
    format!("search degraded [{}]", attempts.join(", "))
}

/// Run one fallback search per seed: staggered starts, bounded concurrency
async fn expand_perspectives(ctx: &StageContext<'_>, seeds: Vec<PerspectiveSeed>) -> Expansion {
    let mut expansion = Expansion::default();
    if seeds.is_empty() {
        return expansion;
    }

    let concurrency = ctx
        .config
        .perspective_concurrency
        .clamp(1, MAX_PERSPECTIVE_CONCURRENCY);
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let stagger = Duration::from_millis(ctx.config.perspective_stagger_ms);

    tracing::info!(
        "[STAGE:retrieve] Expanding {} perspectives ({} at a time)",
        seeds.len(),
        concurrency
    );

    let mut handles = Vec::with_capacity(seeds.len());
    for (index, seed) in seeds.into_iter().enumerate() {
        let semaphore = semaphore.clone();
        let search = ctx.search.clone();
        let progress = ctx.progress.clone();
        let cancel = ctx.cancel.clone();
        let delay = stagger.saturating_mul(index as u32);

        handles.push(tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
            let _permit = semaphore.acquire_owned().await.ok()?;
            let outcome = search.search(&seed.query, &cancel, progress.as_ref()).await;
            Some((seed, outcome))
        }));
    }

    for handle in handles {
        match handle.await {
            Ok(Some((seed, outcome))) => {
                if outcome.degraded && !ctx.cancel.is_cancelled() {
                    expansion
                        .problems
                        .push(format!("perspective '{}': {}", seed.title, describe_search(&outcome)));
                }
                expansion.perspectives.push(Perspective {
                    id: Uuid::new_v4().to_string(),
                    title: seed.title,
                    description: seed.description,
                    results: outcome.results,
                });
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!("[STAGE:retrieve] Perspective task failed: {}", e);
                expansion.problems.push(format!("perspective task failed: {e}"));
            }
        }
    }

    expansion
}

// ---------------------------------------------------------------------------
// Write
// ---------------------------------------------------------------------------

pub(crate) async fn write(ctx: &StageContext<'_>, artifact: PipelineArtifact) -> PipelineArtifact {
    let request = CompletionRequest::new("write", WRITE_SYSTEM_PROMPT, write_prompt(&artifact));

    match ctx.completion.complete(request, ctx.cancel).await {
        Ok(completion) if !completion.text.trim().is_empty() => {
            let content = completion.text.trim().to_string();
            let line = format!("wrote {} characters", content.chars().count());
            note(artifact.with_content(content), StageName::Write, line)
        }
        Ok(_) => {
            let content = fallback_content(&artifact);
            fall_back(artifact.with_content(content), StageName::Write, "empty answer")
        }
        Err(CallFailure::Cancelled) => {
            let content = fallback_content(&artifact);
            artifact.with_content(content)
        }
        Err(failure) => {
            let content = fallback_content(&artifact);
            fall_back(artifact.with_content(content), StageName::Write, failure)
        }
    }
}

fn write_prompt(artifact: &PipelineArtifact) -> String {
    let mut prompt = format!("Question: {}\n\nSources:\n", artifact.query);

    if artifact.results.is_empty() && artifact.perspectives.is_empty() {
        prompt.push_str("(none found)\n");
    }
    for (i, result) in artifact.results.iter().enumerate() {
        prompt.push_str(&format!(
            "[{}] {} ({})\n{}\n\n",
            i + 1,
            result.title,
            result.url,
            truncate(&result.content, SOURCE_PROMPT_CHARS)
        ));
    }

    for perspective in &artifact.perspectives {
        prompt.push_str(&format!(
            "\nPerspective: {} - {}\n",
            perspective.title, perspective.description
        ));
        for result in &perspective.results {
            prompt.push_str(&format!(
                "- {} ({}): {}\n",
                result.title,
                result.url,
                truncate(&result.content, SOURCE_PROMPT_CHARS / 2)
            ));
        }
    }

    prompt
}

/// Answer assembled from sources alone, or a static notice when there are none
pub(crate) fn fallback_content(artifact: &PipelineArtifact) -> String {
    if artifact.sources.is_empty() {
        return format!(
            "I couldn't gather information about \"{}\" right now. \
             The search and writing services are temporarily unavailable; please try again shortly.",
            artifact.query
        );
    }

    let mut content = format!("Here is what I found about \"{}\":\n\n", artifact.query);
    for (i, source) in artifact.sources.iter().enumerate() {
        content.push_str(&format!(
            "{}. **{}**: {} ({})\n",
            i + 1,
            source.title,
            source.snippet,
            source.url
        ));
    }
    content
}

// ---------------------------------------------------------------------------
// Format
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FollowUpResponse {
    #[serde(default)]
    questions: Vec<String>,
}

pub(crate) async fn format(ctx: &StageContext<'_>, artifact: PipelineArtifact) -> PipelineArtifact {
    let content = tidy(&artifact.content);
    let artifact = if content.is_empty() {
        let fallback = fallback_content(&artifact);
        fall_back(artifact.with_content(fallback), StageName::Format, "content was blank")
    } else {
        artifact.with_content(content)
    };

    let count = ctx.config.follow_up_count;
    if count == 0 {
        return artifact.with_follow_up_questions(Vec::new());
    }

    let request = CompletionRequest::new(
        "follow_up",
        FOLLOW_UP_SYSTEM_PROMPT,
        format!(
            "Question: {}\n\nAnswer:\n{}\n\nSuggest {} follow-up questions.",
            artifact.query,
            truncate(&artifact.content, 2_000),
            count
        ),
    )
    .json();

    let (questions, problem) = match ctx.completion.complete(request, ctx.cancel).await {
        Ok(completion) => match completion.parse_json::<FollowUpResponse>() {
            Ok(response) => match normalize_questions(response.questions, count) {
                questions if questions.is_empty() => (Vec::new(), Some("no follow-up questions returned".to_string())),
                questions => (questions, None),
            },
            Err(e) => (
                normalize_questions(questions_from_text(&completion.text), count),
                Some(format!("follow-ups were not JSON ({e})")),
            ),
        },
        Err(CallFailure::Cancelled) => return artifact,
        Err(failure) => (Vec::new(), Some(failure.to_string())),
    };

    match problem {
        None => {
            let line = format!("{} follow-up questions", questions.len());
            note(artifact.with_follow_up_questions(questions), StageName::Format, line)
        }
        Some(problem) => {
            let questions = if questions.is_empty() {
                default_follow_ups(&artifact.query, count)
            } else {
                questions
            };
            fall_back(artifact.with_follow_up_questions(questions), StageName::Format, problem)
        }
    }
}

/// Trim and collapse runs of blank lines
fn tidy(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    let mut blank_run = 0;
    for line in content.trim().lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim_end().to_string()
}

fn normalize_questions(questions: Vec<String>, count: usize) -> Vec<String> {
    let mut normalized: Vec<String> = Vec::new();
    for question in questions {
        let question = question.trim().to_string();
        if question.is_empty()
            || normalized
                .iter()
                .any(|existing| existing.eq_ignore_ascii_case(&question))
        {
            continue;
        }
        normalized.push(question);
        if normalized.len() == count {
            break;
        }
    }
    normalized
}

/// Best effort for non-JSON answers: lines that end in a question mark
fn questions_from_text(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| {
            line.trim()
                .trim_start_matches(|c: char| c.is_ascii_digit() || matches!(c, '-' | '*' | '.' | ')' | ' '))
                .to_string()
        })
        .filter(|line| line.ends_with('?'))
        .collect()
}

pub(crate) fn default_follow_ups(query: &str, count: usize) -> Vec<String> {
    let topic = query.trim().trim_end_matches('?');
    [
        format!("What are the latest developments in {topic}?"),
        format!("What are the main challenges related to {topic}?"),
        format!("How does {topic} compare to the alternatives?"),
        format!("Where can I learn more about {topic}?"),
        format!("Who are the key people and organizations behind {topic}?"),
    ]
    .into_iter()
    .take(count)
    .collect()
}
