//! The unit of work flowing through the orchestrator
//!
//! Every transition consumes the artifact and returns the next state. Fields
//! are readable directly, but `degraded` can only be raised, never cleared.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;
use uuid::Uuid;

use crate::search::{ImageResult, Perspective, SearchResult, VideoResult};

/// Longest snippet kept per source, in characters
pub const SNIPPET_MAX_CHARS: usize = 280;

/// Pipeline stage names, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    Plan,
    Retrieve,
    Write,
    Format,
    Deliver,
}

impl StageName {
    pub const ALL: [StageName; 5] = [
        StageName::Plan,
        StageName::Retrieve,
        StageName::Write,
        StageName::Format,
        StageName::Deliver,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageName::Plan => "plan",
            StageName::Retrieve => "retrieve",
            StageName::Write => "write",
            StageName::Format => "format",
            StageName::Deliver => "deliver",
        }
    }

    /// Human-readable status line shown while the stage runs
    pub fn description(&self) -> &'static str {
        match self {
            StageName::Plan => "Planning research approach...",
            StageName::Retrieve => "Searching the web...",
            StageName::Write => "Writing the answer...",
            StageName::Format => "Formatting the response...",
            StageName::Deliver => "Delivering results...",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    InProgress,
    Complete,
    Error,
}

/// Research depth requested by the caller
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Standard,
    /// Adds parallel perspective expansion during retrieval
    Pro,
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(Tier::Standard),
            "pro" => Ok(Tier::Pro),
            other => Err(format!("unknown tier '{other}', expected 'standard' or 'pro'")),
        }
    }
}

/// A cited source in the final answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

impl Source {
    fn from_result(result: &SearchResult) -> Self {
        Self {
            title: result.title.clone(),
            url: result.url.clone(),
            snippet: truncate_chars(&result.content, SNIPPET_MAX_CHARS),
        }
    }
}

/// An auxiliary search the planner wants run alongside the main query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerspectiveSeed {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub query: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResearchPlan {
    /// Query sent to the search providers for the main retrieval
    pub search_query: String,
    pub perspectives: Vec<PerspectiveSeed>,
}

/// Everything the Retrieve stage produced, merged in one step
#[derive(Debug, Clone, Default)]
pub struct Retrieval {
    pub results: Vec<SearchResult>,
    pub images: Vec<ImageResult>,
    pub videos: Vec<VideoResult>,
    pub perspectives: Vec<Perspective>,
}

#[derive(Debug, Clone)]
pub struct PipelineArtifact {
    pub id: Uuid,
    pub query: String,
    pub tier: Tier,
    pub status: StageStatus,
    pub stage_statuses: BTreeMap<StageName, StageStatus>,
    pub plan: ResearchPlan,
    pub results: Vec<SearchResult>,
    pub content: String,
    pub sources: Vec<Source>,
    pub images: Vec<ImageResult>,
    pub videos: Vec<VideoResult>,
    pub perspectives: Vec<Perspective>,
    pub follow_up_questions: Vec<String>,
    pub log: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    degraded: bool,
}

impl PipelineArtifact {
    pub fn new(query: &str, tier: Tier) -> Self {
        Self {
            id: Uuid::new_v4(),
            query: query.to_string(),
            tier,
            status: StageStatus::Pending,
            stage_statuses: StageName::ALL
                .iter()
                .map(|stage| (*stage, StageStatus::Pending))
                .collect(),
            plan: ResearchPlan {
                search_query: query.to_string(),
                perspectives: Vec::new(),
            },
            results: Vec::new(),
            content: String::new(),
            sources: Vec::new(),
            images: Vec::new(),
            videos: Vec::new(),
            perspectives: Vec::new(),
            follow_up_questions: Vec::new(),
            log: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
            degraded: false,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn stage_status(&self, stage: StageName) -> StageStatus {
        self.stage_statuses
            .get(&stage)
            .copied()
            .unwrap_or(StageStatus::Pending)
    }

    pub fn with_stage_status(mut self, stage: StageName, status: StageStatus) -> Self {
        self.stage_statuses.insert(stage, status);
        if status == StageStatus::InProgress {
            self.status = StageStatus::InProgress;
        }
        self
    }

    /// Append a line to the diagnostic trail
    pub fn logged(mut self, line: impl Into<String>) -> Self {
        self.log.push(line.into());
        self
    }

    /// Mark that fallback data was used somewhere; sticky for the rest of the run
    pub fn degraded(mut self, reason: impl Into<String>) -> Self {
        self.degraded = true;
        self.logged(reason)
    }

    pub fn with_plan(mut self, plan: ResearchPlan) -> Self {
        self.plan = plan;
        self
    }

    /// Merge retrieval output and rebuild the source list from it
    pub fn with_retrieval(mut self, retrieval: Retrieval, max_sources: usize) -> Self {
        self.sources = build_sources(&retrieval.results, &retrieval.perspectives, max_sources);
        self.results = retrieval.results;
        self.images = retrieval.images;
        self.videos = retrieval.videos;
        self.perspectives = retrieval.perspectives;
        self
    }

    pub fn with_content(mut self, content: String) -> Self {
        self.content = content;
        self
    }

    pub fn with_follow_up_questions(mut self, questions: Vec<String>) -> Self {
        self.follow_up_questions = questions;
        self
    }

    /// Terminal transition
    pub fn completed(mut self) -> Self {
        self.status = StageStatus::Complete;
        self.completed_at = Some(Utc::now());
        self
    }

    /// Wall-clock run time, once completed
    pub fn elapsed_ms(&self) -> Option<i64> {
        self.completed_at
            .map(|done| (done - self.started_at).num_milliseconds())
    }
}

/// Main results first, then perspective results; first occurrence of a URL wins
fn build_sources(results: &[SearchResult], perspectives: &[Perspective], max_sources: usize) -> Vec<Source> {
    let mut sources: Vec<Source> = Vec::new();
    let candidates = results
        .iter()
        .chain(perspectives.iter().flat_map(|p| p.results.iter()));

    for result in candidates {
        if sources.len() >= max_sources {
            break;
        }
        if sources.iter().any(|source| source.url == result.url) {
            continue;
        }
        sources.push(Source::from_result(result));
    }

    sources
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", text[..idx].trim_end()),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::hit;

    #[test]
    fn test_new_artifact_has_all_stages_pending() {
        let artifact = PipelineArtifact::new("What is AI?", Tier::Standard);
        assert_eq!(artifact.stage_statuses.len(), 5);
        assert!(StageName::ALL
            .iter()
            .all(|stage| artifact.stage_status(*stage) == StageStatus::Pending));
        assert_eq!(artifact.plan.search_query, "What is AI?");
        assert!(!artifact.is_degraded());
    }

    #[test]
    fn test_degraded_is_sticky() {
        let artifact = PipelineArtifact::new("q", Tier::Standard)
            .degraded("search fell back")
            .with_content("answer".to_string())
            .with_stage_status(StageName::Write, StageStatus::Complete)
            .completed();

        assert!(artifact.is_degraded());
        assert_eq!(artifact.log, vec!["search fell back"]);
        assert!(artifact.elapsed_ms().is_some_and(|ms| ms >= 0));
    }

    #[test]
    fn test_retrieval_merge_keeps_unrelated_fields() {
        let artifact = PipelineArtifact::new("q", Tier::Pro)
            .with_content("draft".to_string())
            .with_retrieval(
                Retrieval {
                    results: vec![hit("https://a")],
                    ..Default::default()
                },
                10,
            );

        assert_eq!(artifact.content, "draft");
        assert_eq!(artifact.sources.len(), 1);
    }

    #[test]
    fn test_sources_are_deduplicated_and_capped() {
        let perspectives = vec![Perspective {
            id: "p1".to_string(),
            title: "Angle".to_string(),
            description: String::new(),
            results: vec![hit("https://b"), hit("https://c"), hit("https://d")],
        }];
        let mut first_b = hit("https://b");
        first_b.title = "main b".to_string();

        let sources = build_sources(&[hit("https://a"), first_b], &perspectives, 3);
        let urls: Vec<&str> = sources.iter().map(|s| s.url.as_str()).collect();
        assert_eq!(urls, vec!["https://a", "https://b", "https://c"]);
        assert_eq!(sources[1].title, "main b");
    }

    #[test]
    fn test_snippet_truncation() {
        let mut long = hit("https://long");
        long.content = "é".repeat(400);
        let source = Source::from_result(&long);
        assert_eq!(source.snippet.chars().count(), SNIPPET_MAX_CHARS + 3);
        assert!(source.snippet.ends_with("..."));
    }

    #[test]
    fn test_tier_parsing() {
        assert_eq!("PRO".parse::<Tier>().unwrap(), Tier::Pro);
        assert_eq!("standard".parse::<Tier>().unwrap(), Tier::Standard);
        assert!("ultra".parse::<Tier>().is_err());
    }
}
