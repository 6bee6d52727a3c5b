//! Multi-stage answer pipeline
//!
//! Plan -> Retrieve (+ perspective fan-out for Pro) -> Write -> Format -> Deliver.
//! Environmental failures never escape: the caller always gets a fully
//! populated [`PipelineResult`], with `degraded` telling whether anything fell back.

mod artifact;
mod orchestrator;
mod progress;
mod stages;

use serde::{Deserialize, Serialize};
use ts_rs::TS;

pub use artifact::{
    PerspectiveSeed, PipelineArtifact, ResearchPlan, Retrieval, Source, StageName, StageStatus,
    Tier,
};
pub use orchestrator::{PipelineOrchestrator, PipelineRequest};
pub use progress::{BroadcastProgress, LogProgress, NoopProgress, PipelineEvent, ProgressSink};
pub use stages::COMPLETION_SERVICE;

use crate::search::{ImageResult, Perspective, VideoResult};

/// Errors `run` can return; environmental failures are absorbed instead
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Pipeline run cancelled")]
    Cancelled,
}

impl From<PipelineError> for crate::SageError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::InvalidQuery(message) => crate::SageError::InvalidQuery(message),
            PipelineError::Cancelled => crate::SageError::Cancelled,
        }
    }
}

/// Final answer handed to the caller; every field is always present
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResult {
    pub content: String,
    pub sources: Vec<Source>,
    pub images: Vec<ImageResult>,
    pub videos: Vec<VideoResult>,
    pub perspectives: Vec<Perspective>,
    pub follow_up_questions: Vec<String>,
    pub degraded: bool,
}

impl From<PipelineArtifact> for PipelineResult {
    fn from(artifact: PipelineArtifact) -> Self {
        Self {
            degraded: artifact.is_degraded(),
            content: artifact.content,
            sources: artifact.sources,
            images: artifact.images,
            videos: artifact.videos,
            perspectives: artifact.perspectives,
            follow_up_questions: artifact.follow_up_questions,
        }
    }
}
