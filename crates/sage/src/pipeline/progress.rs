//! Progress notifications
//!
//! Fire-and-forget: a sink must never block or fail the pipeline.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use ts_rs::TS;

use super::{StageName, StageStatus};

/// Events emitted while a pipeline runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TS)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PipelineEvent {
    #[serde(rename_all = "camelCase")]
    StageStarted { stage: StageName },

    #[serde(rename_all = "camelCase")]
    StageCompleted {
        stage: StageName,
        status: StageStatus,
        degraded: bool,
    },

    #[serde(rename_all = "camelCase")]
    ProviderAttempt { provider: String, query: String },

    #[serde(rename_all = "camelCase")]
    ProviderSkipped { provider: String },

    #[serde(rename_all = "camelCase")]
    Status { message: String },

    #[serde(rename_all = "camelCase")]
    Completed { degraded: bool, source_count: usize },
}

impl PipelineEvent {
    pub fn message(&self) -> String {
        match self {
            PipelineEvent::StageStarted { stage } => stage.description().to_string(),
            PipelineEvent::StageCompleted { stage, degraded, .. } => {
                if *degraded {
                    format!("{} finished with fallbacks", stage.as_str())
                } else {
                    format!("{} finished", stage.as_str())
                }
            }
            PipelineEvent::ProviderAttempt { provider, .. } => format!("Searching {provider}..."),
            PipelineEvent::ProviderSkipped { provider } => {
                format!("Skipping {provider} (temporarily unavailable)")
            }
            PipelineEvent::Status { message } => message.clone(),
            PipelineEvent::Completed { source_count, .. } => {
                format!("Done ({source_count} sources)")
            }
        }
    }
}

/// Receiver of human-readable status updates
pub trait ProgressSink: Send + Sync {
    fn on_status_update(&self, message: &str);

    /// Typed hook; the default forwards the rendered message
    fn on_event(&self, event: &PipelineEvent) {
        self.on_status_update(&event.message());
    }
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {
    fn on_status_update(&self, _message: &str) {}

    fn on_event(&self, _event: &PipelineEvent) {}
}

/// Writes status updates to the tracing log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn on_status_update(&self, message: &str) {
        tracing::info!("[PIPELINE] {}", message);
    }
}

/// Fans events out to any number of subscribers
#[derive(Debug, Clone)]
pub struct BroadcastProgress {
    sender: broadcast::Sender<PipelineEvent>,
}

impl BroadcastProgress {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastProgress {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl ProgressSink for BroadcastProgress {
    fn on_status_update(&self, message: &str) {
        self.on_event(&PipelineEvent::Status {
            message: message.to_string(),
        });
    }

    fn on_event(&self, event: &PipelineEvent) {
        // No subscribers is not an error
        let _ = self.sender.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recording(Mutex<Vec<String>>);

    impl ProgressSink for Recording {
        fn on_status_update(&self, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    #[test]
    fn test_default_event_hook_renders_message() {
        let sink = Recording::default();
        sink.on_event(&PipelineEvent::StageStarted {
            stage: StageName::Retrieve,
        });
        sink.on_event(&PipelineEvent::ProviderSkipped {
            provider: "exa".to_string(),
        });

        let messages = sink.0.lock().unwrap();
        assert_eq!(messages[0], "Searching the web...");
        assert_eq!(messages[1], "Skipping exa (temporarily unavailable)");
    }

    #[tokio::test]
    async fn test_broadcast_delivers_typed_events() {
        let progress = BroadcastProgress::new(16);
        let mut rx = progress.subscribe();

        progress.on_event(&PipelineEvent::StageStarted {
            stage: StageName::Plan,
        });
        progress.on_status_update("hello");

        assert_eq!(
            rx.recv().await.unwrap(),
            PipelineEvent::StageStarted {
                stage: StageName::Plan
            }
        );
        assert_eq!(
            rx.recv().await.unwrap(),
            PipelineEvent::Status {
                message: "hello".to_string()
            }
        );
    }

    #[test]
    fn test_broadcast_without_subscribers_is_silent() {
        let progress = BroadcastProgress::default();
        progress.on_status_update("nobody listening");
        assert_eq!(progress.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = PipelineEvent::Completed {
            degraded: true,
            source_count: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "completed");
        assert_eq!(json["sourceCount"], 2);
    }
}
