//! Stage handlers.
//!
//! Notification-triggered stages implement `RecordHandler` and rendezvous on
//! the base identifier of the object that triggered them. Sentiment analysis is
//! invoked synchronously from the API.

pub mod analyze_sentiment;
pub mod consolidate_summary;
pub mod detect_labels;
pub mod synthesize_speech;

pub use analyze_sentiment::{AnalyzeSentimentStage, FeedbackRequest, FeedbackResponse};
pub use consolidate_summary::{ConsolidateSummaryStage, SummaryRecord};
pub use detect_labels::DetectLabelsStage;
pub use synthesize_speech::SynthesizeSpeechStage;

use prism_pipeline::{
    require_status, CancellationToken, Keyspace, ObjectGateway, Partition, PipelineError,
    PipelineStatus, Result, StatusStore,
};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

/// Collaborators shared by every stage
#[derive(Clone)]
pub struct StageContext {
    pub gateway: ObjectGateway,
    pub keyspace: Keyspace,
    /// Lifecycle tracking; stages fall back to object presence without it
    pub status: Option<Arc<dyn StatusStore>>,
}

impl StageContext {
    pub fn new(
        gateway: ObjectGateway,
        keyspace: Keyspace,
        status: Option<Arc<dyn StatusStore>>,
    ) -> Self {
        Self {
            gateway,
            keyspace,
            status,
        }
    }

    /// Fail with `NotReady` unless `base_id` has reached `required`
    pub async fn require(&self, base_id: &str, required: PipelineStatus) -> Result<()> {
        if let Some(store) = &self.status {
            require_status(store.as_ref(), base_id, required).await?;
        }
        Ok(())
    }

    /// Record that `base_id` reached `status`
    pub async fn advance(&self, base_id: &str, status: PipelineStatus) -> Result<()> {
        if let Some(store) = &self.status {
            let record = store.advance(base_id, status).await?;
            debug!(base_id = %base_id, status = %record.status, "Status advanced");
        }
        Ok(())
    }
}

/// A stage triggered by object creations under one partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationStage {
    DetectLabels,
    SynthesizeSpeech,
    ConsolidateSummary,
}

impl NotificationStage {
    pub const ALL: [NotificationStage; 3] = [
        NotificationStage::DetectLabels,
        NotificationStage::SynthesizeSpeech,
        NotificationStage::ConsolidateSummary,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            NotificationStage::DetectLabels => "detect-labels",
            NotificationStage::SynthesizeSpeech => "synthesize-speech",
            NotificationStage::ConsolidateSummary => "consolidate-summary",
        }
    }

    /// Partition whose creations trigger this stage
    pub fn trigger(&self) -> Partition {
        match self {
            NotificationStage::DetectLabels => Partition::Uploads,
            NotificationStage::SynthesizeSpeech => Partition::RekognitionArtifacts,
            NotificationStage::ConsolidateSummary => Partition::PollyArtifacts,
        }
    }
}

impl fmt::Display for NotificationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Run `fut` unless `cancel` fires first
pub(crate) async fn until_cancelled<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::Cancelled),
        result = fut => result,
    }
}

pub(crate) fn observe_stage<T>(stage: &'static str, started: Instant, result: &Result<T>) {
    let outcome = if result.is_ok() { "ok" } else { "error" };
    metrics::histogram!(
        "analysis.stage.duration_seconds",
        "stage" => stage,
        "outcome" => outcome
    )
    .record(started.elapsed().as_secs_f64());
}
