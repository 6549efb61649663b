//! Prism Analysis - stage handlers and runtime wiring
//!
//! Binds the batch engine from `prism_pipeline` to concrete capabilities:
//!
//! - Label detection on uploaded images (Rekognition)
//! - Speech synthesis describing the most confident label (Polly)
//! - Consolidation of labels and audio into one public summary
//! - Synchronous sentiment scoring of feedback (Comprehend)
//!
//! Notifications arrive through SQS queues subscribed to bucket events, one
//! queue per triggered stage. Feedback is served over HTTP.

pub mod api;
pub mod aws_capabilities;
pub mod capabilities;
pub mod config;
pub mod notification_consumer;
pub mod s3_store;
pub mod stages;
pub mod status_store;

pub use api::{create_router, start_api_server, AppState};
pub use capabilities::{LabelDetector, SentimentAnalyzer, SpeechSynthesizer};
pub use config::Config;
pub use notification_consumer::{MessageQueue, NotificationConsumer, SqsQueue};
pub use s3_store::S3ObjectStore;
pub use stages::{
    AnalyzeSentimentStage, ConsolidateSummaryStage, DetectLabelsStage, NotificationStage,
    StageContext, SynthesizeSpeechStage,
};
pub use status_store::PgStatusStore;
