//! Prism Pipeline - batch fan-out and partitioned addressing for staged analysis
//!
//! Uploaded artifacts move through independently triggered stages. Each stage
//! receives a batch of change notifications, handles every record in parallel
//! and writes its output into a partition of the shared bucket under the same
//! base identifier. This crate provides the pieces every stage shares:
//!
//! - Base identifier extraction and partitioned paths
//! - A gateway over the object store with JSON and tagging helpers
//! - The batch engine that fans records out and aggregates their outcomes
//! - A TTL cache for external configuration parameters
//! - The lifecycle status model
//!
//! # Example
//!
//! ```rust,no_run
//! use prism_pipeline::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let engine = BatchEngine::new(BatchConfig::default());
//!     let handler = Arc::new(FnHandler::new(|_cancel, n: ChangeNotification| async move {
//!         Ok(n.base_identifier().to_string())
//!     }));
//!
//!     let batch = vec![ChangeNotification::new("bucket", "uploads/req-1.jpg")];
//!     match engine.run(handler, batch, &CancellationToken::new()).await {
//!         Ok(summary) => println!("{summary}"),
//!         Err(failure) => eprintln!("{failure}"),
//!     }
//! }
//! ```

pub mod addressing;
pub mod batch;
pub mod config;
pub mod error;
pub mod notification;
pub mod object_store;
pub mod parameter_cache;
pub mod status;

// Re-export main types
pub use addressing::{base_identifier, partition_path, Keyspace, Partition};
pub use batch::{
    BatchEngine, BatchFailure, BatchReport, BatchSummary, FnHandler, RecordFailure,
    RecordHandler, RecordOutcome,
};
pub use config::{BatchConfig, CacheConfig, ConfigError};
pub use error::{PipelineError, Result};
pub use notification::{ChangeNotification, S3Event, S3EventRecord};
pub use object_store::{
    public_access_tags, MemoryObjectStore, ObjectGateway, ObjectStore, PutObject, Tags,
};
pub use parameter_cache::{CachedParameter, ParameterCache, ParameterSource};
pub use status::{
    require_status, MemoryStatusStore, PipelineStatus, StatusRecord, StatusStore,
};
pub use tokio_util::sync::CancellationToken;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::addressing::{base_identifier, Keyspace, Partition};
    pub use crate::batch::{BatchEngine, FnHandler, RecordHandler};
    pub use crate::config::BatchConfig;
    pub use crate::error::PipelineError;
    pub use crate::notification::ChangeNotification;
    pub use crate::object_store::{ObjectGateway, ObjectStore, Tags};
    pub use tokio_util::sync::CancellationToken;
}
