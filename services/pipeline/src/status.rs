//! Explicit per-identifier lifecycle status.
//!
//! Each stage advances the status of a base identifier after its write lands.
//! Advancing is monotonic: redelivered notifications never move a record
//! backwards.

use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Uploaded,
    Labeled,
    Synthesized,
    Consolidated,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Uploaded => "uploaded",
            PipelineStatus::Labeled => "labeled",
            PipelineStatus::Synthesized => "synthesized",
            PipelineStatus::Consolidated => "consolidated",
        }
    }

    /// Position in the lifecycle, used for monotonic updates in storage
    pub fn rank(&self) -> i16 {
        match self {
            PipelineStatus::Uploaded => 0,
            PipelineStatus::Labeled => 1,
            PipelineStatus::Synthesized => 2,
            PipelineStatus::Consolidated => 3,
        }
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "uploaded" => Ok(PipelineStatus::Uploaded),
            "labeled" => Ok(PipelineStatus::Labeled),
            "synthesized" => Ok(PipelineStatus::Synthesized),
            "consolidated" => Ok(PipelineStatus::Consolidated),
            other => Err(PipelineError::Serialization(format!(
                "unknown pipeline status: {}",
                other
            ))),
        }
    }
}

/// Current status of one base identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub base_id: String,
    pub status: PipelineStatus,
    pub updated_at: DateTime<Utc>,
}

/// Storage for lifecycle status records
#[async_trait::async_trait]
pub trait StatusStore: Send + Sync {
    /// Move `base_id` to `status` unless it is already at or past it
    async fn advance(&self, base_id: &str, status: PipelineStatus) -> Result<StatusRecord>;

    /// Current status, `None` if the identifier was never seen
    async fn get(&self, base_id: &str) -> Result<Option<StatusRecord>>;

    /// Check that the backing store is reachable
    async fn ping(&self) -> Result<()>;
}

/// Fail with `NotReady` unless `base_id` has reached `required`
pub async fn require_status(
    store: &dyn StatusStore,
    base_id: &str,
    required: PipelineStatus,
) -> Result<StatusRecord> {
    match store.get(base_id).await? {
        Some(record) if record.status >= required => Ok(record),
        other => Err(PipelineError::NotReady {
            base_id: base_id.to_string(),
            required: required.to_string(),
            current: other
                .map(|r| r.status.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        }),
    }
}

/// In-process status store
#[derive(Default)]
pub struct MemoryStatusStore {
    records: Mutex<HashMap<String, StatusRecord>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl StatusStore for MemoryStatusStore {
    async fn advance(&self, base_id: &str, status: PipelineStatus) -> Result<StatusRecord> {
        let mut records = self.records.lock();
        let record = records
            .entry(base_id.to_string())
            .or_insert_with(|| StatusRecord {
                base_id: base_id.to_string(),
                status,
                updated_at: Utc::now(),
            });
        if status > record.status {
            record.status = status;
            record.updated_at = Utc::now();
        }
        Ok(record.clone())
    }

    async fn get(&self, base_id: &str) -> Result<Option<StatusRecord>> {
        Ok(self.records.lock().get(base_id).cloned())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
