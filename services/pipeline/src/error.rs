//! Error taxonomy shared by every pipeline stage.

use std::time::Duration;
use thiserror::Error;

/// Errors a single record, object store call or capability call can produce
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("Object not found: s3://{bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("{capability} call failed: {message}")]
    Capability { capability: String, message: String },

    #[error("Configuration parameter missing: {0}")]
    ParameterMissing(String),

    #[error("Record timed out after {0:?}")]
    Timeout(Duration),

    #[error("Record cancelled before completion")]
    Cancelled,

    #[error("Record handler panicked: {0}")]
    HandlerPanicked(String),

    #[error("{base_id} is not ready: requires {required}, currently {current}")]
    NotReady {
        base_id: String,
        required: String,
        current: String,
    },
}

impl PipelineError {
    pub fn not_found(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self::NotFound {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    pub fn capability(capability: impl Into<String>, message: impl ToString) -> Self {
        Self::Capability {
            capability: capability.into(),
            message: message.to_string(),
        }
    }

    /// True when the error means an expected artifact is absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = PipelineError::not_found("bucket", "polly-artifacts/req-1");
        assert_eq!(
            err.to_string(),
            "Object not found: s3://bucket/polly-artifacts/req-1"
        );
        assert!(err.is_not_found());
    }

    #[test]
    fn test_serde_error_converts_to_serialization() {
        let parse: std::result::Result<serde_json::Value, _> = serde_json::from_str("{not json");
        let err: PipelineError = parse.unwrap_err().into();
        assert!(matches!(err, PipelineError::Serialization(_)));
    }
}
