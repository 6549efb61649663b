//! Configuration for the batch engine and the parameter cache.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required configuration: {0}")]
    MissingRequired(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Fan-out settings applied to every batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Maximum records in flight per batch (0 = one task per record, unbounded)
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Deadline for a single record in seconds (0 disables the deadline)
    #[serde(default = "default_record_timeout_secs")]
    pub record_timeout_secs: u64,
}

fn default_max_concurrency() -> usize {
    16
}

fn default_record_timeout_secs() -> u64 {
    30
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            record_timeout_secs: default_record_timeout_secs(),
        }
    }
}

impl BatchConfig {
    /// Unbounded fan-out with no per-record deadline
    pub fn unbounded() -> Self {
        Self {
            max_concurrency: 0,
            record_timeout_secs: 0,
        }
    }

    /// Concurrency limit, `None` when unbounded
    pub fn concurrency_limit(&self) -> Option<usize> {
        (self.max_concurrency > 0).then_some(self.max_concurrency)
    }

    /// Per-record deadline, `None` when disabled
    pub fn record_timeout(&self) -> Option<Duration> {
        (self.record_timeout_secs > 0).then(|| Duration::from_secs(self.record_timeout_secs))
    }
}

/// Settings for the cached configuration parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// How long a fetched value stays fresh, in seconds
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_ttl_secs() -> u64 {
    30
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl_secs == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ttl_secs".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}
