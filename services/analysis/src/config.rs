use prism_pipeline::{BatchConfig, CacheConfig, ConfigError, Keyspace};
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the analysis service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// AWS client configuration
    #[serde(default)]
    pub aws: AwsConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// Partition prefixes inside the bucket
    #[serde(default)]
    pub keyspace: Keyspace,
    /// Batch fan-out configuration
    #[serde(default)]
    pub batch: BatchConfig,
    /// Notification queues, one per triggered stage
    #[serde(default)]
    pub queues: QueueConfig,
    /// Speech synthesis configuration
    #[serde(default)]
    pub speech: SpeechConfig,
    /// Sentiment analysis configuration
    #[serde(default)]
    pub sentiment: SentimentConfig,
    /// Status database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// AWS client configuration shared by every SDK client
#[derive(Debug, Clone, Deserialize)]
pub struct AwsConfig {
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style S3 access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket shared by every stage
    pub bucket: String,
}

/// SQS queues receiving S3 event notifications
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Queue fed by creations under the uploads partition
    pub detect_labels_url: Option<String>,
    /// Queue fed by creations under the label artifacts partition
    pub synthesize_speech_url: Option<String>,
    /// Queue fed by creations under the speech artifacts partition
    pub consolidate_summary_url: Option<String>,
    /// Long-poll wait in seconds
    #[serde(default = "default_wait_time_secs")]
    pub wait_time_secs: i32,
    /// Messages per receive call (1-10)
    #[serde(default = "default_max_messages")]
    pub max_messages: i32,
    /// Visibility timeout in seconds while a batch is processed
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: i32,
}

/// Speech synthesis configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SpeechConfig {
    /// Parameter store path holding the voice id
    #[serde(default = "default_voice_parameter_path")]
    pub voice_parameter_path: String,
    /// Voice used when the parameter is missing or empty
    #[serde(default = "default_voice")]
    pub default_voice: String,
    /// Audio output format
    #[serde(default = "default_output_format")]
    pub output_format: String,
    /// Voice parameter caching
    #[serde(default)]
    pub parameter_cache: CacheConfig,
}

/// Sentiment analysis configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SentimentConfig {
    /// Language used when a request does not name one
    #[serde(default = "default_language")]
    pub default_language: String,
}

/// Database configuration for the status store
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL; status tracking is disabled when absent
    pub url: Option<String>,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

/// API configuration for the feedback endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Serve the HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "prism-analysis".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_wait_time_secs() -> i32 {
    20
}

fn default_max_messages() -> i32 {
    10
}

fn default_visibility_timeout_secs() -> i32 {
    60
}

fn default_voice_parameter_path() -> String {
    "/prism/speech/voice-id".to_string()
}

fn default_voice() -> String {
    "Joanna".to_string()
}

fn default_output_format() -> String {
    "mp3".to_string()
}

fn default_language() -> String {
    "en".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_run_migrations() -> bool {
    true
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "prism-analysis")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            // Add config file if present
            .add_source(config::File::with_name("config/analysis").required(false))
            .add_source(config::File::with_name("/etc/prism/analysis").required(false))
            // Override with environment variables
            // ANALYSIS__S3__BUCKET -> s3.bucket
            .add_source(
                config::Environment::with_prefix("ANALYSIS")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.s3.bucket.is_empty() {
            return Err(ConfigError::MissingRequired("s3.bucket".to_string()));
        }

        if !(1..=10).contains(&self.queues.max_messages) {
            return Err(ConfigError::InvalidValue {
                key: "queues.max_messages".to_string(),
                message: format!("{} is outside 1..=10", self.queues.max_messages),
            });
        }

        if !(1..=20).contains(&self.queues.wait_time_secs) {
            return Err(ConfigError::InvalidValue {
                key: "queues.wait_time_secs".to_string(),
                message: format!("{} is outside 1..=20", self.queues.wait_time_secs),
            });
        }

        if !self.api.enabled && self.queues.is_empty() {
            return Err(ConfigError::MissingRequired(
                "at least one queue URL or the API".to_string(),
            ));
        }

        self.speech.parameter_cache.validate()
    }
}

impl DatabaseConfig {
    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Get idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

impl QueueConfig {
    /// True when no stage queue is configured
    pub fn is_empty(&self) -> bool {
        self.detect_labels_url.is_none()
            && self.synthesize_speech_url.is_none()
            && self.consolidate_summary_url.is_none()
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            detect_labels_url: None,
            synthesize_speech_url: None,
            consolidate_summary_url: None,
            wait_time_secs: default_wait_time_secs(),
            max_messages: default_max_messages(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
        }
    }
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            voice_parameter_path: default_voice_parameter_path(),
            default_voice: default_voice(),
            output_format: default_output_format(),
            parameter_cache: CacheConfig::default(),
        }
    }
}

impl Default for SentimentConfig {
    fn default() -> Self {
        Self {
            default_language: default_language(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            run_migrations: default_run_migrations(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        serde_json::from_value(serde_json::json!({
            "s3": { "bucket": "prism-artifacts" }
        }))
        .unwrap()
    }

    #[test]
    fn test_default_values() {
        let config = minimal();
        assert_eq!(config.service.name, "prism-analysis");
        assert_eq!(config.speech.default_voice, "Joanna");
        assert_eq!(config.speech.output_format, "mp3");
        assert_eq!(config.speech.parameter_cache.ttl_secs, 30);
        assert_eq!(config.sentiment.default_language, "en");
        assert_eq!(config.keyspace.uploads, "uploads");
        assert_eq!(config.queues.wait_time_secs, 20);
        assert!(config.database.url.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_bucket() {
        let mut config = minimal();
        config.s3.bucket.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired(key)) if key == "s3.bucket"
        ));
    }

    #[test]
    fn test_validate_rejects_out_of_range_max_messages() {
        let mut config = minimal();
        config.queues.max_messages = 11;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_short_polling() {
        for wait_time_secs in [0, 21] {
            let mut config = minimal();
            config.queues.wait_time_secs = wait_time_secs;
            assert!(matches!(
                config.validate(),
                Err(ConfigError::InvalidValue { key, .. }) if key == "queues.wait_time_secs"
            ));
        }
    }

    #[test]
    fn test_database_timeouts() {
        let config = minimal();
        assert_eq!(config.database.connect_timeout(), Duration::from_secs(30));
        assert_eq!(config.database.idle_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn test_validate_requires_some_entrypoint() {
        let mut config = minimal();
        config.api.enabled = false;
        assert!(config.validate().is_err());

        config.queues.consolidate_summary_url =
            Some("https://sqs.us-east-1.amazonaws.com/123/consolidate".to_string());
        assert!(config.validate().is_ok());
    }
}
