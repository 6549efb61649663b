use crate::config::AwsConfig;
use aws_config::SdkConfig;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use prism_pipeline::object_store::encode_tags;
use prism_pipeline::{ObjectStore, PipelineError, PutObject, Result};
use tracing::{debug, info, instrument};

/// S3-backed object store
pub struct S3ObjectStore {
    client: S3Client,
}

impl S3ObjectStore {
    /// Create a new S3 object store
    pub fn new(sdk_config: &SdkConfig, config: &AwsConfig) -> Self {
        let mut s3_config_builder = S3ConfigBuilder::from(sdk_config);

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            region = %config.region,
            force_path_style = config.force_path_style,
            "S3 object store initialized"
        );

        Self { client }
    }

    /// Get the S3 client
    pub fn client(&self) -> &S3Client {
        &self.client
    }
}

#[async_trait::async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self), fields(bucket = %bucket, key = %key))]
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let output = match self.client.get_object().bucket(bucket).key(key).send().await {
            Ok(output) => output,
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    return Err(PipelineError::not_found(bucket, key));
                }
                return Err(PipelineError::Transport(format!(
                    "get s3://{}/{}: {}",
                    bucket,
                    key,
                    DisplayErrorContext(e)
                )));
            }
        };

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| {
                PipelineError::Transport(format!("read s3://{}/{}: {}", bucket, key, e))
            })?
            .into_bytes()
            .to_vec();

        debug!(size_bytes = body.len(), "Object read from S3");
        metrics::counter!("analysis.s3.bytes_read").increment(body.len() as u64);

        Ok(body)
    }

    #[instrument(skip(self, object), fields(bucket = %bucket, key = %key, size_bytes = object.body.len()))]
    async fn put(&self, bucket: &str, key: &str, object: PutObject) -> Result<()> {
        let size = object.body.len();
        let mut request = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(object.body))
            .content_type(&object.content_type);

        if !object.tags.is_empty() {
            request = request.tagging(encode_tags(&object.tags));
        }

        request.send().await.map_err(|e| {
            PipelineError::Transport(format!(
                "put s3://{}/{}: {}",
                bucket,
                key,
                DisplayErrorContext(e)
            ))
        })?;

        debug!(content_type = %object.content_type, tags = object.tags.len(), "Object written to S3");
        metrics::counter!("analysis.s3.bytes_written").increment(size as u64);

        Ok(())
    }
}
