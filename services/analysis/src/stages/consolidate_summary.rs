use super::{observe_stage, StageContext};
use crate::capabilities::LabelDetection;
use prism_pipeline::{
    public_access_tags, CancellationToken, ChangeNotification, Partition, PipelineError,
    PipelineStatus, RecordHandler,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument};

/// Every partial output for one base identifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    /// Raw label detection output
    pub rekognition: LabelDetection,
    /// Synthesized audio, base64 in JSON
    #[serde(with = "base64_serde")]
    pub polly: Vec<u8>,
}

/// Base64 serialization helper
mod base64_serde {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// Combines labels and audio into one publicly readable summary
pub struct ConsolidateSummaryStage {
    ctx: Arc<StageContext>,
}

impl ConsolidateSummaryStage {
    pub fn new(ctx: Arc<StageContext>) -> Self {
        Self { ctx }
    }

    async fn process(&self, notification: &ChangeNotification) -> Result<String, PipelineError> {
        let bucket = &notification.bucket_name;
        let base_id = notification.base_identifier();
        let keyspace = &self.ctx.keyspace;

        self.ctx.require(base_id, PipelineStatus::Synthesized).await?;

        let rekognition: LabelDetection = self
            .ctx
            .gateway
            .get_json(bucket, &keyspace.path(Partition::RekognitionArtifacts, base_id))
            .await?;
        let polly = self
            .ctx
            .gateway
            .get(bucket, &keyspace.path(Partition::PollyArtifacts, base_id))
            .await?;

        let summary = SummaryRecord { rekognition, polly };
        let path = keyspace.path(Partition::Consolidated, base_id);
        self.ctx
            .gateway
            .put_json(bucket, &path, &summary, &public_access_tags())
            .await?;
        self.ctx.advance(base_id, PipelineStatus::Consolidated).await?;

        info!(
            base_id = %base_id,
            path = %path,
            audio_bytes = summary.polly.len(),
            "Summary consolidated"
        );
        Ok(path)
    }
}

#[async_trait::async_trait]
impl RecordHandler for ConsolidateSummaryStage {
    type Output = String;

    // Consolidation makes no capability call, so there is nothing to cancel
    #[instrument(skip_all, fields(stage = "consolidate-summary", key = %notification.object_key))]
    async fn handle(
        &self,
        _cancel: CancellationToken,
        notification: ChangeNotification,
    ) -> Result<String, PipelineError> {
        let started = Instant::now();
        let result = self.process(&notification).await;
        observe_stage("consolidate-summary", started, &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{fixture, BUCKET};
    use super::*;
    use crate::capabilities::DetectedLabel;
    use prism_pipeline::{BatchConfig, BatchEngine, StatusStore, Tags};

    async fn seed_labels(ctx: &StageContext, base_id: &str) {
        let detection = LabelDetection {
            labels: vec![DetectedLabel::new("Tree", 88.0)],
            ..Default::default()
        };
        ctx.gateway
            .put_json(
                BUCKET,
                &format!("rekognition-artifacts/{}", base_id),
                &detection,
                &Tags::new(),
            )
            .await
            .unwrap();
    }

    #[test]
    fn test_summary_encodes_audio_as_base64() {
        let record = SummaryRecord {
            rekognition: LabelDetection::default(),
            polly: b"Hello World".to_vec(),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["polly"], "SGVsbG8gV29ybGQ=");
        assert!(value["rekognition"]["Labels"].as_array().unwrap().is_empty());

        let decoded: SummaryRecord = serde_json::from_value(value).unwrap();
        assert_eq!(decoded, record);
    }

    #[tokio::test]
    async fn test_missing_audio_fails_record_with_not_found() {
        let fx = fixture(false);
        seed_labels(&fx.ctx, "req-1").await;

        let engine = BatchEngine::new(BatchConfig::default());
        let stage = Arc::new(ConsolidateSummaryStage::new(fx.ctx.clone()));
        let failure = engine
            .run(
                stage,
                vec![ChangeNotification::new(BUCKET, "polly-artifacts/req-1")],
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert_eq!(failure.failures.len(), 1);
        assert_eq!(failure.succeeded, 0);
        assert_eq!(
            failure.failures[0].error,
            PipelineError::not_found(BUCKET, "polly-artifacts/req-1")
        );
        assert!(!fx.store.contains(BUCKET, "consolidated/req-1"));
    }

    #[tokio::test]
    async fn test_redelivery_overwrites_summary() {
        let fx = fixture(true);
        seed_labels(&fx.ctx, "req-2").await;
        fx.ctx
            .gateway
            .put_binary(BUCKET, "polly-artifacts/req-2", vec![9, 9], "audio/mpeg3")
            .await
            .unwrap();
        fx.status
            .as_ref()
            .unwrap()
            .advance("req-2", PipelineStatus::Synthesized)
            .await
            .unwrap();

        let stage = ConsolidateSummaryStage::new(fx.ctx.clone());
        let notification = ChangeNotification::new(BUCKET, "polly-artifacts/req-2");
        stage
            .handle(CancellationToken::new(), notification.clone())
            .await
            .unwrap();
        stage
            .handle(CancellationToken::new(), notification)
            .await
            .unwrap();

        let record: SummaryRecord = fx
            .ctx
            .gateway
            .get_json(BUCKET, "consolidated/req-2")
            .await
            .unwrap();
        assert_eq!(record.polly, vec![9, 9]);
        let status = fx.status.as_ref().unwrap().get("req-2").await.unwrap().unwrap();
        assert_eq!(status.status, PipelineStatus::Consolidated);
    }
}
