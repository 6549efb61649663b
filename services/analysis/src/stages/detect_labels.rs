use super::{observe_stage, until_cancelled, StageContext};
use crate::capabilities::LabelDetector;
use prism_pipeline::{
    CancellationToken, ChangeNotification, Partition, PipelineError, PipelineStatus,
    RecordHandler, Tags,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument};

/// Submits each upload to label detection and stores the raw result
pub struct DetectLabelsStage {
    ctx: Arc<StageContext>,
    detector: Arc<dyn LabelDetector>,
}

impl DetectLabelsStage {
    pub fn new(ctx: Arc<StageContext>, detector: Arc<dyn LabelDetector>) -> Self {
        Self { ctx, detector }
    }

    async fn process(
        &self,
        cancel: &CancellationToken,
        notification: &ChangeNotification,
    ) -> Result<String, PipelineError> {
        let bucket = &notification.bucket_name;
        let base_id = notification.base_identifier();
        self.ctx.advance(base_id, PipelineStatus::Uploaded).await?;

        let detection = until_cancelled(
            cancel,
            self.detector.detect_labels(bucket, &notification.object_key),
        )
        .await?;

        let path = self.ctx.keyspace.path(Partition::RekognitionArtifacts, base_id);
        self.ctx
            .gateway
            .put_json(bucket, &path, &detection, &Tags::new())
            .await?;
        self.ctx.advance(base_id, PipelineStatus::Labeled).await?;

        info!(
            base_id = %base_id,
            path = %path,
            labels = detection.labels.len(),
            "Label detection stored"
        );
        Ok(path)
    }
}

#[async_trait::async_trait]
impl RecordHandler for DetectLabelsStage {
    type Output = String;

    #[instrument(skip_all, fields(stage = "detect-labels", key = %notification.object_key))]
    async fn handle(
        &self,
        cancel: CancellationToken,
        notification: ChangeNotification,
    ) -> Result<String, PipelineError> {
        let started = Instant::now();
        let result = self.process(&cancel, &notification).await;
        observe_stage("detect-labels", started, &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::{fixture, BUCKET};
    use super::*;
    use crate::capabilities::{DetectedLabel, LabelDetection, MockLabelDetector};
    use prism_pipeline::StatusStore;

    #[tokio::test]
    async fn test_writes_raw_detection_under_base_identifier() {
        let fx = fixture(true);
        let mut detector = MockLabelDetector::new();
        detector.expect_detect_labels().returning(|_, _| {
            Ok(LabelDetection {
                labels: vec![DetectedLabel::new("Cat", 91.0)],
                label_model_version: Some("3.0".to_string()),
                ..Default::default()
            })
        });

        let stage = DetectLabelsStage::new(fx.ctx.clone(), Arc::new(detector));
        let path = stage
            .handle(
                CancellationToken::new(),
                ChangeNotification::new(BUCKET, "uploads/req-7.jpg"),
            )
            .await
            .unwrap();

        assert_eq!(path, "rekognition-artifacts/req-7");
        let stored: serde_json::Value = fx.ctx.gateway.get_json(BUCKET, &path).await.unwrap();
        assert_eq!(stored["Labels"][0]["Name"], "Cat");
        assert_eq!(stored["LabelModelVersion"], "3.0");

        let status = fx.status.as_ref().unwrap().get("req-7").await.unwrap().unwrap();
        assert_eq!(status.status, PipelineStatus::Labeled);
    }

    #[tokio::test]
    async fn test_capability_failure_writes_nothing() {
        let fx = fixture(false);
        let mut detector = MockLabelDetector::new();
        detector
            .expect_detect_labels()
            .returning(|_, _| Err(PipelineError::capability("rekognition", "InvalidImageFormat")));

        let stage = DetectLabelsStage::new(fx.ctx.clone(), Arc::new(detector));
        let err = stage
            .handle(
                CancellationToken::new(),
                ChangeNotification::new(BUCKET, "uploads/req-8"),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Capability { .. }));
        assert!(fx.store.keys(BUCKET).is_empty());
    }

    #[tokio::test]
    async fn test_upload_is_tracked_before_detection() {
        let fx = fixture(true);
        let mut detector = MockLabelDetector::new();
        detector
            .expect_detect_labels()
            .returning(|_, _| Err(PipelineError::capability("rekognition", "ThrottlingException")));

        let stage = DetectLabelsStage::new(fx.ctx.clone(), Arc::new(detector));
        tokio_test::assert_err!(
            stage
                .handle(
                    CancellationToken::new(),
                    ChangeNotification::new(BUCKET, "uploads/req-9.png"),
                )
                .await
        );

        let status = fx.status.as_ref().unwrap().get("req-9").await.unwrap().unwrap();
        assert_eq!(status.status, PipelineStatus::Uploaded);
    }
}
