use super::{observe_stage, StageContext};
use crate::capabilities::{SentimentAnalyzer, SentimentResult};
use prism_pipeline::{Partition, PipelineError, Tags};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument};

/// Feedback submitted for sentiment scoring
#[derive(Debug, Clone, Deserialize)]
pub struct FeedbackRequest {
    /// Language code; the configured default when absent or empty
    #[serde(rename = "lang", default)]
    pub language: Option<String>,
    pub comment: String,
}

/// Sentiment result returned to the caller and persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackResponse {
    pub sentiment: SentimentResult,
    pub comment: String,
}

/// Scores free text synchronously and keeps a copy of each result
pub struct AnalyzeSentimentStage {
    ctx: Arc<StageContext>,
    analyzer: Arc<dyn SentimentAnalyzer>,
    bucket: String,
    default_language: String,
}

impl AnalyzeSentimentStage {
    pub fn new(
        ctx: Arc<StageContext>,
        analyzer: Arc<dyn SentimentAnalyzer>,
        bucket: impl Into<String>,
        default_language: impl Into<String>,
    ) -> Self {
        Self {
            ctx,
            analyzer,
            bucket: bucket.into(),
            default_language: default_language.into(),
        }
    }

    /// Score `request` and persist the response under `correlation_id`
    #[instrument(skip(self, request), fields(stage = "analyze-sentiment", correlation_id = %correlation_id))]
    pub async fn analyze(
        &self,
        correlation_id: &str,
        request: FeedbackRequest,
    ) -> Result<FeedbackResponse, PipelineError> {
        let started = Instant::now();
        let result = self.process(correlation_id, request).await;
        observe_stage("analyze-sentiment", started, &result);
        result
    }

    async fn process(
        &self,
        correlation_id: &str,
        request: FeedbackRequest,
    ) -> Result<FeedbackResponse, PipelineError> {
        let language = request
            .language
            .as_deref()
            .filter(|l| !l.is_empty())
            .unwrap_or(&self.default_language)
            .to_string();

        let sentiment = self
            .analyzer
            .detect_sentiment(&request.comment, &language)
            .await?;
        let response = FeedbackResponse {
            sentiment,
            comment: request.comment,
        };

        let path = self.ctx.keyspace.path_with_extension(
            Partition::ComprehendArtifacts,
            &sanitize_path_component(correlation_id),
            "json",
        );
        self.ctx
            .gateway
            .put_json(&self.bucket, &path, &response, &Tags::new())
            .await?;

        info!(
            path = %path,
            language = %language,
            sentiment = %response.sentiment.sentiment,
            "Sentiment stored"
        );
        Ok(response)
    }
}

/// Sanitize a path component to prevent path traversal
fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::super::testing::{fixture, BUCKET};
    use super::*;
    use crate::capabilities::{MockSentimentAnalyzer, SentimentScore};

    fn positive() -> SentimentResult {
        SentimentResult {
            sentiment: "POSITIVE".to_string(),
            sentiment_score: SentimentScore {
                positive: 0.97,
                negative: 0.01,
                neutral: 0.02,
                mixed: 0.0,
            },
        }
    }

    fn request(json: &str) -> FeedbackRequest {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_feedback_request_shape() {
        let req = request(r#"{"lang": "fr", "comment": "Très bien"}"#);
        assert_eq!(req.language.as_deref(), Some("fr"));
        assert_eq!(req.comment, "Très bien");

        let req = request(r#"{"comment": "Great"}"#);
        assert!(req.language.is_none());
    }

    #[test]
    fn test_sanitize_path_component() {
        assert_eq!(sanitize_path_component("3f2b-11aa"), "3f2b-11aa");
        assert_eq!(sanitize_path_component("../consolidated/x"), "___consolidated_x");
    }

    #[tokio::test]
    async fn test_defaults_language_and_persists_response() {
        let fx = fixture(false);
        let mut analyzer = MockSentimentAnalyzer::new();
        analyzer
            .expect_detect_sentiment()
            .withf(|text, language| text == "Love it" && language == "en")
            .times(1)
            .returning(|_, _| Ok(positive()));

        let stage = AnalyzeSentimentStage::new(fx.ctx.clone(), Arc::new(analyzer), BUCKET, "en");
        let response = stage
            .analyze("corr-1", request(r#"{"lang": "", "comment": "Love it"}"#))
            .await
            .unwrap();

        assert_eq!(response.comment, "Love it");
        assert_eq!(response.sentiment, positive());

        let stored: FeedbackResponse = fx
            .ctx
            .gateway
            .get_json(BUCKET, "comprehend-artifacts/corr-1.json")
            .await
            .unwrap();
        assert_eq!(stored, response);
    }

    #[tokio::test]
    async fn test_explicit_language_is_passed_through() {
        let fx = fixture(false);
        let mut analyzer = MockSentimentAnalyzer::new();
        analyzer
            .expect_detect_sentiment()
            .withf(|_, language| language == "de")
            .times(1)
            .returning(|_, _| Ok(positive()));

        let stage = AnalyzeSentimentStage::new(fx.ctx.clone(), Arc::new(analyzer), BUCKET, "en");
        stage
            .analyze("corr-2", request(r#"{"lang": "de", "comment": "Gut"}"#))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_capability_error_is_returned_without_persisting() {
        let fx = fixture(false);
        let mut analyzer = MockSentimentAnalyzer::new();
        analyzer
            .expect_detect_sentiment()
            .returning(|_, _| Err(PipelineError::capability("comprehend", "TextSizeLimitExceeded")));

        let stage = AnalyzeSentimentStage::new(fx.ctx.clone(), Arc::new(analyzer), BUCKET, "en");
        let err = stage
            .analyze("corr-3", request(r#"{"comment": "..."}"#))
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Capability { .. }));
        assert!(fx.store.keys(BUCKET).is_empty());
    }
}
