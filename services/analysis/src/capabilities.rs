//! External analysis capabilities invoked by the stages.
//!
//! Result types mirror the JSON shape of the underlying services so the raw
//! capability output can be persisted and read back by later stages.

use prism_pipeline::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Label detection output for one image
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LabelDetection {
    #[serde(default)]
    pub labels: Vec<DetectedLabel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_model_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orientation_correction: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DetectedLabel {
    pub name: String,
    /// Percent, 0-100
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub instances: Vec<LabelInstance>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parents: Vec<LabelParent>,
}

impl DetectedLabel {
    pub fn new(name: impl Into<String>, confidence: f64) -> Self {
        Self {
            name: name.into(),
            confidence,
            instances: Vec::new(),
            parents: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LabelParent {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LabelInstance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<BoundingBox>,
    pub confidence: f64,
}

/// Ratios of the overall image size
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BoundingBox {
    pub width: f64,
    pub height: f64,
    pub left: f64,
    pub top: f64,
}

/// Sentiment scoring output for one text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SentimentResult {
    /// POSITIVE, NEGATIVE, NEUTRAL or MIXED
    pub sentiment: String,
    pub sentiment_score: SentimentScore,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct SentimentScore {
    pub positive: f64,
    pub negative: f64,
    pub neutral: f64,
    pub mixed: f64,
}

/// How the synthesizer interprets the request text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextType {
    Text,
    Ssml,
}

impl TextType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TextType::Text => "text",
            TextType::Ssml => "ssml",
        }
    }
}

impl fmt::Display for TextType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Speech synthesis request
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechRequest {
    pub text: String,
    pub text_type: TextType,
    pub voice_id: String,
    pub output_format: String,
}

/// Detects labels in an image stored in the bucket
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait LabelDetector: Send + Sync {
    async fn detect_labels(&self, bucket: &str, key: &str) -> Result<LabelDetection>;
}

/// Renders text to audio
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, request: &SpeechRequest) -> Result<Vec<u8>>;
}

/// Scores the sentiment of free text
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait SentimentAnalyzer: Send + Sync {
    async fn detect_sentiment(&self, text: &str, language_code: &str) -> Result<SentimentResult>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_detection_json_shape() {
        let json = r#"{
            "Labels": [
                {"Name": "Dog", "Confidence": 98.5, "Parents": [{"Name": "Animal"}]},
                {"Name": "Grass", "Confidence": 71.25}
            ],
            "LabelModelVersion": "3.0"
        }"#;

        let detection: LabelDetection = serde_json::from_str(json).unwrap();
        assert_eq!(detection.labels.len(), 2);
        assert_eq!(detection.labels[0].parents[0].name, "Animal");
        assert_eq!(detection.label_model_version.as_deref(), Some("3.0"));

        let value = serde_json::to_value(&detection).unwrap();
        assert_eq!(value["Labels"][1]["Name"], "Grass");
        assert!(value.get("OrientationCorrection").is_none());
    }

    #[test]
    fn test_missing_labels_deserialize_as_empty() {
        let detection: LabelDetection = serde_json::from_str("{}").unwrap();
        assert!(detection.labels.is_empty());
    }

    #[test]
    fn test_sentiment_json_shape() {
        let result = SentimentResult {
            sentiment: "POSITIVE".to_string(),
            sentiment_score: SentimentScore {
                positive: 0.9,
                ..Default::default()
            },
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["Sentiment"], "POSITIVE");
        assert_eq!(value["SentimentScore"]["Positive"], 0.9);
    }

    #[test]
    fn test_text_type_display() {
        assert_eq!(TextType::Ssml.to_string(), "ssml");
        assert_eq!(TextType::Text.to_string(), "text");
    }
}
