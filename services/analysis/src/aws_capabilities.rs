use crate::capabilities::{
    BoundingBox, DetectedLabel, LabelDetection, LabelDetector, LabelInstance, LabelParent,
    SentimentAnalyzer, SentimentResult, SentimentScore, SpeechRequest, SpeechSynthesizer,
};
use crate::config::AwsConfig;
use aws_config::{BehaviorVersion, Region, SdkConfig};
use prism_pipeline::{ParameterSource, PipelineError, Result};
use std::time::Instant;
use tracing::{debug, info, instrument};

const REKOGNITION: &str = "rekognition";
const POLLY: &str = "polly";
const COMPREHEND: &str = "comprehend";

/// Load the shared SDK configuration for every AWS client
pub async fn load_sdk_config(config: &AwsConfig) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(config.region.clone()));

    // Custom endpoint for LocalStack
    if let Some(ref endpoint_url) = config.endpoint_url {
        loader = loader.endpoint_url(endpoint_url);
    }

    let sdk_config = loader.load().await;

    info!(
        region = %config.region,
        endpoint = ?config.endpoint_url,
        "AWS configuration loaded"
    );

    sdk_config
}

fn record_call(capability: &'static str, started: Instant) {
    metrics::histogram!("analysis.capability.duration_seconds", "capability" => capability)
        .record(started.elapsed().as_secs_f64());
}

/// Label detection backed by Rekognition DetectLabels
pub struct RekognitionLabelDetector {
    client: aws_sdk_rekognition::Client,
}

impl RekognitionLabelDetector {
    pub fn new(sdk_config: &SdkConfig) -> Self {
        Self {
            client: aws_sdk_rekognition::Client::new(sdk_config),
        }
    }
}

#[async_trait::async_trait]
impl LabelDetector for RekognitionLabelDetector {
    #[instrument(skip(self), fields(bucket = %bucket, key = %key))]
    async fn detect_labels(&self, bucket: &str, key: &str) -> Result<LabelDetection> {
        use aws_sdk_rekognition::error::DisplayErrorContext;
        use aws_sdk_rekognition::types::{Image, S3Object};

        let image = Image::builder()
            .s3_object(S3Object::builder().bucket(bucket).name(key).build())
            .build();

        let started = Instant::now();
        let output = self
            .client
            .detect_labels()
            .image(image)
            .send()
            .await
            .map_err(|e| PipelineError::capability(REKOGNITION, DisplayErrorContext(e)))?;
        record_call(REKOGNITION, started);

        let labels = output
            .labels()
            .iter()
            .map(|label| DetectedLabel {
                name: label.name().unwrap_or_default().to_string(),
                confidence: label.confidence().map(f64::from).unwrap_or_default(),
                instances: label
                    .instances()
                    .iter()
                    .map(|instance| LabelInstance {
                        bounding_box: instance.bounding_box().map(|b| BoundingBox {
                            width: b.width().map(f64::from).unwrap_or_default(),
                            height: b.height().map(f64::from).unwrap_or_default(),
                            left: b.left().map(f64::from).unwrap_or_default(),
                            top: b.top().map(f64::from).unwrap_or_default(),
                        }),
                        confidence: instance.confidence().map(f64::from).unwrap_or_default(),
                    })
                    .collect(),
                parents: label
                    .parents()
                    .iter()
                    .filter_map(|parent| parent.name())
                    .map(|name| LabelParent {
                        name: name.to_string(),
                    })
                    .collect(),
            })
            .collect::<Vec<_>>();

        debug!(labels = labels.len(), "Labels detected");

        Ok(LabelDetection {
            labels,
            label_model_version: output.label_model_version().map(str::to_string),
            orientation_correction: output
                .orientation_correction()
                .map(|o| o.as_str().to_string()),
        })
    }
}

/// Speech synthesis backed by Polly SynthesizeSpeech
pub struct PollySpeechSynthesizer {
    client: aws_sdk_polly::Client,
}

impl PollySpeechSynthesizer {
    pub fn new(sdk_config: &SdkConfig) -> Self {
        Self {
            client: aws_sdk_polly::Client::new(sdk_config),
        }
    }
}

#[async_trait::async_trait]
impl SpeechSynthesizer for PollySpeechSynthesizer {
    #[instrument(skip(self, request), fields(voice = %request.voice_id, text_type = %request.text_type))]
    async fn synthesize(&self, request: &SpeechRequest) -> Result<Vec<u8>> {
        use aws_sdk_polly::error::DisplayErrorContext;
        use aws_sdk_polly::types::{OutputFormat, TextType, VoiceId};

        let started = Instant::now();
        let output = self
            .client
            .synthesize_speech()
            .text(&request.text)
            .text_type(TextType::from(request.text_type.as_str()))
            .voice_id(VoiceId::from(request.voice_id.as_str()))
            .output_format(OutputFormat::from(request.output_format.as_str()))
            .send()
            .await
            .map_err(|e| PipelineError::capability(POLLY, DisplayErrorContext(e)))?;

        let audio = output
            .audio_stream
            .collect()
            .await
            .map_err(|e| PipelineError::capability(POLLY, e))?
            .into_bytes()
            .to_vec();
        record_call(POLLY, started);

        debug!(size_bytes = audio.len(), "Speech synthesized");
        Ok(audio)
    }
}

/// Sentiment analysis backed by Comprehend DetectSentiment
pub struct ComprehendSentimentAnalyzer {
    client: aws_sdk_comprehend::Client,
}

impl ComprehendSentimentAnalyzer {
    pub fn new(sdk_config: &SdkConfig) -> Self {
        Self {
            client: aws_sdk_comprehend::Client::new(sdk_config),
        }
    }
}

#[async_trait::async_trait]
impl SentimentAnalyzer for ComprehendSentimentAnalyzer {
    #[instrument(skip(self, text), fields(language = %language_code, text_len = text.len()))]
    async fn detect_sentiment(&self, text: &str, language_code: &str) -> Result<SentimentResult> {
        use aws_sdk_comprehend::error::DisplayErrorContext;
        use aws_sdk_comprehend::types::LanguageCode;

        let started = Instant::now();
        let output = self
            .client
            .detect_sentiment()
            .text(text)
            .language_code(LanguageCode::from(language_code))
            .send()
            .await
            .map_err(|e| PipelineError::capability(COMPREHEND, DisplayErrorContext(e)))?;
        record_call(COMPREHEND, started);

        let sentiment_score = output
            .sentiment_score()
            .map(|score| SentimentScore {
                positive: score.positive().map(f64::from).unwrap_or_default(),
                negative: score.negative().map(f64::from).unwrap_or_default(),
                neutral: score.neutral().map(f64::from).unwrap_or_default(),
                mixed: score.mixed().map(f64::from).unwrap_or_default(),
            })
            .unwrap_or_default();

        Ok(SentimentResult {
            sentiment: output
                .sentiment()
                .map(|s| s.as_str().to_string())
                .unwrap_or_default(),
            sentiment_score,
        })
    }
}

/// Configuration parameters backed by SSM Parameter Store
pub struct SsmParameterSource {
    client: aws_sdk_ssm::Client,
}

impl SsmParameterSource {
    pub fn new(sdk_config: &SdkConfig) -> Self {
        Self {
            client: aws_sdk_ssm::Client::new(sdk_config),
        }
    }
}

#[async_trait::async_trait]
impl ParameterSource for SsmParameterSource {
    #[instrument(skip(self))]
    async fn get_string(&self, path: &str) -> Result<String> {
        use aws_sdk_ssm::error::DisplayErrorContext;

        let output = match self
            .client
            .get_parameter()
            .name(path)
            .with_decryption(true)
            .send()
            .await
        {
            Ok(output) => output,
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_parameter_not_found())
                    .unwrap_or(false)
                {
                    return Err(PipelineError::ParameterMissing(path.to_string()));
                }
                return Err(PipelineError::Transport(format!(
                    "ssm get {}: {}",
                    path,
                    DisplayErrorContext(e)
                )));
            }
        };

        output
            .parameter()
            .and_then(|p| p.value())
            .map(str::to_string)
            .ok_or_else(|| PipelineError::ParameterMissing(path.to_string()))
    }
}
