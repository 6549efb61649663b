use super::{observe_stage, until_cancelled, StageContext};
use crate::capabilities::{DetectedLabel, LabelDetection, SpeechRequest, SpeechSynthesizer, TextType};
use crate::config::SpeechConfig;
use prism_pipeline::{
    CancellationToken, ChangeNotification, ParameterCache, Partition, PipelineError,
    PipelineStatus, RecordHandler,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument};

/// Spoken when detection found no labels
pub const NO_LABELS_TEXT: &str = "I'm afraid I didn't find anything in your image";

/// Label with the highest confidence
///
/// Compares with `>=`, so among labels sharing the maximum confidence the last
/// one wins. Labels with negative confidence are never selected.
pub fn select_label(labels: &[DetectedLabel]) -> Option<&DetectedLabel> {
    let mut selected = None;
    let mut current = 0.0;
    for label in labels {
        if label.confidence >= current {
            selected = Some(label);
            current = label.confidence;
        }
    }
    selected
}

/// SSML announcing a label and its confidence percentage
pub fn label_ssml(label: &DetectedLabel) -> String {
    format!(
        "<speak>\nIt appears that this image includes <amazon:breath/><break time=\"1s\"/><emphasis>\n {}</emphasis><break time=\"1s\"/> with a confidence of {:.2} percent.\n</speak>",
        escape_xml(&label.name),
        label.confidence
    )
}

fn escape_xml(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// Build the synthesis request for a detection result
pub fn speech_request(detection: &LabelDetection, voice_id: &str, output_format: &str) -> SpeechRequest {
    let (text, text_type) = match select_label(&detection.labels) {
        Some(label) => (label_ssml(label), TextType::Ssml),
        None => (NO_LABELS_TEXT.to_string(), TextType::Text),
    };

    SpeechRequest {
        text,
        text_type,
        voice_id: voice_id.to_string(),
        output_format: output_format.to_string(),
    }
}

/// Content type stored alongside synthesized audio
pub fn audio_content_type(output_format: &str) -> &'static str {
    match output_format {
        "mp3" => "audio/mpeg3",
        "ogg_vorbis" => "audio/ogg",
        "pcm" => "audio/pcm",
        "json" => "application/json",
        _ => "application/octet-stream",
    }
}

/// Turns the most confident label into speech
pub struct SynthesizeSpeechStage {
    ctx: Arc<StageContext>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    voices: Arc<ParameterCache>,
    config: SpeechConfig,
}

impl SynthesizeSpeechStage {
    pub fn new(
        ctx: Arc<StageContext>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        voices: Arc<ParameterCache>,
        config: SpeechConfig,
    ) -> Self {
        Self {
            ctx,
            synthesizer,
            voices,
            config,
        }
    }

    async fn process(
        &self,
        cancel: &CancellationToken,
        notification: &ChangeNotification,
    ) -> Result<String, PipelineError> {
        let bucket = &notification.bucket_name;
        let base_id = notification.base_identifier();

        self.ctx.require(base_id, PipelineStatus::Labeled).await?;

        let labels_path = self.ctx.keyspace.path(Partition::RekognitionArtifacts, base_id);
        let detection: LabelDetection = self.ctx.gateway.get_json(bucket, &labels_path).await?;

        let voice = self
            .voices
            .get_or_default(&self.config.voice_parameter_path, &self.config.default_voice)
            .await;
        let request = speech_request(&detection, &voice, &self.config.output_format);
        debug!(voice = %voice, text_type = %request.text_type, "Synthesizing speech");

        let audio = until_cancelled(cancel, self.synthesizer.synthesize(&request)).await?;
        if audio.is_empty() {
            return Err(PipelineError::capability("polly", "empty audio stream"));
        }

        let path = self.ctx.keyspace.path(Partition::PollyArtifacts, base_id);
        let size = audio.len();
        self.ctx
            .gateway
            .put_binary(bucket, &path, audio, audio_content_type(&self.config.output_format))
            .await?;
        self.ctx.advance(base_id, PipelineStatus::Synthesized).await?;

        info!(base_id = %base_id, path = %path, size_bytes = size, "Speech stored");
        Ok(path)
    }
}

#[async_trait::async_trait]
impl RecordHandler for SynthesizeSpeechStage {
    type Output = String;

    #[instrument(skip_all, fields(stage = "synthesize-speech", key = %notification.object_key))]
    async fn handle(
        &self,
        cancel: CancellationToken,
        notification: ChangeNotification,
    ) -> Result<String, PipelineError> {
        let started = Instant::now();
        let result = self.process(&cancel, &notification).await;
        observe_stage("synthesize-speech", started, &result);
        result
    }
}
