use crate::config::TtsConfig;
use crate::error::VoiceError;
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

/// Maximum text input size for TTS (64 KiB). Prevents resource exhaustion from
/// oversized synthesis requests.
const MAX_TTS_INPUT_BYTES: usize = 64 * 1024;

/// Timeout for a single synthesis request.
const TTS_TIMEOUT: Duration = Duration::from_secs(30);

/// Service for generating speech from text.
#[async_trait]
pub trait TextToSpeech: Send + Sync {
    /// Synthesizes `text` into raw PCM (s16le, mono) at `sample_rate`.
    async fn synthesize(&self, text: &str, sample_rate: u32) -> Result<Vec<u8>, VoiceError>;
}

/// Checks text before it is sent to a synthesis backend.
pub fn validate_tts_input(text: &str) -> Result<(), VoiceError> {
    if text.trim().is_empty() {
        return Err(VoiceError::Tts("text is empty".to_string()));
    }
    if text.len() > MAX_TTS_INPUT_BYTES {
        return Err(VoiceError::Tts(format!(
            "text exceeds maximum size: {} bytes (limit: {} bytes)",
            text.len(),
            MAX_TTS_INPUT_BYTES
        )));
    }
    Ok(())
}

/// Cartesia's `/tts/bytes` endpoint with raw PCM output.
#[derive(Debug, Clone)]
pub struct CartesiaTts {
    config: TtsConfig,
    client: reqwest::Client,
}

impl CartesiaTts {
    pub fn new(config: TtsConfig) -> Result<Self, VoiceError> {
        let client = reqwest::Client::builder().timeout(TTS_TIMEOUT).build()?;
        Ok(Self { config, client })
    }

    fn request_body(&self, text: &str, sample_rate: u32) -> serde_json::Value {
        json!({
            "model_id": self.config.model,
            "transcript": text,
            "voice": {"mode": "id", "id": self.config.voice_id},
            "output_format": {
                "container": "raw",
                "encoding": "pcm_s16le",
                "sample_rate": sample_rate,
            },
            "language": self.config.language,
        })
    }
}

#[async_trait]
impl TextToSpeech for CartesiaTts {
    async fn synthesize(&self, text: &str, sample_rate: u32) -> Result<Vec<u8>, VoiceError> {
        validate_tts_input(text)?;

        let url = format!("{}/tts/bytes", self.config.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .header("X-API-Key", &self.config.api_key)
            .header("Cartesia-Version", &self.config.api_version)
            .json(&self.request_body(text, sample_rate))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::Tts(format!(
                "Cartesia returned {}: {}",
                status, body
            )));
        }

        let audio = response.bytes().await?;
        if audio.len() % 2 != 0 {
            return Err(VoiceError::Tts(format!(
                "Cartesia returned {} bytes, not whole 16-bit samples",
                audio.len()
            )));
        }
        Ok(audio.to_vec())
    }
}
