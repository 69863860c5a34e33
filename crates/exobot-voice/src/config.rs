use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEEPGRAM_LISTEN_URL: &str = "wss://api.deepgram.com/v1/listen";
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const CARTESIA_BASE_URL: &str = "https://api.cartesia.ai";
pub const CARTESIA_API_VERSION: &str = "2024-06-10";

fn default_stt_model() -> String {
    "nova-2-phonecall".to_string()
}

fn default_stt_language() -> String {
    "en-IN".to_string()
}

fn default_endpointing_ms() -> u32 {
    300
}

fn default_listen_url() -> String {
    DEEPGRAM_LISTEN_URL.to_string()
}

fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_openai_base_url() -> String {
    OPENAI_BASE_URL.to_string()
}

fn default_tts_model() -> String {
    "sonic-2".to_string()
}

fn default_voice_id() -> String {
    // "Indian Lady"
    "3b554273-4299-48b9-9aaf-eefd438e3941".to_string()
}

fn default_tts_language() -> String {
    "en".to_string()
}

fn default_cartesia_base_url() -> String {
    CARTESIA_BASE_URL.to_string()
}

fn default_cartesia_version() -> String {
    CARTESIA_API_VERSION.to_string()
}

/// Deepgram streaming recognition settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct SttConfig {
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_stt_model")]
    pub model: String,
    #[serde(default = "default_stt_language")]
    pub language: String,
    /// Silence in milliseconds after which Deepgram marks `speech_final`.
    #[serde(default = "default_endpointing_ms")]
    pub endpointing_ms: u32,
    #[serde(default = "default_listen_url")]
    pub url: String,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_stt_model(),
            language: default_stt_language(),
            endpointing_ms: default_endpointing_ms(),
            url: default_listen_url(),
        }
    }
}

impl fmt::Debug for SttConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SttConfig")
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("language", &self.language)
            .field("endpointing_ms", &self.endpointing_ms)
            .field("url", &self.url)
            .finish()
    }
}

/// OpenAI chat completion settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_llm_model(),
            base_url: default_openai_base_url(),
            temperature: None,
            max_tokens: None,
        }
    }
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmConfig")
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

/// Cartesia synthesis settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(default, skip_serializing)]
    pub api_key: String,
    #[serde(default = "default_tts_model")]
    pub model: String,
    #[serde(default = "default_voice_id")]
    pub voice_id: String,
    #[serde(default = "default_tts_language")]
    pub language: String,
    #[serde(default = "default_cartesia_base_url")]
    pub base_url: String,
    #[serde(default = "default_cartesia_version")]
    pub api_version: String,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_tts_model(),
            voice_id: default_voice_id(),
            language: default_tts_language(),
            base_url: default_cartesia_base_url(),
            api_version: default_cartesia_version(),
        }
    }
}

impl fmt::Debug for TtsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtsConfig")
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("voice_id", &self.voice_id)
            .field("language", &self.language)
            .field("base_url", &self.base_url)
            .field("api_version", &self.api_version)
            .finish()
    }
}

fn default_vad_enabled() -> bool {
    true
}

fn default_threshold_dbfs() -> f32 {
    -35.0
}

fn default_start_secs() -> f32 {
    0.2
}

fn default_stop_secs() -> f32 {
    0.8
}

/// Voice activity detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VadConfig {
    #[serde(default = "default_vad_enabled")]
    pub enabled: bool,
    /// Chunks at or above this level count as speech.
    #[serde(default = "default_threshold_dbfs")]
    pub threshold_dbfs: f32,
    /// Speech needed before the user is considered to have started talking.
    #[serde(default = "default_start_secs")]
    pub start_secs: f32,
    /// Silence needed before the user is considered to have stopped talking.
    #[serde(default = "default_stop_secs")]
    pub stop_secs: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            enabled: default_vad_enabled(),
            threshold_dbfs: default_threshold_dbfs(),
            start_secs: default_start_secs(),
            stop_secs: default_stop_secs(),
        }
    }
}

impl VadConfig {
    pub fn validate(&self) -> Result<(), crate::VoiceError> {
        if !(self.start_secs >= 0.0 && self.stop_secs >= 0.0) {
            return Err(crate::VoiceError::Config(
                "vad start_secs and stop_secs must be non-negative".to_string(),
            ));
        }
        if self.threshold_dbfs > 0.0 {
            return Err(crate::VoiceError::Config(
                "vad threshold_dbfs must be <= 0".to_string(),
            ));
        }
        Ok(())
    }
}
