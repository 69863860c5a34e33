use crate::config::SttConfig;
use crate::error::VoiceError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header::AUTHORIZATION, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Timeout for opening the recognition stream.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Deepgram closes idle streams after roughly 10 seconds without data.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

const KEEPALIVE_MESSAGE: &str = r#"{"type":"KeepAlive"}"#;
const CLOSE_STREAM_MESSAGE: &str = r#"{"type":"CloseStream"}"#;

/// A recognition result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SttEvent {
    Transcript {
        text: String,
        /// The text for this span of audio will not change any more.
        is_final: bool,
        /// The recognizer detected the end of an utterance.
        speech_final: bool,
    },
}

/// Streaming speech recognition.
///
/// `start` opens one recognition stream for a call. Audio pushed into
/// `audio` is recognized and results are sent to `events`; dropping the
/// audio sender finishes the stream. The returned task ends, and drops
/// `events`, when the stream is closed or fails.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn start(
        &self,
        sample_rate: u32,
        audio: mpsc::Receiver<Vec<u8>>,
        events: mpsc::Sender<SttEvent>,
    ) -> Result<JoinHandle<()>, VoiceError>;
}

/// Deepgram live transcription over a websocket.
#[derive(Debug, Clone)]
pub struct DeepgramStt {
    config: SttConfig,
}

impl DeepgramStt {
    pub fn new(config: SttConfig) -> Self {
        Self { config }
    }

    pub fn listen_url(&self, sample_rate: u32) -> Result<String, VoiceError> {
        let url = reqwest::Url::parse_with_params(
            &self.config.url,
            &[
                ("model", self.config.model.clone()),
                ("language", self.config.language.clone()),
                ("encoding", "linear16".to_string()),
                ("sample_rate", sample_rate.to_string()),
                ("channels", "1".to_string()),
                ("interim_results", "true".to_string()),
                ("smart_format", "true".to_string()),
                ("punctuate", "true".to_string()),
                ("endpointing", self.config.endpointing_ms.to_string()),
            ],
        )
        .map_err(|e| VoiceError::Config(format!("invalid Deepgram URL: {}", e)))?;
        Ok(url.to_string())
    }
}

#[async_trait]
impl SpeechToText for DeepgramStt {
    async fn start(
        &self,
        sample_rate: u32,
        audio: mpsc::Receiver<Vec<u8>>,
        events: mpsc::Sender<SttEvent>,
    ) -> Result<JoinHandle<()>, VoiceError> {
        if self.config.api_key.is_empty() {
            return Err(VoiceError::Config("Deepgram API key is not set".to_string()));
        }

        let url = self.listen_url(sample_rate)?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| VoiceError::Stt(format!("invalid Deepgram request: {}", e)))?;
        let auth = HeaderValue::from_str(&format!("Token {}", self.config.api_key))
            .map_err(|e| VoiceError::Config(format!("invalid Deepgram API key: {}", e)))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        let (socket, _) = tokio::time::timeout(
            CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| {
            VoiceError::Stt(format!(
                "Deepgram connection timed out after {} seconds",
                CONNECT_TIMEOUT.as_secs()
            ))
        })?
        .map_err(|e| VoiceError::Stt(format!("Deepgram connection failed: {}", e)))?;

        info!(model = %self.config.model, sample_rate, "Deepgram stream opened");

        let (mut sink, mut stream) = socket.split();

        let handle = tokio::spawn(async move {
            let writer = tokio::spawn(async move {
                let mut audio = audio;
                loop {
                    tokio::select! {
                        chunk = audio.recv() => match chunk {
                            Some(pcm) => {
                                if let Err(e) = sink.send(Message::Binary(pcm.into())).await {
                                    warn!("failed to send audio to Deepgram: {}", e);
                                    return;
                                }
                            }
                            None => {
                                let _ = sink
                                    .send(Message::Text(CLOSE_STREAM_MESSAGE.to_string().into()))
                                    .await;
                                return;
                            }
                        },
                        () = tokio::time::sleep(KEEPALIVE_INTERVAL) => {
                            if let Err(e) = sink
                                .send(Message::Text(KEEPALIVE_MESSAGE.to_string().into()))
                                .await
                            {
                                warn!("failed to send Deepgram keepalive: {}", e);
                                return;
                            }
                        }
                    }
                }
            });

            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if let Some(event) = parse_deepgram_message(text.as_str()) {
                            if events.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        debug!(?frame, "Deepgram closed the stream");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Deepgram stream error: {}", e);
                        break;
                    }
                }
            }

            writer.abort();
        });

        Ok(handle)
    }
}

#[derive(Debug, Deserialize)]
struct DeepgramMessage {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    channel: Option<DeepgramChannel>,
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    speech_final: bool,
}

#[derive(Debug, Deserialize)]
struct DeepgramChannel {
    #[serde(default)]
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(Debug, Deserialize)]
struct DeepgramAlternative {
    #[serde(default)]
    transcript: String,
}

/// Converts one Deepgram message into a recognition event.
///
/// `Results` with text become transcripts; a `Results` without text still
/// carries an endpoint when `speech_final` is set. `UtteranceEnd` is an
/// endpoint. Everything else (`Metadata`, `SpeechStarted`) is dropped.
pub fn parse_deepgram_message(text: &str) -> Option<SttEvent> {
    let message: DeepgramMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            warn!("unparseable Deepgram message: {}", e);
            return None;
        }
    };

    match message.kind.as_str() {
        "Results" => {
            let transcript = message
                .channel
                .and_then(|c| c.alternatives.into_iter().next())
                .map(|a| a.transcript.trim().to_string())
                .unwrap_or_default();
            if transcript.is_empty() && !message.speech_final {
                return None;
            }
            Some(SttEvent::Transcript {
                text: transcript,
                is_final: message.is_final,
                speech_final: message.speech_final,
            })
        }
        "UtteranceEnd" => Some(SttEvent::Transcript {
            text: String::new(),
            is_final: false,
            speech_final: true,
        }),
        _ => None,
    }
}
