//! Scripted backends for exercising call sessions without network access.

use crate::audio;
use crate::error::VoiceError;
use crate::llm::LanguageModel;
use crate::metrics::TokenUsage;
use crate::stt::{SpeechToText, SttEvent};
use crate::tts::TextToSpeech;
use async_trait::async_trait;
use exobot_types::ChatMessage;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Audio at or above this level counts as speech.
pub const SPEECH_DBFS: f32 = -35.0;

/// Recognizer that hears `transcript` in every burst of loud audio.
///
/// An interim result is sent when a burst starts and a final, endpointed
/// result when it is followed by quiet audio.
#[derive(Debug, Clone, Default)]
pub struct ScriptedStt {
    transcript: String,
    fail: bool,
    /// Close the stream after this many audio chunks.
    close_after: Option<usize>,
    /// Keep the stream open after the audio channel closes.
    stuck: bool,
    open: Arc<AtomicUsize>,
}

impl ScriptedStt {
    pub fn new(transcript: impl Into<String>) -> Self {
        Self {
            transcript: transcript.into(),
            ..Default::default()
        }
    }

    /// A recognizer that cannot be reached.
    pub fn unavailable() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// A recognizer whose stream dies after `chunks` audio chunks.
    pub fn closing_after(chunks: usize) -> Self {
        Self {
            close_after: Some(chunks),
            ..Default::default()
        }
    }

    /// A recognizer that never finishes its stream on its own.
    pub fn stuck() -> Self {
        Self {
            stuck: true,
            ..Default::default()
        }
    }

    /// Recognition streams whose task is still alive.
    pub fn open_streams(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

/// Counts a stream as open until its task finishes or is aborted.
struct OpenStream(Arc<AtomicUsize>);

impl OpenStream {
    fn new(open: &Arc<AtomicUsize>) -> Self {
        open.fetch_add(1, Ordering::SeqCst);
        Self(open.clone())
    }
}

impl Drop for OpenStream {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SpeechToText for ScriptedStt {
    async fn start(
        &self,
        _sample_rate: u32,
        mut audio: mpsc::Receiver<Vec<u8>>,
        events: mpsc::Sender<SttEvent>,
    ) -> Result<JoinHandle<()>, VoiceError> {
        if self.fail {
            return Err(VoiceError::Stt("connection refused".to_string()));
        }
        let transcript = self.transcript.clone();
        let close_after = self.close_after;
        let stuck = self.stuck;
        let guard = OpenStream::new(&self.open);
        Ok(tokio::spawn(async move {
            let _guard = guard;
            let mut in_burst = false;
            let mut received = 0;
            while let Some(pcm) = audio.recv().await {
                received += 1;
                if close_after.is_some_and(|limit| received >= limit) {
                    return;
                }
                let loud = audio::rms_dbfs(&pcm) >= SPEECH_DBFS;
                let event = match (loud, in_burst) {
                    (true, false) => {
                        in_burst = true;
                        let first_word = transcript.split_whitespace().next().unwrap_or("");
                        SttEvent::Transcript {
                            text: first_word.to_string(),
                            is_final: false,
                            speech_final: false,
                        }
                    }
                    (false, true) => {
                        in_burst = false;
                        SttEvent::Transcript {
                            text: transcript.clone(),
                            is_final: true,
                            speech_final: true,
                        }
                    }
                    _ => continue,
                };
                if events.send(event).await.is_err() {
                    break;
                }
            }
            if stuck {
                std::future::pending::<()>().await;
            }
        }))
    }
}

/// Language model that streams a fixed reply and records every request.
#[derive(Debug, Clone, Default)]
pub struct ScriptedLlm {
    reply: Vec<String>,
    fail: bool,
    requests: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
}

impl ScriptedLlm {
    pub fn new<I, S>(reply: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            reply: reply.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// A model whose every request fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    /// Conversations the model was asked to complete, oldest first.
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        tokens: mpsc::Sender<String>,
    ) -> Result<Option<TokenUsage>, VoiceError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(messages.to_vec());
        }
        if self.fail {
            return Err(VoiceError::Llm("completion request failed with 500".to_string()));
        }
        for token in &self.reply {
            if tokens.send(token.clone()).await.is_err() {
                break;
            }
        }
        Ok(Some(TokenUsage {
            prompt_tokens: 12,
            completion_tokens: self.reply.len() as u64,
        }))
    }
}

/// Synthesizer that returns `len` bytes of constant loud audio per request.
#[derive(Debug, Clone)]
pub struct FixedTts {
    len: usize,
    fail_on: Option<String>,
    texts: Arc<Mutex<Vec<String>>>,
}

impl FixedTts {
    pub fn new(len: usize) -> Self {
        Self {
            len: len - len % audio::BYTES_PER_SAMPLE,
            fail_on: None,
            texts: Arc::default(),
        }
    }

    /// A synthesizer that fails whenever it is asked to speak `text`.
    pub fn failing_on(len: usize, text: impl Into<String>) -> Self {
        Self {
            fail_on: Some(text.into()),
            ..Self::new(len)
        }
    }

    /// Texts synthesized so far.
    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl TextToSpeech for FixedTts {
    async fn synthesize(&self, text: &str, _sample_rate: u32) -> Result<Vec<u8>, VoiceError> {
        crate::tts::validate_tts_input(text)?;
        if let Ok(mut texts) = self.texts.lock() {
            texts.push(text.to_string());
        }
        if self.fail_on.as_deref() == Some(text) {
            return Err(VoiceError::Tts("Cartesia returned 500 Internal Server Error".to_string()));
        }
        Ok([0x00u8, 0x40].repeat(self.len / 2))
    }
}

/// `duration_ms` of audio at `sample_rate`, loud when `speech` is set.
pub fn tone(duration_ms: u64, sample_rate: u32, speech: bool) -> Vec<u8> {
    let len = audio::bytes_for(std::time::Duration::from_millis(duration_ms), sample_rate);
    let sample: [u8; 2] = if speech { [0x00, 0x40] } else { [0x00, 0x00] };
    sample.repeat(len / 2)
}
