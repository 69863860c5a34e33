//! Real-time voice pipeline for Exotel phone calls.
//!
//! Caller audio arrives as Exotel media frames, is transcribed by a streaming
//! speech recognizer, answered by a chat-completion model and spoken back
//! through a text-to-speech backend. [`CallSession`] ties the pieces together
//! for one call; the backends sit behind the [`SpeechToText`],
//! [`LanguageModel`] and [`TextToSpeech`] traits.

pub mod audio;
pub mod config;
pub mod context;
pub mod error;
pub mod llm;
pub mod metrics;
pub mod pipeline;
pub mod serializer;
pub mod stt;
pub mod tts;
pub mod vad;

#[cfg(any(test, feature = "test-mocks"))]
pub mod testing;

pub use config::{LlmConfig, SttConfig, TtsConfig, VadConfig};
pub use context::{ConversationContext, SentenceAggregator, UserTurnAggregator};
pub use error::VoiceError;
pub use llm::{LanguageModel, OpenAiLlm};
pub use metrics::{CallMetrics, TokenUsage, TurnMetrics};
pub use pipeline::{CallSession, CallSummary, EndReason, SessionServices, SessionSettings};
pub use serializer::{ExotelSerializer, InboundFrame};
pub use stt::{DeepgramStt, SpeechToText, SttEvent};
pub use tts::{CartesiaTts, TextToSpeech};
pub use vad::{VadAnalyzer, VadEvent};
