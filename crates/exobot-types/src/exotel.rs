//! Exotel Voicebot media-stream protocol.
//!
//! Exotel opens a websocket to the bot and exchanges JSON text frames tagged
//! by an `event` field. Audio travels as base64 encoded 16-bit little-endian
//! mono PCM ("raw/slin").

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// A frame received from Exotel.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum StreamEvent {
    /// Socket established; carries nothing useful.
    Connected,
    /// Stream metadata. Always the first frame that matters.
    Start {
        #[serde(default)]
        stream_sid: Option<String>,
        start: StartPayload,
    },
    /// A chunk of caller audio.
    Media {
        #[serde(default)]
        stream_sid: Option<String>,
        media: MediaPayload,
    },
    /// A keypad press.
    Dtmf {
        #[serde(default)]
        dtmf: DtmfPayload,
    },
    /// Acknowledges a mark we sent once the preceding audio was played.
    Mark {
        #[serde(default)]
        mark: MarkPayload,
    },
    /// The call ended or the stream was closed by Exotel.
    Stop {
        #[serde(default)]
        stop: StopPayload,
    },
    /// Any event this gateway does not act on.
    #[serde(other)]
    Unknown,
}

impl StreamEvent {
    /// Returns the event name, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Start { .. } => "start",
            Self::Media { .. } => "media",
            Self::Dtmf { .. } => "dtmf",
            Self::Mark { .. } => "mark",
            Self::Stop { .. } => "stop",
            Self::Unknown => "unknown",
        }
    }
}

/// Payload of the `start` event.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartPayload {
    #[serde(default)]
    pub stream_sid: Option<String>,
    #[serde(default)]
    pub call_sid: Option<String>,
    #[serde(default)]
    pub account_sid: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub custom_parameters: Option<Value>,
    #[serde(default)]
    pub media_format: Option<MediaFormat>,
}

/// Audio format announced in the `start` event.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaFormat {
    #[serde(default)]
    pub encoding: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub sample_rate: Option<String>,
    #[serde(default)]
    pub bit_rate: Option<String>,
}

impl MediaFormat {
    /// Announced sample rate in Hz, if present and numeric.
    pub fn sample_rate_hz(&self) -> Option<u32> {
        self.sample_rate.as_deref().and_then(|s| s.trim().parse().ok())
    }
}

/// Payload of an incoming `media` event.
#[derive(Debug, Clone, Deserialize)]
pub struct MediaPayload {
    pub payload: String,
    #[serde(default, deserialize_with = "string_or_number")]
    pub chunk: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DtmfPayload {
    #[serde(default, deserialize_with = "string_or_number")]
    pub digit: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub duration: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkPayload {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StopPayload {
    #[serde(default)]
    pub call_sid: Option<String>,
    #[serde(default = "unknown_reason")]
    pub reason: String,
}

impl Default for StopPayload {
    fn default() -> Self {
        Self {
            call_sid: None,
            reason: unknown_reason(),
        }
    }
}

fn unknown_reason() -> String {
    "unknown".to_string()
}

/// Exotel is not consistent about quoting numeric fields.
fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// A frame sent to Exotel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutgoingEvent {
    /// Bot audio to play to the caller.
    Media {
        stream_sid: String,
        media: OutboundMedia,
    },
    /// Discards all bot audio Exotel has buffered but not played yet.
    Clear { stream_sid: String },
    /// Asks Exotel to echo `name` back once everything before it was played.
    Mark {
        stream_sid: String,
        mark: MarkPayload,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundMedia {
    pub payload: String,
}
