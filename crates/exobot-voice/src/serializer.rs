//! Converts between Exotel stream frames and pipeline frames.

use crate::audio::{self, EXOTEL_CHUNK_ALIGN};
use crate::error::VoiceError;
use exobot_types::{MarkPayload, OutboundMedia, OutgoingEvent, StreamEvent};

/// A frame flowing from the caller into a call session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    /// Caller audio, s16le mono at the pipeline sample rate.
    Audio(Vec<u8>),
    Dtmf(String),
    Mark(String),
    Stop { reason: String },
}

/// Serializer bound to one Exotel stream.
#[derive(Debug, Clone)]
pub struct ExotelSerializer {
    stream_sid: String,
    call_sid: String,
    exotel_sample_rate: u32,
    sample_rate: u32,
}

impl ExotelSerializer {
    pub fn new(
        stream_sid: impl Into<String>,
        call_sid: impl Into<String>,
        exotel_sample_rate: u32,
        sample_rate: u32,
    ) -> Self {
        Self {
            stream_sid: stream_sid.into(),
            call_sid: call_sid.into(),
            exotel_sample_rate,
            sample_rate,
        }
    }

    pub fn stream_sid(&self) -> &str {
        &self.stream_sid
    }

    pub fn call_sid(&self) -> &str {
        &self.call_sid
    }

    /// Pipeline sample rate.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Decodes one text frame. Returns `Ok(None)` for events the pipeline
    /// does not consume.
    pub fn deserialize(&self, text: &str) -> Result<Option<InboundFrame>, VoiceError> {
        let event: StreamEvent = serde_json::from_str(text)
            .map_err(|e| VoiceError::Codec(format!("invalid Exotel frame: {}", e)))?;

        let frame = match event {
            StreamEvent::Media { media, .. } => {
                let pcm = audio::decode_base64(&media.payload)?;
                Some(InboundFrame::Audio(audio::resample(
                    &pcm,
                    self.exotel_sample_rate,
                    self.sample_rate,
                )))
            }
            StreamEvent::Dtmf { dtmf } => dtmf.digit.map(InboundFrame::Dtmf),
            StreamEvent::Mark { mark } => Some(InboundFrame::Mark(mark.name)),
            StreamEvent::Stop { stop } => Some(InboundFrame::Stop {
                reason: stop.reason,
            }),
            StreamEvent::Connected | StreamEvent::Start { .. } | StreamEvent::Unknown => None,
        };
        Ok(frame)
    }

    /// Encodes pipeline-rate bot audio as a `media` frame.
    pub fn serialize_audio(&self, pcm: &[u8]) -> Result<String, VoiceError> {
        let resampled = audio::resample(pcm, self.sample_rate, self.exotel_sample_rate);
        let padded = audio::pad_to_multiple(resampled, EXOTEL_CHUNK_ALIGN);
        self.encode(OutgoingEvent::Media {
            stream_sid: self.stream_sid.clone(),
            media: OutboundMedia {
                payload: audio::encode_base64(&padded),
            },
        })
    }

    pub fn serialize_clear(&self) -> Result<String, VoiceError> {
        self.encode(OutgoingEvent::Clear {
            stream_sid: self.stream_sid.clone(),
        })
    }

    pub fn serialize_mark(&self, name: &str) -> Result<String, VoiceError> {
        self.encode(OutgoingEvent::Mark {
            stream_sid: self.stream_sid.clone(),
            mark: MarkPayload {
                name: name.to_string(),
            },
        })
    }

    fn encode(&self, event: OutgoingEvent) -> Result<String, VoiceError> {
        serde_json::to_string(&event)
            .map_err(|e| VoiceError::Codec(format!("failed to encode Exotel frame: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn serializer() -> ExotelSerializer {
        ExotelSerializer::new("stream-1", "call-1", 8000, 8000)
    }

    #[test]
    fn media_is_decoded_to_audio() {
        let pcm = vec![1u8, 0, 2, 0];
        let frame = json!({
            "event": "media",
            "stream_sid": "stream-1",
            "media": {"chunk": 3, "timestamp": "60", "payload": audio::encode_base64(&pcm)}
        });
        let decoded = serializer().deserialize(&frame.to_string()).unwrap();
        assert_eq!(decoded, Some(InboundFrame::Audio(pcm)));
    }

    #[test]
    fn media_is_resampled_to_pipeline_rate() {
        let s = ExotelSerializer::new("stream-1", "call-1", 8000, 16000);
        let frame = json!({
            "event": "media",
            "media": {"payload": audio::encode_base64(&[0u8; 320])}
        });
        match s.deserialize(&frame.to_string()).unwrap() {
            Some(InboundFrame::Audio(pcm)) => assert_eq!(pcm.len(), 640),
            other => panic!("expected audio, got {:?}", other),
        }
    }

    #[test]
    fn control_events() {
        let s = serializer();
        assert_eq!(
            s.deserialize(r#"{"event":"dtmf","dtmf":{"digit":"7"}}"#)
                .unwrap(),
            Some(InboundFrame::Dtmf("7".to_string()))
        );
        assert_eq!(
            s.deserialize(r#"{"event":"mark","mark":{"name":"greeting"}}"#)
                .unwrap(),
            Some(InboundFrame::Mark("greeting".to_string()))
        );
        assert_eq!(
            s.deserialize(r#"{"event":"stop","stop":{"reason":"callended"}}"#)
                .unwrap(),
            Some(InboundFrame::Stop {
                reason: "callended".to_string()
            })
        );
        assert_eq!(s.deserialize(r#"{"event":"connected"}"#).unwrap(), None);
    }

    #[test]
    fn malformed_frames_are_errors() {
        let s = serializer();
        assert!(matches!(s.deserialize("{oops"), Err(VoiceError::Codec(_))));
        assert!(matches!(
            s.deserialize(r#"{"event":"media","media":{"payload":"%%%"}}"#),
            Err(VoiceError::Codec(_))
        ));
    }

    #[test]
    fn outgoing_audio_is_padded_and_tagged() {
        let text = serializer().serialize_audio(&[1u8; 100]).unwrap();
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["event"], "media");
        assert_eq!(v["stream_sid"], "stream-1");
        let pcm = audio::decode_base64(v["media"]["payload"].as_str().unwrap()).unwrap();
        assert_eq!(pcm.len(), 320);
    }

    #[test]
    fn outgoing_control_frames() {
        let s = serializer();
        let clear: Value = serde_json::from_str(&s.serialize_clear().unwrap()).unwrap();
        assert_eq!(clear, json!({"event": "clear", "stream_sid": "stream-1"}));
        let mark: Value = serde_json::from_str(&s.serialize_mark("turn-1").unwrap()).unwrap();
        assert_eq!(mark["mark"]["name"], "turn-1");
    }
}
