//! Shared types for the exobot voice gateway.
//!
//! This crate holds the wire types of the Exotel media-stream protocol and the
//! chat message model passed to the language model. It has no runtime
//! dependencies beyond serde so that both the voice pipeline and the server
//! can depend on it without pulling each other in.

use serde::{Deserialize, Serialize};

pub mod exotel;

pub use exotel::{
    DtmfPayload, MarkPayload, MediaFormat, MediaPayload, OutboundMedia, OutgoingEvent,
    StartPayload, StopPayload, StreamEvent,
};

/// Speaker role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// Instructions that frame the whole conversation.
    System,
    /// The caller.
    User,
    /// The bot.
    Assistant,
}

impl ChatRole {
    /// Returns the wire label for this role.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// A single message of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}
