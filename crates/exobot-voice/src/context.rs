//! Conversation history and the aggregators that decide when a user turn is
//! over and where bot sentences end.

use exobot_types::{ChatMessage, ChatRole};
use std::time::{Duration, Instant};

/// System prompt plus a bounded message history.
#[derive(Debug, Clone)]
pub struct ConversationContext {
    system: ChatMessage,
    history: Vec<ChatMessage>,
    max_messages: usize,
}

impl ConversationContext {
    /// `max_messages` bounds the history, excluding the system prompt.
    /// Zero means unbounded.
    pub fn new(system_prompt: impl Into<String>, max_messages: usize) -> Self {
        Self {
            system: ChatMessage::system(system_prompt),
            history: Vec::new(),
            max_messages,
        }
    }

    pub fn push_user(&mut self, text: impl Into<String>) {
        self.push(ChatMessage::user(text));
    }

    pub fn push_assistant(&mut self, text: impl Into<String>) {
        self.push(ChatMessage::assistant(text));
    }

    /// Consecutive messages from the same speaker are merged so the model
    /// never sees two user turns in a row.
    fn push(&mut self, message: ChatMessage) {
        if message.content.trim().is_empty() {
            return;
        }
        match self.history.last_mut() {
            Some(last) if last.role == message.role && message.role != ChatRole::System => {
                last.content.push(' ');
                last.content.push_str(&message.content);
            }
            _ => self.history.push(message),
        }
        if self.max_messages > 0 && self.history.len() > self.max_messages {
            let excess = self.history.len() - self.max_messages;
            self.history.drain(..excess);
        }
    }

    /// Messages to send to the language model, system prompt first.
    pub fn messages(&self) -> Vec<ChatMessage> {
        let mut out = Vec::with_capacity(self.history.len() + 1);
        out.push(self.system.clone());
        out.extend(self.history.iter().cloned());
        out
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }
}

/// Collects transcripts until the user has finished a turn.
#[derive(Debug, Clone)]
pub struct UserTurnAggregator {
    finals: Vec<String>,
    user_speaking: bool,
    endpoint: bool,
    last_final_at: Option<Instant>,
    timeout: Duration,
}

impl UserTurnAggregator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            finals: Vec::new(),
            user_speaking: false,
            endpoint: false,
            last_final_at: None,
            timeout,
        }
    }

    pub fn on_user_started_speaking(&mut self) {
        self.user_speaking = true;
        self.endpoint = false;
    }

    pub fn on_user_stopped_speaking(&mut self) {
        self.user_speaking = false;
        self.endpoint = true;
    }

    pub fn on_transcript(&mut self, text: &str, is_final: bool, speech_final: bool, now: Instant) {
        let text = text.trim();
        if is_final && !text.is_empty() {
            self.finals.push(text.to_string());
            self.last_final_at = Some(now);
        }
        // An endpoint with nothing buffered belongs to a turn already released.
        if speech_final && !self.finals.is_empty() {
            self.endpoint = true;
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.finals.is_empty()
    }

    /// When the buffered transcripts will be released by the timeout, if any.
    pub fn deadline(&self) -> Option<Instant> {
        if self.finals.is_empty() || self.user_speaking {
            return None;
        }
        self.last_final_at.map(|at| at + self.timeout)
    }

    /// Releases the completed user turn, if there is one.
    pub fn poll(&mut self, now: Instant) -> Option<String> {
        if self.finals.is_empty() || self.user_speaking {
            return None;
        }
        let timed_out = self
            .last_final_at
            .is_some_and(|at| now.saturating_duration_since(at) >= self.timeout);
        if !(self.endpoint || timed_out) {
            return None;
        }
        let text = self.finals.join(" ");
        self.finals.clear();
        self.endpoint = false;
        self.last_final_at = None;
        Some(text)
    }
}

const SENTENCE_TERMINATORS: [char; 5] = ['.', '!', '?', '\n', '।'];

/// Splits a token stream into sentences for synthesis.
#[derive(Debug, Clone, Default)]
pub struct SentenceAggregator {
    buffer: String,
}

impl SentenceAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a token and returns every sentence it completed.
    pub fn push(&mut self, token: &str) -> Vec<String> {
        self.buffer.push_str(token);

        let mut sentences = Vec::new();
        loop {
            let cut = {
                let mut chars = self.buffer.char_indices().peekable();
                let mut found = None;
                while let Some((idx, c)) = chars.next() {
                    if !SENTENCE_TERMINATORS.contains(&c) {
                        continue;
                    }
                    match chars.peek() {
                        Some((_, next)) if next.is_whitespace() => {
                            found = Some(idx + c.len_utf8());
                            break;
                        }
                        // A newline ends the sentence by itself.
                        None if c == '\n' => {
                            found = Some(idx + c.len_utf8());
                            break;
                        }
                        _ => {}
                    }
                }
                found
            };

            match cut {
                Some(end) => {
                    let sentence = self.buffer[..end].trim().to_string();
                    self.buffer.drain(..end);
                    if !sentence.is_empty() {
                        sentences.push(sentence);
                    }
                }
                None => break,
            }
        }
        sentences
    }

    /// Returns whatever is left once the stream has ended.
    pub fn flush(&mut self) -> Option<String> {
        let rest = self.buffer.trim().to_string();
        self.buffer.clear();
        if rest.is_empty() {
            None
        } else {
            Some(rest)
        }
    }
}
