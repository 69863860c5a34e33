use crate::config::LlmConfig;
use crate::error::VoiceError;
use crate::metrics::TokenUsage;
use async_trait::async_trait;
use exobot_types::ChatMessage;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Upper bound for a whole streamed completion.
const LLM_TIMEOUT: Duration = Duration::from_secs(60);

const LLM_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Streaming chat completion.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Streams the completion for `messages` into `tokens`, returning the
    /// token usage when the provider reports it. Returns early, without
    /// error, once `tokens` has no receiver.
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        tokens: mpsc::Sender<String>,
    ) -> Result<Option<TokenUsage>, VoiceError>;
}

/// OpenAI chat completions with server-sent events.
#[derive(Debug, Clone)]
pub struct OpenAiLlm {
    config: LlmConfig,
    client: reqwest::Client,
}

impl OpenAiLlm {
    pub fn new(config: LlmConfig) -> Result<Self, VoiceError> {
        let client = reqwest::Client::builder()
            .timeout(LLM_TIMEOUT)
            .connect_timeout(LLM_CONNECT_TIMEOUT)
            .build()?;
        Ok(Self { config, client })
    }

    fn request_body(&self, messages: &[ChatMessage]) -> serde_json::Value {
        let mut body = json!({
            "model": self.config.model,
            "messages": messages,
            "stream": true,
            "stream_options": {"include_usage": true},
        });
        if let Some(temperature) = self.config.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = self.config.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        body
    }
}

#[async_trait]
impl LanguageModel for OpenAiLlm {
    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        tokens: mpsc::Sender<String>,
    ) -> Result<Option<TokenUsage>, VoiceError> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&self.request_body(messages))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::Llm(format!(
                "completion request failed with {}: {}",
                status, body
            )));
        }

        let mut decoder = SseDecoder::default();
        let mut usage = None;
        let mut body = response.bytes_stream();

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            for data in decoder.push(&chunk) {
                if data == "[DONE]" {
                    return Ok(usage);
                }
                let parsed: CompletionChunk = match serde_json::from_str(&data) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("skipping unparseable completion chunk: {}", e);
                        continue;
                    }
                };
                if let Some(u) = parsed.usage {
                    usage = Some(TokenUsage {
                        prompt_tokens: u.prompt_tokens,
                        completion_tokens: u.completion_tokens,
                    });
                }
                let content = parsed
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.delta.content)
                    .filter(|c| !c.is_empty());
                if let Some(content) = content {
                    if tokens.send(content).await.is_err() {
                        debug!("completion receiver dropped, abandoning stream");
                        return Ok(usage);
                    }
                }
            }
        }

        Ok(usage)
    }
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<ChunkUsage>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Incremental decoder for `text/event-stream` bodies.
///
/// Yields the payload of every complete `data:` line. Bytes are buffered
/// until a newline arrives so multi-byte characters split across network
/// chunks are decoded intact.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut out = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(data) = line.strip_prefix("data:") {
                out.push(data.trim_start().to_string());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_decoder_handles_split_lines() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"a\"").is_empty());
        assert_eq!(decoder.push(b":1}\n\ndata: [DONE]\n"), vec![
            "{\"a\":1}".to_string(),
            "[DONE]".to_string()
        ]);
    }

    #[test]
    fn sse_decoder_handles_split_utf8_and_crlf() {
        let mut decoder = SseDecoder::default();
        let text = "data: नमस्ते\r\n".as_bytes();
        let (a, b) = text.split_at(9);
        assert!(decoder.push(a).is_empty());
        assert_eq!(decoder.push(b), vec!["नमस्ते".to_string()]);
    }

    #[test]
    fn sse_decoder_ignores_comments_and_other_fields() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b": keep-alive\nevent: ping\n").is_empty());
    }

    #[test]
    fn request_body_includes_optional_parameters() {
        let llm = OpenAiLlm::new(LlmConfig {
            temperature: Some(0.3),
            max_tokens: Some(150),
            ..Default::default()
        })
        .unwrap();
        let body = llm.request_body(&[ChatMessage::system("be brief")]);
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["max_tokens"], 150);
        assert!(body["temperature"].as_f64().is_some());
        assert_eq!(body["messages"][0]["role"], "system");
    }
}
