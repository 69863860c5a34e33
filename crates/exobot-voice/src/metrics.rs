//! Per-call processing and usage metrics.

use serde::Serialize;
use std::time::Duration;
use tracing::info;

/// Token counts reported by the language model for one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// Measurements of a single bot turn.
#[derive(Debug, Clone, Default)]
pub struct TurnMetrics {
    /// Time from request to first LLM token.
    pub llm_ttfb: Option<Duration>,
    /// Time from the first TTS request to the first synthesized audio.
    pub tts_ttfb: Option<Duration>,
    pub usage: Option<TokenUsage>,
    pub tts_characters: u64,
}

/// Aggregated metrics for one call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CallMetrics {
    pub bot_turns: u32,
    pub user_turns: u32,
    pub interruptions: u32,
    pub dtmf_digits: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub tts_characters: u64,
    #[serde(skip)]
    llm_ttfb_total: Duration,
    #[serde(skip)]
    llm_ttfb_samples: u32,
    #[serde(skip)]
    tts_ttfb_total: Duration,
    #[serde(skip)]
    tts_ttfb_samples: u32,
}

impl CallMetrics {
    pub fn record_turn(&mut self, turn: &TurnMetrics) {
        self.bot_turns += 1;
        if let Some(ttfb) = turn.llm_ttfb {
            self.llm_ttfb_total += ttfb;
            self.llm_ttfb_samples += 1;
        }
        if let Some(ttfb) = turn.tts_ttfb {
            self.tts_ttfb_total += ttfb;
            self.tts_ttfb_samples += 1;
        }
        if let Some(usage) = turn.usage {
            self.prompt_tokens += usage.prompt_tokens;
            self.completion_tokens += usage.completion_tokens;
        }
        self.tts_characters += turn.tts_characters;
    }

    pub fn record_dtmf(&mut self, digit: &str) {
        self.dtmf_digits.push_str(digit);
    }

    pub fn avg_llm_ttfb(&self) -> Option<Duration> {
        (self.llm_ttfb_samples > 0).then(|| self.llm_ttfb_total / self.llm_ttfb_samples)
    }

    pub fn avg_tts_ttfb(&self) -> Option<Duration> {
        (self.tts_ttfb_samples > 0).then(|| self.tts_ttfb_total / self.tts_ttfb_samples)
    }

    /// Logs the end-of-call summary.
    pub fn log_summary(&self, call_sid: &str, processing: bool, usage: bool) {
        if processing {
            info!(
                call_sid = %call_sid,
                bot_turns = self.bot_turns,
                user_turns = self.user_turns,
                interruptions = self.interruptions,
                avg_llm_ttfb_ms = self.avg_llm_ttfb().map(|d| d.as_millis() as u64),
                avg_tts_ttfb_ms = self.avg_tts_ttfb().map(|d| d.as_millis() as u64),
                "call processing metrics"
            );
        }
        if usage {
            info!(
                call_sid = %call_sid,
                prompt_tokens = self.prompt_tokens,
                completion_tokens = self.completion_tokens,
                tts_characters = self.tts_characters,
                "call usage metrics"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_turns() {
        let mut metrics = CallMetrics::default();
        metrics.record_turn(&TurnMetrics {
            llm_ttfb: Some(Duration::from_millis(200)),
            tts_ttfb: Some(Duration::from_millis(100)),
            usage: Some(TokenUsage {
                prompt_tokens: 50,
                completion_tokens: 10,
            }),
            tts_characters: 42,
        });
        metrics.record_turn(&TurnMetrics {
            llm_ttfb: Some(Duration::from_millis(400)),
            tts_ttfb: None,
            usage: None,
            tts_characters: 8,
        });

        assert_eq!(metrics.bot_turns, 2);
        assert_eq!(metrics.avg_llm_ttfb(), Some(Duration::from_millis(300)));
        assert_eq!(metrics.avg_tts_ttfb(), Some(Duration::from_millis(100)));
        assert_eq!(metrics.prompt_tokens, 50);
        assert_eq!(metrics.completion_tokens, 10);
        assert_eq!(metrics.tts_characters, 50);
    }

    #[test]
    fn empty_averages_are_none() {
        let metrics = CallMetrics::default();
        assert_eq!(metrics.avg_llm_ttfb(), None);
        assert_eq!(metrics.avg_tts_ttfb(), None);
    }
}
