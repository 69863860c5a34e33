//! Energy based voice activity detection.

use crate::audio;
use crate::config::VadConfig;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    UserStartedSpeaking,
    UserStoppedSpeaking,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum VadState {
    Quiet,
    Starting(Duration),
    Speaking,
    Stopping(Duration),
}

/// Tracks whether the caller is talking, with hysteresis on both edges.
#[derive(Debug, Clone)]
pub struct VadAnalyzer {
    threshold_dbfs: f32,
    start: Duration,
    stop: Duration,
    sample_rate: u32,
    state: VadState,
}

impl VadAnalyzer {
    pub fn new(config: &VadConfig, sample_rate: u32) -> Self {
        Self {
            threshold_dbfs: config.threshold_dbfs,
            start: secs_to_duration(config.start_secs),
            stop: secs_to_duration(config.stop_secs),
            sample_rate,
            state: VadState::Quiet,
        }
    }

    pub fn is_speaking(&self) -> bool {
        matches!(self.state, VadState::Speaking | VadState::Stopping(_))
    }

    /// Feeds one chunk of audio and reports an edge if one was crossed.
    pub fn process(&mut self, pcm: &[u8]) -> Option<VadEvent> {
        let voiced = audio::rms_dbfs(pcm) >= self.threshold_dbfs;
        let len = audio::duration_of(pcm.len(), self.sample_rate);

        match (self.state, voiced) {
            (VadState::Quiet, true) | (VadState::Starting(_), true) => {
                let acc = match self.state {
                    VadState::Starting(acc) => acc + len,
                    _ => len,
                };
                if acc >= self.start {
                    self.state = VadState::Speaking;
                    Some(VadEvent::UserStartedSpeaking)
                } else {
                    self.state = VadState::Starting(acc);
                    None
                }
            }
            (VadState::Quiet, false) | (VadState::Starting(_), false) => {
                self.state = VadState::Quiet;
                None
            }
            (VadState::Speaking, true) | (VadState::Stopping(_), true) => {
                self.state = VadState::Speaking;
                None
            }
            (VadState::Speaking, false) | (VadState::Stopping(_), false) => {
                let acc = match self.state {
                    VadState::Stopping(acc) => acc + len,
                    _ => len,
                };
                if acc >= self.stop {
                    self.state = VadState::Quiet;
                    Some(VadEvent::UserStoppedSpeaking)
                } else {
                    self.state = VadState::Stopping(acc);
                    None
                }
            }
        }
    }
}

/// Whole milliseconds, so that 0.2 s is exactly two 100 ms chunks.
fn secs_to_duration(secs: f32) -> Duration {
    Duration::from_millis((secs.max(0.0) * 1000.0).round() as u64)
}
