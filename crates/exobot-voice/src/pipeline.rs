//! The per-call voice pipeline.
//!
//! A [`CallSession`] owns one phone call: caller audio goes to the speech
//! recognizer and the VAD, completed user turns are answered by the language
//! model, and answers are synthesized sentence by sentence and streamed back
//! to Exotel in real time. Bot turns run as separate tasks so that the caller
//! can barge in; an interrupted turn is aborted and Exotel is told to drop the
//! audio it still has buffered.

use crate::audio;
use crate::config::VadConfig;
use crate::context::{ConversationContext, SentenceAggregator, UserTurnAggregator};
use crate::error::VoiceError;
use crate::llm::LanguageModel;
use crate::metrics::{CallMetrics, TurnMetrics};
use crate::serializer::{ExotelSerializer, InboundFrame};
use crate::stt::{SpeechToText, SttEvent};
use crate::tts::TextToSpeech;
use crate::vad::{VadAnalyzer, VadEvent};
use exobot_types::ChatMessage;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Caller audio buffered for the recognizer before chunks are dropped.
const STT_AUDIO_BUFFER: usize = 256;

/// Longest the loop sleeps when nothing is scheduled.
const MAX_TICK: Duration = Duration::from_secs(1);

/// Grace period for the recognizer to close after the call ends.
const STT_SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Behaviour of a call session.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Sample rate the pipeline works at.
    pub sample_rate: u32,
    pub system_prompt: String,
    /// Spoken when the call connects. Empty means no greeting.
    pub greeting: String,
    pub allow_interruptions: bool,
    /// `None` disables voice activity detection.
    pub vad: Option<VadConfig>,
    pub enable_metrics: bool,
    pub enable_usage_metrics: bool,
    /// `None` disables the idle timeout.
    pub idle_timeout: Option<Duration>,
    pub user_turn_timeout: Duration,
    /// Duration of each outgoing media frame.
    pub output_chunk: Duration,
    pub max_context_messages: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            sample_rate: 8000,
            system_prompt: "You are a helpful voice assistant on a phone call. \
                Keep answers short and conversational."
                .to_string(),
            greeting: "Hello! How can I help you today?".to_string(),
            allow_interruptions: true,
            vad: Some(VadConfig::default()),
            enable_metrics: true,
            enable_usage_metrics: true,
            idle_timeout: Some(Duration::from_secs(300)),
            user_turn_timeout: Duration::from_millis(800),
            output_chunk: Duration::from_millis(100),
            max_context_messages: 40,
        }
    }
}

/// The speech, language and synthesis backends shared by all calls.
#[derive(Clone)]
pub struct SessionServices {
    pub stt: Arc<dyn SpeechToText>,
    pub llm: Arc<dyn LanguageModel>,
    pub tts: Arc<dyn TextToSpeech>,
}

impl fmt::Debug for SessionServices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionServices").finish_non_exhaustive()
    }
}

/// Why a call session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// Exotel sent `stop`.
    Stopped(String),
    /// The websocket went away.
    Disconnected,
    IdleTimeout,
    /// The speech recognizer closed its stream.
    SttClosed,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stopped(reason) => write!(f, "stopped ({})", reason),
            Self::Disconnected => f.write_str("disconnected"),
            Self::IdleTimeout => f.write_str("idle timeout"),
            Self::SttClosed => f.write_str("speech recognizer closed"),
        }
    }
}

/// Outcome of a finished call.
#[derive(Debug, Clone)]
pub struct CallSummary {
    pub call_sid: String,
    pub stream_sid: String,
    pub reason: EndReason,
    pub duration: Duration,
    pub metrics: CallMetrics,
    /// Conversation history without the system prompt.
    pub transcript: Vec<ChatMessage>,
}

enum TurnRequest {
    Say(String),
    Respond(Vec<ChatMessage>),
}

enum BotEvent {
    /// A sentence was streamed out completely.
    Spoke { turn: u64, text: String },
    Finished { turn: u64, metrics: TurnMetrics },
    Failed { turn: u64, error: VoiceError },
}

struct ActiveTurn {
    id: u64,
    handle: JoinHandle<()>,
    spoken: Vec<String>,
    /// Whether spoken sentences go into the context when the turn ends.
    commit: bool,
}

struct SessionState {
    context: ConversationContext,
    aggregator: UserTurnAggregator,
    vad: Option<VadAnalyzer>,
    active: Option<ActiveTurn>,
    /// User turns that completed while the bot could not be interrupted.
    pending_user: Vec<String>,
    next_turn: u64,
    metrics: CallMetrics,
    last_activity: Instant,
}

/// One phone call.
pub struct CallSession {
    serializer: ExotelSerializer,
    settings: SessionSettings,
    services: SessionServices,
    output: mpsc::Sender<String>,
}

impl CallSession {
    /// `output` receives serialized Exotel frames to write to the socket.
    pub fn new(
        serializer: ExotelSerializer,
        settings: SessionSettings,
        services: SessionServices,
        output: mpsc::Sender<String>,
    ) -> Self {
        Self {
            serializer,
            settings,
            services,
            output,
        }
    }

    /// Runs the call until it ends. Frames are read from `inbound`; closing
    /// it counts as a disconnect.
    pub async fn run(
        self,
        mut inbound: mpsc::Receiver<InboundFrame>,
    ) -> Result<CallSummary, VoiceError> {
        let started = Instant::now();
        let call_sid = self.serializer.call_sid().to_string();
        let sample_rate = self.settings.sample_rate;

        if let Some(vad) = &self.settings.vad {
            vad.validate()?;
        }

        let (stt_audio_tx, stt_audio_rx) = mpsc::channel::<Vec<u8>>(STT_AUDIO_BUFFER);
        let (stt_events_tx, mut stt_events) = mpsc::channel::<SttEvent>(64);
        let mut stt_task = self
            .services
            .stt
            .start(sample_rate, stt_audio_rx, stt_events_tx)
            .await?;

        let (bot_tx, mut bot_rx) = mpsc::channel::<BotEvent>(64);

        let mut state = SessionState {
            context: ConversationContext::new(
                self.settings.system_prompt.clone(),
                self.settings.max_context_messages,
            ),
            aggregator: UserTurnAggregator::new(self.settings.user_turn_timeout),
            vad: self
                .settings
                .vad
                .as_ref()
                .map(|cfg| VadAnalyzer::new(cfg, sample_rate)),
            active: None,
            pending_user: Vec::new(),
            next_turn: 0,
            metrics: CallMetrics::default(),
            last_activity: Instant::now(),
        };

        info!(
            call_sid = %call_sid,
            stream_sid = %self.serializer.stream_sid(),
            vad = state.vad.is_some(),
            interruptions = self.settings.allow_interruptions,
            "call session started"
        );

        let greeting = self.settings.greeting.trim().to_string();
        if !greeting.is_empty() {
            state.context.push_assistant(greeting.clone());
            self.start_turn(&mut state, TurnRequest::Say(greeting), false, &bot_tx);
        }

        let reason = loop {
            let wake = self.next_wake(&state);

            tokio::select! {
                frame = inbound.recv() => match frame {
                    None => break EndReason::Disconnected,
                    Some(InboundFrame::Stop { reason }) => break EndReason::Stopped(reason),
                    Some(InboundFrame::Audio(pcm)) => {
                        self.on_audio(&mut state, pcm, &stt_audio_tx, &mut bot_rx).await;
                    }
                    Some(InboundFrame::Dtmf(digit)) => {
                        info!(call_sid = %call_sid, digit = %digit, "DTMF received");
                        state.metrics.record_dtmf(&digit);
                        state.last_activity = Instant::now();
                    }
                    Some(InboundFrame::Mark(name)) => {
                        debug!(call_sid = %call_sid, mark = %name, "playback reached mark");
                    }
                },
                event = stt_events.recv() => match event {
                    None => break EndReason::SttClosed,
                    Some(SttEvent::Transcript { text, is_final, speech_final }) => {
                        self.on_transcript(&mut state, &text, is_final, speech_final, &mut bot_rx)
                            .await;
                    }
                },
                Some(event) = bot_rx.recv() => {
                    self.on_bot_event(&mut state, event, &bot_tx);
                }
                () = tokio::time::sleep_until(tokio::time::Instant::from_std(wake)) => {}
            }

            if let Some(text) = state.aggregator.poll(Instant::now()) {
                self.on_user_turn(&mut state, text, &bot_tx, &mut bot_rx)
                    .await;
            }

            if let Some(idle) = self.settings.idle_timeout {
                if state.active.is_none() && state.last_activity.elapsed() >= idle {
                    break EndReason::IdleTimeout;
                }
            }
        };

        if let Some(turn) = state.active.take() {
            turn.handle.abort();
        }
        drop(stt_audio_tx);
        drop(stt_events);
        if tokio::time::timeout(STT_SHUTDOWN_GRACE, &mut stt_task)
            .await
            .is_err()
        {
            debug!(call_sid = %call_sid, "speech recognizer did not close in time");
            stt_task.abort();
        }

        let duration = started.elapsed();
        info!(
            call_sid = %call_sid,
            reason = %reason,
            duration_secs = duration.as_secs_f64(),
            "call session ended"
        );
        state.metrics.log_summary(
            &call_sid,
            self.settings.enable_metrics,
            self.settings.enable_usage_metrics,
        );

        Ok(CallSummary {
            call_sid,
            stream_sid: self.serializer.stream_sid().to_string(),
            reason,
            duration,
            metrics: state.metrics,
            transcript: state.context.history().to_vec(),
        })
    }

    fn next_wake(&self, state: &SessionState) -> Instant {
        let now = Instant::now();
        let mut wake = now + MAX_TICK;
        if let Some(deadline) = state.aggregator.deadline() {
            wake = wake.min(deadline);
        }
        if let (Some(idle), None) = (self.settings.idle_timeout, &state.active) {
            wake = wake.min(state.last_activity + idle);
        }
        wake.max(now)
    }

    async fn on_audio(
        &self,
        state: &mut SessionState,
        pcm: Vec<u8>,
        stt_audio: &mpsc::Sender<Vec<u8>>,
        bot_rx: &mut mpsc::Receiver<BotEvent>,
    ) {
        let vad_event = state.vad.as_mut().and_then(|vad| vad.process(&pcm));

        if let Err(mpsc::error::TrySendError::Full(_)) = stt_audio.try_send(pcm) {
            warn!(
                call_sid = %self.serializer.call_sid(),
                "speech recognizer is falling behind, dropping audio"
            );
        }

        match vad_event {
            Some(VadEvent::UserStartedSpeaking) => {
                debug!(call_sid = %self.serializer.call_sid(), "user started speaking");
                state.aggregator.on_user_started_speaking();
                state.last_activity = Instant::now();
                if self.settings.allow_interruptions && state.active.is_some() {
                    self.interrupt(state, bot_rx).await;
                }
            }
            Some(VadEvent::UserStoppedSpeaking) => {
                debug!(call_sid = %self.serializer.call_sid(), "user stopped speaking");
                state.aggregator.on_user_stopped_speaking();
                state.last_activity = Instant::now();
            }
            None => {}
        }
    }

    async fn on_transcript(
        &self,
        state: &mut SessionState,
        text: &str,
        is_final: bool,
        speech_final: bool,
        bot_rx: &mut mpsc::Receiver<BotEvent>,
    ) {
        let now = Instant::now();
        if !text.is_empty() {
            debug!(
                call_sid = %self.serializer.call_sid(),
                text = %text,
                is_final,
                "transcript"
            );
            state.last_activity = now;
            // Without a VAD, recognized speech is the only barge-in signal.
            if state.vad.is_none() && self.settings.allow_interruptions && state.active.is_some()
            {
                self.interrupt(state, bot_rx).await;
            }
        }
        state
            .aggregator
            .on_transcript(text, is_final, speech_final, now);
    }

    async fn on_user_turn(
        &self,
        state: &mut SessionState,
        text: String,
        bot_tx: &mpsc::Sender<BotEvent>,
        bot_rx: &mut mpsc::Receiver<BotEvent>,
    ) {
        info!(call_sid = %self.serializer.call_sid(), text = %text, "user turn");
        state.metrics.user_turns += 1;
        state.pending_user.push(text);

        if state.active.is_some() {
            if self.settings.allow_interruptions {
                self.interrupt(state, bot_rx).await;
            } else {
                debug!(
                    call_sid = %self.serializer.call_sid(),
                    "bot is speaking, queueing user turn"
                );
                return;
            }
        }
        self.respond(state, bot_tx);
    }

    /// Starts a bot response to everything the user said since the last one.
    fn respond(&self, state: &mut SessionState, bot_tx: &mpsc::Sender<BotEvent>) {
        if state.pending_user.is_empty() {
            return;
        }
        for text in state.pending_user.drain(..) {
            state.context.push_user(text);
        }
        let messages = state.context.messages();
        self.start_turn(state, TurnRequest::Respond(messages), true, bot_tx);
    }

    fn on_bot_event(
        &self,
        state: &mut SessionState,
        event: BotEvent,
        bot_tx: &mpsc::Sender<BotEvent>,
    ) {
        let active_id = state.active.as_ref().map(|t| t.id);
        match event {
            BotEvent::Spoke { turn, text } => {
                if let Some(active) = state.active.as_mut().filter(|_| active_id == Some(turn)) {
                    active.spoken.push(text);
                    state.last_activity = Instant::now();
                }
            }
            BotEvent::Finished { turn, metrics } => {
                if active_id != Some(turn) {
                    return;
                }
                self.finish_turn(state);
                if self.settings.enable_metrics {
                    info!(
                        call_sid = %self.serializer.call_sid(),
                        turn,
                        llm_ttfb_ms = metrics.llm_ttfb.map(|d| d.as_millis() as u64),
                        tts_ttfb_ms = metrics.tts_ttfb.map(|d| d.as_millis() as u64),
                        "turn metrics"
                    );
                }
                if self.settings.enable_usage_metrics {
                    if let Some(usage) = metrics.usage {
                        info!(
                            call_sid = %self.serializer.call_sid(),
                            turn,
                            prompt_tokens = usage.prompt_tokens,
                            completion_tokens = usage.completion_tokens,
                            tts_characters = metrics.tts_characters,
                            "turn usage"
                        );
                    }
                }
                state.metrics.record_turn(&metrics);
                self.respond(state, bot_tx);
            }
            BotEvent::Failed { turn, error } => {
                if active_id != Some(turn) {
                    return;
                }
                error!(
                    call_sid = %self.serializer.call_sid(),
                    turn,
                    "bot turn failed: {}",
                    error
                );
                self.finish_turn(state);
                self.respond(state, bot_tx);
            }
        }
    }

    fn finish_turn(&self, state: &mut SessionState) {
        if let Some(turn) = state.active.take() {
            if turn.commit && !turn.spoken.is_empty() {
                state.context.push_assistant(turn.spoken.join(" "));
            }
            state.last_activity = Instant::now();
        }
    }

    /// Aborts the active bot turn and flushes Exotel's playback buffer.
    async fn interrupt(&self, state: &mut SessionState, bot_rx: &mut mpsc::Receiver<BotEvent>) {
        let Some(mut turn) = state.active.take() else {
            return;
        };
        turn.handle.abort();

        // Sentences reported before the abort were heard by the caller.
        while let Ok(event) = bot_rx.try_recv() {
            if let BotEvent::Spoke { turn: id, text } = event {
                if id == turn.id {
                    turn.spoken.push(text);
                }
            }
        }
        if turn.commit && !turn.spoken.is_empty() {
            state.context.push_assistant(turn.spoken.join(" "));
        }

        state.metrics.interruptions += 1;
        info!(
            call_sid = %self.serializer.call_sid(),
            turn = turn.id,
            "user interrupted the bot"
        );

        match self.serializer.serialize_clear() {
            Ok(frame) => {
                if self.output.send(frame).await.is_err() {
                    debug!("output closed before clear could be sent");
                }
            }
            Err(e) => error!("failed to encode clear frame: {}", e),
        }
    }

    fn start_turn(
        &self,
        state: &mut SessionState,
        request: TurnRequest,
        commit: bool,
        bot_tx: &mpsc::Sender<BotEvent>,
    ) {
        state.next_turn += 1;
        let id = state.next_turn;

        let worker = TurnWorker {
            id,
            llm: self.services.llm.clone(),
            tts: self.services.tts.clone(),
            serializer: self.serializer.clone(),
            output: self.output.clone(),
            events: bot_tx.clone(),
            sample_rate: self.settings.sample_rate,
            chunk_bytes: audio::bytes_for(self.settings.output_chunk, self.settings.sample_rate),
        };
        let handle = tokio::spawn(worker.run(request));

        state.active = Some(ActiveTurn {
            id,
            handle,
            spoken: Vec::new(),
            commit,
        });
        state.last_activity = Instant::now();
    }
}

/// Produces the audio of one bot turn.
struct TurnWorker {
    id: u64,
    llm: Arc<dyn LanguageModel>,
    tts: Arc<dyn TextToSpeech>,
    serializer: ExotelSerializer,
    output: mpsc::Sender<String>,
    events: mpsc::Sender<BotEvent>,
    sample_rate: u32,
    chunk_bytes: usize,
}

impl TurnWorker {
    async fn run(self, request: TurnRequest) {
        let mut metrics = TurnMetrics::default();
        let result = match request {
            TurnRequest::Say(text) => self.speak(&text, &mut metrics).await,
            TurnRequest::Respond(messages) => self.respond(messages, &mut metrics).await,
        };
        // Exotel echoes the mark back once playback reaches it.
        let result = match result {
            Ok(()) => self.mark_end().await,
            Err(e) => Err(e),
        };
        let event = match result {
            Ok(()) => BotEvent::Finished {
                turn: self.id,
                metrics,
            },
            Err(error) => BotEvent::Failed {
                turn: self.id,
                error,
            },
        };
        let _ = self.events.send(event).await;
    }

    async fn respond(
        &self,
        messages: Vec<ChatMessage>,
        metrics: &mut TurnMetrics,
    ) -> Result<(), VoiceError> {
        let (tokens_tx, mut tokens_rx) = mpsc::channel::<String>(64);
        let llm = self.llm.clone();
        let requested = Instant::now();

        let completion = async move { llm.stream_chat(&messages, tokens_tx).await };

        let speech = async {
            let mut sentences = SentenceAggregator::new();
            while let Some(token) = tokens_rx.recv().await {
                if metrics.llm_ttfb.is_none() {
                    metrics.llm_ttfb = Some(requested.elapsed());
                }
                for sentence in sentences.push(&token) {
                    self.speak(&sentence, metrics).await?;
                }
            }
            if let Some(rest) = sentences.flush() {
                self.speak(&rest, metrics).await?;
            }
            Ok::<(), VoiceError>(())
        };

        let (usage, spoken) = tokio::join!(completion, speech);
        spoken?;
        metrics.usage = usage?;
        Ok(())
    }

    async fn speak(&self, text: &str, metrics: &mut TurnMetrics) -> Result<(), VoiceError> {
        let requested = Instant::now();
        let pcm = self.tts.synthesize(text, self.sample_rate).await?;
        if metrics.tts_ttfb.is_none() {
            metrics.tts_ttfb = Some(requested.elapsed());
        }
        metrics.tts_characters += text.chars().count() as u64;

        self.play(&pcm).await?;

        let _ = self
            .events
            .send(BotEvent::Spoke {
                turn: self.id,
                text: text.to_string(),
            })
            .await;
        Ok(())
    }

    async fn mark_end(&self) -> Result<(), VoiceError> {
        let frame = self
            .serializer
            .serialize_mark(&format!("bot-turn-{}", self.id))?;
        self.output
            .send(frame)
            .await
            .map_err(|_| VoiceError::Transport("output channel closed".to_string()))
    }

    /// Streams audio out at playback speed so that an interruption can stop
    /// it with little audio left queued at Exotel.
    async fn play(&self, pcm: &[u8]) -> Result<(), VoiceError> {
        for chunk in pcm.chunks(self.chunk_bytes.max(audio::BYTES_PER_SAMPLE)) {
            let frame = self.serializer.serialize_audio(chunk)?;
            self.output
                .send(frame)
                .await
                .map_err(|_| VoiceError::Transport("output channel closed".to_string()))?;
            tokio::time::sleep(audio::duration_of(chunk.len(), self.sample_rate)).await;
        }
        Ok(())
    }
}
