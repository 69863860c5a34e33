use exobot_types::{ChatMessage, ChatRole};
use exobot_voice::testing::{tone, FixedTts, ScriptedLlm, ScriptedStt};
use exobot_voice::{
    CallSession, CallSummary, EndReason, ExotelSerializer, InboundFrame, SessionServices,
    SessionSettings, VadConfig, VoiceError,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const RATE: u32 = 8000;

struct Call {
    inbound: mpsc::Sender<InboundFrame>,
    output: mpsc::Receiver<String>,
    session: JoinHandle<Result<CallSummary, VoiceError>>,
}

impl Call {
    fn start(settings: SessionSettings, services: SessionServices) -> Self {
        let (out_tx, output) = mpsc::channel(512);
        let (inbound, in_rx) = mpsc::channel(64);
        let serializer = ExotelSerializer::new("stream-1", "call-1", RATE, RATE);
        let session = CallSession::new(serializer, settings, services, out_tx);
        Self {
            inbound,
            output,
            session: tokio::spawn(session.run(in_rx)),
        }
    }

    async fn next_frame(&mut self) -> Value {
        let text = tokio::time::timeout(Duration::from_secs(3), self.output.recv())
            .await
            .expect("timed out waiting for an outgoing frame")
            .expect("output closed");
        serde_json::from_str(&text).expect("outgoing frame is JSON")
    }

    /// Collects frames up to and including the end mark of `turn`.
    async fn frames_until_mark(&mut self, turn: u64) -> Vec<Value> {
        let name = format!("bot-turn-{}", turn);
        let mut frames = Vec::new();
        loop {
            let frame = self.next_frame().await;
            let done = frame["event"] == "mark" && frame["mark"]["name"] == name.as_str();
            frames.push(frame);
            if done {
                return frames;
            }
        }
    }

    async fn say(&self, chunks: &[(u64, bool)]) {
        for &(ms, speech) in chunks {
            self.inbound
                .send(InboundFrame::Audio(tone(ms, RATE, speech)))
                .await
                .unwrap();
        }
    }

    async fn stop(self) -> CallSummary {
        self.inbound
            .send(InboundFrame::Stop {
                reason: "callended".to_string(),
            })
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(3), self.session)
            .await
            .expect("session did not end")
            .unwrap()
            .expect("session failed")
    }
}

fn settings() -> SessionSettings {
    SessionSettings {
        system_prompt: "You answer questions about the shop.".to_string(),
        greeting: "Hello there.".to_string(),
        vad: None,
        idle_timeout: None,
        ..Default::default()
    }
}

fn services(stt: ScriptedStt, llm: &ScriptedLlm, tts: &FixedTts) -> SessionServices {
    SessionServices {
        stt: Arc::new(stt),
        llm: Arc::new(llm.clone()),
        tts: Arc::new(tts.clone()),
    }
}

fn fast_vad() -> VadConfig {
    VadConfig {
        enabled: true,
        threshold_dbfs: -35.0,
        start_secs: 0.2,
        stop_secs: 0.2,
    }
}

fn count(frames: &[Value], event: &str) -> usize {
    frames.iter().filter(|f| f["event"] == event).count()
}

#[tokio::test]
async fn greets_then_answers_a_user_turn() {
    let llm = ScriptedLlm::new(["Sure. ", "We open ", "at nine."]);
    let tts = FixedTts::new(320);
    let mut call = Call::start(
        settings(),
        services(ScriptedStt::new("what are your hours"), &llm, &tts),
    );

    let greeting = call.frames_until_mark(1).await;
    assert_eq!(count(&greeting, "media"), 1);
    assert_eq!(greeting[0]["stream_sid"], "stream-1");
    assert!(!greeting[0]["media"]["payload"].as_str().unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(100)).await;
    call.say(&[(100, true), (100, false)]).await;

    let reply = call.frames_until_mark(2).await;
    assert_eq!(count(&reply, "media"), 2);
    assert_eq!(count(&reply, "clear"), 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let summary = call.stop().await;

    assert_eq!(summary.reason, EndReason::Stopped("callended".to_string()));
    assert_eq!(summary.call_sid, "call-1");
    assert_eq!(
        summary.transcript,
        vec![
            ChatMessage::assistant("Hello there."),
            ChatMessage::user("what are your hours"),
            ChatMessage::assistant("Sure. We open at nine."),
        ]
    );
    assert_eq!(summary.metrics.user_turns, 1);
    assert_eq!(summary.metrics.bot_turns, 2);
    assert_eq!(summary.metrics.interruptions, 0);
    assert_eq!(summary.metrics.completion_tokens, 3);

    let requests = llm.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0],
        vec![
            ChatMessage::system("You answer questions about the shop."),
            ChatMessage::assistant("Hello there."),
            ChatMessage::user("what are your hours"),
        ]
    );
    assert_eq!(tts.texts(), vec!["Hello there.", "Sure.", "We open at nine."]);
}

#[tokio::test]
async fn speech_over_the_bot_sends_clear() {
    let llm = ScriptedLlm::new(["Okay."]);
    // One second of audio per sentence.
    let tts = FixedTts::new(16_000);
    let mut call = Call::start(
        SessionSettings {
            vad: Some(fast_vad()),
            ..settings()
        },
        services(ScriptedStt::new("stop please"), &llm, &tts),
    );

    let first = call.next_frame().await;
    assert_eq!(first["event"], "media");

    call.say(&[(100, true), (100, true)]).await;
    loop {
        let frame = call.next_frame().await;
        if frame["event"] == "clear" {
            assert_eq!(frame["stream_sid"], "stream-1");
            break;
        }
        assert_eq!(frame["event"], "media", "greeting must not finish");
    }

    call.say(&[(100, false), (100, false)]).await;
    let reply = call.frames_until_mark(2).await;
    assert!(count(&reply, "media") >= 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let summary = call.stop().await;
    assert_eq!(summary.metrics.interruptions, 1);
    assert_eq!(summary.metrics.user_turns, 1);
    assert_eq!(
        summary.transcript,
        vec![
            ChatMessage::assistant("Hello there."),
            ChatMessage::user("stop please"),
            ChatMessage::assistant("Okay."),
        ]
    );
}

#[tokio::test]
async fn transcripts_interrupt_when_vad_is_disabled() {
    let llm = ScriptedLlm::new(["Right."]);
    let tts = FixedTts::new(16_000);
    let mut call = Call::start(
        settings(),
        services(ScriptedStt::new("hang on"), &llm, &tts),
    );

    assert_eq!(call.next_frame().await["event"], "media");
    call.say(&[(100, true)]).await;
    loop {
        if call.next_frame().await["event"] == "clear" {
            break;
        }
    }

    call.say(&[(100, false)]).await;
    call.frames_until_mark(2).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let summary = call.stop().await;
    assert_eq!(summary.metrics.interruptions, 1);
    assert_eq!(llm.requests().len(), 1);
}

#[tokio::test]
async fn queues_user_turn_when_interruptions_are_disabled() {
    let llm = ScriptedLlm::new(["We are closed today."]);
    let tts = FixedTts::new(8_000);
    let mut call = Call::start(
        SessionSettings {
            allow_interruptions: false,
            ..settings()
        },
        services(ScriptedStt::new("are you open"), &llm, &tts),
    );

    assert_eq!(call.next_frame().await["event"], "media");
    call.say(&[(100, true), (100, false)]).await;

    let greeting = call.frames_until_mark(1).await;
    assert_eq!(count(&greeting, "clear"), 0);

    let reply = call.frames_until_mark(2).await;
    assert_eq!(count(&reply, "clear"), 0);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let summary = call.stop().await;
    assert_eq!(summary.metrics.interruptions, 0);
    let roles: Vec<ChatRole> = summary.transcript.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![ChatRole::Assistant, ChatRole::User, ChatRole::Assistant]
    );
    assert_eq!(llm.requests().len(), 1);
}

#[tokio::test]
async fn failed_completion_keeps_the_call_alive() {
    let llm = ScriptedLlm::failing();
    let tts = FixedTts::new(320);
    let mut call = Call::start(
        SessionSettings {
            greeting: String::new(),
            ..settings()
        },
        services(ScriptedStt::new("hello"), &llm, &tts),
    );

    call.say(&[(100, true), (100, false)]).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(call.output.try_recv().is_err(), "nothing should be spoken");

    let summary = call.stop().await;
    assert_eq!(summary.reason, EndReason::Stopped("callended".to_string()));
    assert_eq!(summary.transcript, vec![ChatMessage::user("hello")]);
    assert_eq!(summary.metrics.bot_turns, 0);
    assert_eq!(llm.requests().len(), 1);
}

#[tokio::test]
async fn records_dtmf_digits() {
    let llm = ScriptedLlm::new(["unused"]);
    let tts = FixedTts::new(320);
    let call = Call::start(
        SessionSettings {
            greeting: String::new(),
            ..settings()
        },
        services(ScriptedStt::new("unused"), &llm, &tts),
    );

    for digit in ["4", "2"] {
        call.inbound
            .send(InboundFrame::Dtmf(digit.to_string()))
            .await
            .unwrap();
    }
    let summary = call.stop().await;
    assert_eq!(summary.metrics.dtmf_digits, "42");
    assert!(llm.requests().is_empty());
}

#[tokio::test]
async fn ends_after_idle_timeout() {
    let llm = ScriptedLlm::new(["unused"]);
    let tts = FixedTts::new(320);
    let call = Call::start(
        SessionSettings {
            greeting: String::new(),
            idle_timeout: Some(Duration::from_millis(300)),
            ..settings()
        },
        services(ScriptedStt::new("unused"), &llm, &tts),
    );

    let summary = tokio::time::timeout(Duration::from_secs(3), call.session)
        .await
        .expect("idle call did not end")
        .unwrap()
        .unwrap();
    assert_eq!(summary.reason, EndReason::IdleTimeout);
    assert!(summary.duration >= Duration::from_millis(300));
}

#[tokio::test]
async fn closed_socket_ends_the_call() {
    let llm = ScriptedLlm::new(["unused"]);
    let tts = FixedTts::new(320);
    let call = Call::start(settings(), services(ScriptedStt::new("unused"), &llm, &tts));

    drop(call.inbound);
    let summary = tokio::time::timeout(Duration::from_secs(3), call.session)
        .await
        .expect("call did not end")
        .unwrap()
        .unwrap();
    assert_eq!(summary.reason, EndReason::Disconnected);
}

#[tokio::test]
async fn unreachable_recognizer_fails_the_call() {
    let llm = ScriptedLlm::new(["unused"]);
    let tts = FixedTts::new(320);
    let call = Call::start(settings(), services(ScriptedStt::unavailable(), &llm, &tts));

    let result = call.session.await.unwrap();
    assert!(matches!(result, Err(VoiceError::Stt(_))));
    assert!(tts.texts().is_empty());
}

#[tokio::test]
async fn interrupted_answer_keeps_the_sentences_already_played() {
    let llm = ScriptedLlm::new(["One. ", "Two. ", "Three."]);
    // One second of audio per sentence, ten frames each.
    let tts = FixedTts::new(16_000);
    let mut call = Call::start(
        SessionSettings {
            greeting: String::new(),
            vad: Some(fast_vad()),
            ..settings()
        },
        services(ScriptedStt::new("hi"), &llm, &tts),
    );

    call.say(&[(100, true), (100, true), (100, false), (100, false)])
        .await;

    // The eleventh frame belongs to the second sentence.
    for _ in 0..11 {
        assert_eq!(call.next_frame().await["event"], "media");
    }
    call.say(&[(100, true), (100, true)]).await;
    loop {
        let frame = call.next_frame().await;
        if frame["event"] == "clear" {
            break;
        }
        assert_eq!(frame["event"], "media");
    }

    let summary = call.stop().await;
    assert_eq!(summary.metrics.interruptions, 1);
    assert_eq!(
        summary.transcript,
        vec![ChatMessage::user("hi"), ChatMessage::assistant("One.")]
    );
    assert!(!tts.texts().contains(&"Three.".to_string()));
}

#[tokio::test]
async fn failed_synthesis_ends_only_the_turn() {
    let llm = ScriptedLlm::new(["One. ", "Two. ", "Three."]);
    let tts = FixedTts::failing_on(320, "Two.");
    let mut call = Call::start(
        SessionSettings {
            greeting: String::new(),
            ..settings()
        },
        services(ScriptedStt::new("hi"), &llm, &tts),
    );

    call.say(&[(100, true), (100, false)]).await;
    assert_eq!(call.next_frame().await["event"], "media");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        call.output.try_recv().is_err(),
        "a failed turn sends no more audio and no end mark"
    );

    let summary = call.stop().await;
    assert_eq!(summary.reason, EndReason::Stopped("callended".to_string()));
    assert_eq!(
        summary.transcript,
        vec![ChatMessage::user("hi"), ChatMessage::assistant("One.")]
    );
    assert_eq!(summary.metrics.bot_turns, 0);
    assert_eq!(tts.texts(), vec!["One.", "Two."]);
}

#[tokio::test]
async fn lost_recognizer_stream_ends_the_call() {
    let llm = ScriptedLlm::new(["unused"]);
    let tts = FixedTts::new(320);
    let call = Call::start(
        SessionSettings {
            greeting: String::new(),
            ..settings()
        },
        services(ScriptedStt::closing_after(2), &llm, &tts),
    );

    call.say(&[(100, true), (100, true)]).await;
    let summary = tokio::time::timeout(Duration::from_secs(3), call.session)
        .await
        .expect("call did not end")
        .unwrap()
        .unwrap();
    assert_eq!(summary.reason, EndReason::SttClosed);
    assert!(llm.requests().is_empty());
}

#[tokio::test]
async fn stuck_recognizer_is_stopped_after_the_call() {
    let stt = ScriptedStt::stuck();
    let llm = ScriptedLlm::new(["unused"]);
    let tts = FixedTts::new(320);
    let call = Call::start(
        SessionSettings {
            greeting: String::new(),
            ..settings()
        },
        services(stt.clone(), &llm, &tts),
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(stt.open_streams(), 1);

    let summary = call.stop().await;
    assert_eq!(summary.reason, EndReason::Stopped("callended".to_string()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(stt.open_streams(), 0);
}
