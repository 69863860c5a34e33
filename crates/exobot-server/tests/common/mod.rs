#![allow(dead_code)]

use exobot_server::config::{Config, Credentials};
use exobot_server::{app, AppState};
use exobot_voice::testing::{FixedTts, ScriptedLlm, ScriptedStt};
use exobot_voice::SessionServices;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

pub fn credentials() -> Credentials {
    Credentials {
        exotel_api_key: "key".to_string(),
        exotel_api_token: "token".to_string(),
        exotel_account_sid: "acme1".to_string(),
        exotel_caller_id: "08012345678".to_string(),
        exotel_app_id: "4242".to_string(),
        openai_api_key: "sk-test".to_string(),
        deepgram_api_key: "dg-test".to_string(),
        cartesia_api_key: "ca-test".to_string(),
    }
}

/// Config for fast, deterministic calls: short greeting, no VAD, no idle timeout.
pub fn config() -> Config {
    let mut config = Config::default();
    config.call.greeting = "Hi.".to_string();
    config.call.idle_timeout_secs = 0;
    config.vad.enabled = false;
    config
}

pub fn services(transcript: &str, reply: &[&str]) -> SessionServices {
    SessionServices {
        stt: Arc::new(ScriptedStt::new(transcript)),
        llm: Arc::new(ScriptedLlm::new(reply.iter().copied())),
        tts: Arc::new(FixedTts::new(320)),
    }
}

pub fn state(config: &Config, services: SessionServices) -> AppState {
    AppState::new(config, &credentials(), services).unwrap()
}

/// Serves the app on an ephemeral port.
pub async fn spawn_app(state: AppState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = app(state);
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}
