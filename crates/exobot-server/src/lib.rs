//! Exotel voice bot server library logic.

pub mod api;
pub mod api_outbound;
pub mod api_ws;
pub mod config;
pub mod exotel;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Extension, Router,
};
use config::{Config, Credentials, OutboundConfig};
use exobot_voice::{
    CartesiaTts, DeepgramStt, OpenAiLlm, SessionServices, SessionSettings, VoiceError,
};
use exotel::{ExotelClient, ExotelError};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Pipeline settings applied to every call.
    pub session: SessionSettings,
    /// Media stream sample rate assumed when `start` does not announce one.
    pub exotel_sample_rate: u32,
    /// Speech, language and synthesis backends.
    pub services: SessionServices,
    /// Exotel REST client for outbound calls.
    pub exotel: ExotelClient,
    /// Outbound call policy.
    pub outbound: OutboundConfig,
    /// Calls currently streaming.
    pub calls: api_ws::CallRegistry,
}

impl AppState {
    pub fn new(
        config: &Config,
        credentials: &Credentials,
        services: SessionServices,
    ) -> Result<Self, ExotelError> {
        Ok(Self {
            session: config.session_settings(),
            exotel_sample_rate: config.call.exotel_sample_rate,
            services,
            exotel: ExotelClient::new(credentials, &config.outbound)?,
            outbound: config.outbound.clone(),
            calls: api_ws::CallRegistry::new(),
        })
    }
}

/// Builds the Deepgram, OpenAI and Cartesia clients from `config`.
///
/// Provider keys must already be in the config, see
/// [`Config::apply_credentials`].
pub fn build_services(config: &Config) -> Result<SessionServices, VoiceError> {
    Ok(SessionServices {
        stt: Arc::new(DeepgramStt::new(config.stt.clone())),
        llm: Arc::new(OpenAiLlm::new(config.llm.clone())?),
        tts: Arc::new(CartesiaTts::new(config.tts.clone())?),
    })
}

/// Maximum request body size (64 KiB). Outbound requests are tiny.
const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(api_ws::ws_handler))
        .route("/ws", get(api_ws::ws_handler))
        .route("/health", get(api::health_handler))
        .route("/calls", get(api_ws::list_calls_handler))
        .route(
            "/outbound/call",
            post(api_outbound::outbound_call_handler),
        )
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(Extension(Arc::new(state)))
}
