//! Exotel voice bot server binary.
//!
//! Serves the Exotel media-stream websocket and the outbound call API with
//! structured logging and graceful shutdown on SIGTERM/SIGINT.

use exobot_server::config::{self, Credentials};
use exobot_server::{app, build_services, AppState};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("EXOBOT_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    // Load configuration
    let mut config = config::load_config(selected_config_path)
        .expect("failed to load configuration; the server cannot start without valid config");

    // Initialize tracing
    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    let credentials = Credentials::from_env();
    let missing = credentials.missing();
    if !missing.is_empty() {
        tracing::error!("missing env vars: {}", missing.join(", "));
        if missing.contains(&"EXOTEL_APP_ID") {
            tracing::info!(
                "EXOTEL_APP_ID is the id of the existing voice app \
                 (Exotel dashboard, App Bazaar / flows)"
            );
        }
        std::process::exit(1);
    }
    config.apply_credentials(&credentials);

    let services = match build_services(&config) {
        Ok(services) => services,
        Err(e) => {
            tracing::error!("failed to initialize voice services: {}", e);
            std::process::exit(1);
        }
    };
    let state = match AppState::new(&config, &credentials, services) {
        Ok(state) => state,
        Err(e) => {
            tracing::error!("failed to initialize Exotel client: {}", e);
            std::process::exit(1);
        }
    };

    // Build application
    let app = app(state);
    let addr = SocketAddr::new(config.server.host, config.server.port);

    tracing::info!(%addr, "starting exobot server");
    tracing::info!(
        endpoint = %format!("http://{}/outbound/call", addr),
        "outbound calls use the existing call flow"
    );

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address; is another process using this port?");

    // Serve with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    tracing::info!("exobot server shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
