//! Exotel media-stream websocket and the registry of active calls.

use crate::api::service_info;
use crate::AppState;
use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket},
        Extension, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
    Json,
};
use exobot_types::{StartPayload, StreamEvent};
use exobot_voice::{CallSession, ExotelSerializer, InboundFrame};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Time allowed for queued frames to reach Exotel after a call ends.
const SEND_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// A call currently streaming to this server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActiveCall {
    pub call_sid: String,
    pub stream_sid: String,
    pub from: Option<String>,
    pub to: Option<String>,
    /// RFC 3339 timestamp of the `start` event.
    pub started_at: String,
}

/// Tracks active calls by session id.
#[derive(Clone, Default)]
pub struct CallRegistry {
    calls: Arc<RwLock<HashMap<Uuid, ActiveCall>>>,
}

impl CallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a call and returns its session id.
    pub async fn register(&self, call: ActiveCall) -> Uuid {
        let session_id = Uuid::new_v4();
        self.calls.write().await.insert(session_id, call);
        session_id
    }

    pub async fn remove(&self, session_id: Uuid) -> Option<ActiveCall> {
        self.calls.write().await.remove(&session_id)
    }

    /// Active calls, oldest first.
    pub async fn list(&self) -> Vec<ActiveCall> {
        let mut calls: Vec<ActiveCall> = self.calls.read().await.values().cloned().collect();
        calls.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        calls
    }

    pub async fn len(&self) -> usize {
        self.calls.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.calls.read().await.is_empty()
    }
}

/// Handler for `GET /calls`.
pub async fn list_calls_handler(Extension(state): Extension<Arc<AppState>>) -> Json<Vec<ActiveCall>> {
    Json(state.calls.list().await)
}

/// Handler for `GET /` and `GET /ws`.
///
/// Websocket upgrades become Exotel media streams; plain requests get the
/// service description.
pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| handle_socket(socket, state)),
        Err(_) => Json(service_info()).into_response(),
    }
}

/// Identifiers taken from the `start` event.
struct StreamStart {
    stream_sid: String,
    call_sid: String,
    start: StartPayload,
}

/// Reads frames until Exotel sends `start`.
///
/// Returns `None` when the stream ends first, or when `start` lacks the ids
/// needed to run a call.
async fn await_start(receiver: &mut SplitStream<WebSocket>) -> Option<StreamStart> {
    while let Some(message) = receiver.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!("websocket error before start: {}", e);
                return None;
            }
        };

        let event: StreamEvent = match serde_json::from_str(text.as_str()) {
            Ok(event) => event,
            Err(e) => {
                tracing::error!("invalid JSON from Exotel: {}", e);
                continue;
            }
        };
        tracing::debug!(event = event.name(), "received Exotel event");

        match event {
            StreamEvent::Start { stream_sid, start } => {
                let stream_sid = stream_sid.or_else(|| start.stream_sid.clone());
                return match (stream_sid, start.call_sid.clone()) {
                    (Some(stream_sid), Some(call_sid))
                        if !stream_sid.is_empty() && !call_sid.is_empty() =>
                    {
                        Some(StreamStart {
                            stream_sid,
                            call_sid,
                            start,
                        })
                    }
                    _ => {
                        tracing::error!("missing stream_sid or call_sid in start event");
                        None
                    }
                };
            }
            StreamEvent::Stop { stop } => {
                tracing::info!(reason = %stop.reason, "Exotel call ended before start");
                return None;
            }
            StreamEvent::Dtmf { dtmf } => {
                tracing::info!(digit = ?dtmf.digit, "DTMF received before start");
            }
            StreamEvent::Connected
            | StreamEvent::Media { .. }
            | StreamEvent::Mark { .. }
            | StreamEvent::Unknown => {}
        }
    }
    None
}

/// Runs one Exotel media stream.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    tracing::info!("Exotel websocket connection accepted");

    let (mut sender, mut receiver) = socket.split();

    let Some(StreamStart {
        stream_sid,
        call_sid,
        start,
    }) = await_start(&mut receiver).await
    else {
        tracing::info!("websocket connection closed");
        return;
    };

    let exotel_rate = start
        .media_format
        .as_ref()
        .and_then(|f| f.sample_rate_hz())
        .unwrap_or(state.exotel_sample_rate);

    tracing::info!(
        call_sid = %call_sid,
        stream_sid = %stream_sid,
        from = ?start.from,
        to = ?start.to,
        exotel_rate,
        "Exotel call started"
    );

    let serializer = ExotelSerializer::new(
        stream_sid.clone(),
        call_sid.clone(),
        exotel_rate,
        state.session.sample_rate,
    );

    // Bounded so that a stalled socket applies backpressure to the bot.
    let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
    let (in_tx, in_rx) = mpsc::channel::<InboundFrame>(256);

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if sender.send(Message::Text(msg.into())).await.is_err() {
                return;
            }
        }
        let _ = sender.close().await;
    });

    let session_id = state
        .calls
        .register(ActiveCall {
            call_sid: call_sid.clone(),
            stream_sid: stream_sid.clone(),
            from: start.from.clone(),
            to: start.to.clone(),
            started_at: chrono::Utc::now().to_rfc3339(),
        })
        .await;

    let session = CallSession::new(
        serializer.clone(),
        state.session.clone(),
        state.services.clone(),
        out_tx,
    );
    let mut session_task = tokio::spawn(session.run(in_rx));

    let finished = loop {
        tokio::select! {
            joined = &mut session_task => break Some(joined),
            message = receiver.next() => match message {
                Some(Ok(Message::Text(text))) => match serializer.deserialize(text.as_str()) {
                    Ok(Some(frame)) => {
                        // A send error means the session already ended.
                        let _ = in_tx.send(frame).await;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(call_sid = %call_sid, "dropping Exotel frame: {}", e);
                    }
                },
                Some(Ok(Message::Close(_))) | None => break None,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(call_sid = %call_sid, "websocket error: {}", e);
                    break None;
                }
            },
        }
    };

    drop(in_tx);
    let joined = match finished {
        Some(joined) => joined,
        None => session_task.await,
    };

    match joined {
        Ok(Ok(summary)) => tracing::info!(
            call_sid = %summary.call_sid,
            reason = %summary.reason,
            duration_secs = summary.duration.as_secs_f64(),
            user_turns = summary.metrics.user_turns,
            bot_turns = summary.metrics.bot_turns,
            "bot finished for Exotel call"
        ),
        Ok(Err(e)) => tracing::error!(call_sid = %call_sid, "call session failed: {}", e),
        Err(e) => tracing::error!(call_sid = %call_sid, "call session task failed: {}", e),
    }

    state.calls.remove(session_id).await;

    if tokio::time::timeout(SEND_DRAIN_TIMEOUT, &mut send_task)
        .await
        .is_err()
    {
        send_task.abort();
    }
    tracing::info!(call_sid = %call_sid, "websocket connection closed");
}
