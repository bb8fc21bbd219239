//! WebSocket handler for live stats delivery.
//!
//! Each socket gets its own hub session keyed by a fresh id. The browser
//! sends `get_stats` requests describing what it wants to watch; routed stat
//! deliveries flow back as `{"event": channel, "data": payload}` frames.

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::stats::GetStatsRequest;

use super::state::AppState;

/// WebSocket upgrade handler.
///
/// GET /ws
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

async fn handle_ws_connection(socket: WebSocket, state: AppState) {
    let session_id = Uuid::new_v4().to_string();
    info!(session = %session_id, "stats socket opened");

    let (mut sender, mut receiver) = socket.split();
    let mut deliveries = state.hub.register_session(&session_id);

    // Forward routed deliveries to the browser.
    let send_session = session_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(delivery) = deliveries.recv().await {
            let frame = json!({
                "event": delivery.channel,
                "data": delivery.payload,
            });
            let text = match serde_json::to_string(&frame) {
                Ok(t) => t,
                Err(err) => {
                    warn!(session = %send_session, error = %err, "failed to serialize delivery");
                    continue;
                }
            };
            if sender.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg_result) = receiver.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                handle_message(&state, &session_id, text.as_str()).await;
            }
            Ok(Message::Binary(_)) => {
                debug!(session = %session_id, "ignoring binary frame");
            }
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!(session = %session_id, "stats socket closed by peer");
                break;
            }
            Err(err) => {
                warn!(session = %session_id, error = %err, "stats socket error");
                break;
            }
        }
    }

    send_task.abort();
    // Drops the subscription and releases every feed this session held.
    state.hub.close_session(&session_id).await;
    info!(session = %session_id, "stats socket closed");
}

async fn handle_message(state: &AppState, session_id: &str, text: &str) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(err) => {
            warn!(session = %session_id, error = %err, "unparseable stats frame");
            return;
        }
    };
    match value.get("name").and_then(|n| n.as_str()) {
        Some("get_stats") => match serde_json::from_value::<GetStatsRequest>(value) {
            Ok(request) => state.hub.get_stats(session_id, request).await,
            Err(err) => {
                warn!(session = %session_id, error = %err, "malformed get_stats request");
            }
        },
        other => {
            debug!(session = %session_id, message = ?other, "ignoring unknown stats frame");
        }
    }
}
