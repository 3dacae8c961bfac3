//! WebSocket real-time channel.
//!
//! Client -> Server (JSON, `type` tag):
//! ```json
//! {"type": "heartbeat"}
//! {"type": "message", "session_id": "...", "text": "hi"}
//! {"type": "signal", "signal": {"type": "offer", "to": "peer-id", "sdp": "..."}}
//! ```
//!
//! Server -> Client events carry an `event` tag: `message.created`, `participant.joined`,
//! `participant.left`, `signal`, `presence.sync`, `error`.
//!
//! A connection that sends no frame for `PRESENCE_TTL_SECS` is closed and treated as a leave.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

use crate::api::state::AppState;
use crate::error::AppError;
use crate::realtime::ServerEvent;
use crate::rooms::{SessionId, UserId};

#[derive(Debug, Deserialize)]
pub struct ConnectQuery {
    pub user_id: UserId,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientFrame {
    Heartbeat,
    Message { session_id: SessionId, text: String },
    Signal { signal: Value },
}

/// GET /ws?user_id=...
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.user_id))
}

fn error_event(err: &AppError) -> ServerEvent {
    ServerEvent::Error {
        kind: err.kind().to_string(),
        message: err.to_string(),
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, user: UserId) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (connection_id, mut rx) = state.hub.connect(&user);

    tracing::debug!(user = %user, connection = %connection_id, "websocket connected");
    if state.presence.track(&user) {
        state.broadcast_presence();
    }

    // Forward queued events to the socket in order.
    let sender_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!("failed to encode event: {e}");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(text.into())).await.is_err() {
                return;
            }
        }
        // queue dropped: replaced by a newer connection or evicted
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    let idle_limit = Duration::from_secs(state.config.presence_ttl_secs);

    // Frames are handled one at a time, which keeps each sender's signals in order.
    loop {
        let msg = match tokio::time::timeout(idle_limit, ws_receiver.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(_) => break,
            Err(_) => {
                tracing::info!(user = %user, "no frames within {:?}, closing", idle_limit);
                break;
            }
        };
        if !state.hub.is_current(&user, connection_id) {
            tracing::debug!(user = %user, connection = %connection_id, "connection was replaced");
            break;
        }

        if state.presence.touch(&user) {
            state.broadcast_presence();
        }

        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue, // ping/pong handled by the protocol layer
        };

        let frame: ClientFrame = match serde_json::from_str(text.as_str()) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(user = %user, "invalid WebSocket frame: {e}");
                let err = AppError::Validation(format!("invalid frame: {e}"));
                state.hub.send(&user, error_event(&err));
                continue;
            }
        };

        let result = match frame {
            ClientFrame::Heartbeat => Ok(()),
            ClientFrame::Message { session_id, text } => state
                .chat
                .send_message(session_id, &user, &text)
                .await
                .map(|_| ()),
            ClientFrame::Signal { signal } => state
                .chat
                .relay_signal(&user, signal)
                .await
                .map(|outcome| tracing::trace!(user = %user, ?outcome, "signal relayed")),
        };

        if let Err(err) = result {
            state.hub.send(&user, error_event(&err));
        }
    }

    // Cleanup only if no newer connection replaced this one.
    if state.hub.disconnect(&user, connection_id) {
        if state.presence.untrack(&user) {
            state.broadcast_presence();
        }
        if let Err(e) = state.chat.disconnect(&user).await {
            tracing::error!(user = %user, "cleanup after disconnect failed: {}", e);
        }
    }
    sender_task.abort();
    tracing::debug!(user = %user, connection = %connection_id, "websocket closed");
}
