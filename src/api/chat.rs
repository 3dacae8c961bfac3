use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::state::AppState;
use crate::db::ChatMessage;
use crate::error::AppError;
use crate::rooms::{DropReason, Pairing, SessionId, SessionView, SignalOutcome, UserId};

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub user_id: UserId,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct SendMessageResponse {
    pub ok: bool,
    pub message_id: String,
    pub created_at: i64,
}

#[derive(Debug, Deserialize)]
pub struct NextRequest {
    pub user_id: UserId,
    #[serde(default)]
    pub current_session_id: Option<SessionId>,
}

#[derive(Debug, Deserialize)]
pub struct LeaveRequest {
    pub session_id: SessionId,
    pub user_id: UserId,
}

#[derive(Debug, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

#[derive(Debug, Deserialize)]
pub struct OccupantQuery {
    pub user_id: UserId,
}

#[derive(Debug, Serialize)]
pub struct SignalResponse {
    pub delivered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DropReason>,
}

impl From<SignalOutcome> for SignalResponse {
    fn from(outcome: SignalOutcome) -> Self {
        match outcome {
            SignalOutcome::Delivered => SignalResponse {
                delivered: true,
                reason: None,
            },
            SignalOutcome::Dropped(reason) => SignalResponse {
                delivered: false,
                reason: Some(reason),
            },
        }
    }
}

/// POST /api/chat/start
pub async fn start(
    State(state): State<AppState>,
    Json(req): Json<StartRequest>,
) -> Result<Json<Pairing>, AppError> {
    let pairing = state.chat.start(&req.user_id).await?;
    Ok(Json(pairing))
}

/// POST /api/chat/send
pub async fn send_message(
    State(state): State<AppState>,
    Json(req): Json<SendMessageRequest>,
) -> Result<Json<SendMessageResponse>, AppError> {
    let message = state
        .chat
        .send_message(req.session_id, &req.user_id, &req.text)
        .await?;

    Ok(Json(SendMessageResponse {
        ok: true,
        message_id: message.id,
        created_at: message.created_at,
    }))
}

/// POST /api/chat/next
pub async fn next(
    State(state): State<AppState>,
    Json(req): Json<NextRequest>,
) -> Result<Json<Pairing>, AppError> {
    let pairing = state.chat.next(&req.user_id, req.current_session_id).await?;
    Ok(Json(pairing))
}

/// POST /api/chat/leave
pub async fn leave(
    State(state): State<AppState>,
    Json(req): Json<LeaveRequest>,
) -> Result<Json<OkResponse>, AppError> {
    state.chat.leave(req.session_id, &req.user_id).await?;
    Ok(Json(OkResponse { ok: true }))
}

/// GET /api/chat/sessions/{session_id}
pub async fn session(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
    Query(query): Query<OccupantQuery>,
) -> Result<Json<SessionView>, AppError> {
    let view = state.chat.session_view(session_id, &query.user_id).await?;
    Ok(Json(view))
}

/// GET /api/chat/sessions/{session_id}/messages
pub async fn messages(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
    Query(query): Query<OccupantQuery>,
) -> Result<Json<Vec<ChatMessage>>, AppError> {
    let messages = state.chat.history(session_id, &query.user_id).await?;
    Ok(Json(messages))
}

/// POST /api/signal
///
/// HTTP fallback for clients without a socket; the body carries `from` explicitly.
pub async fn signal(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<SignalResponse>, AppError> {
    let from = body
        .get("from")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Validation("from is required".to_string()))
        .and_then(UserId::parse)?;

    let outcome = state.chat.relay_signal(&from, body).await?;
    Ok(Json(outcome.into()))
}

#[derive(Debug, Serialize)]
pub struct PresenceResponse {
    pub online: usize,
}

/// GET /api/presence
pub async fn presence(State(state): State<AppState>) -> Json<PresenceResponse> {
    Json(PresenceResponse {
        online: state.presence.count(),
    })
}
