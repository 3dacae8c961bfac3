use std::sync::Arc;

use serde_json::Value;
use sqlx::{Pool, Sqlite};

use crate::config::Config;
use crate::db::ChatMessage;
use crate::error::AppError;
use crate::realtime::Hub;
use crate::rooms::{
    LeaveOutcome, MessageRelay, Pairing, PairingCoordinator, SessionId, SessionRegistry,
    SessionView, SignalOutcome, SignalingRelay, UserId,
};

/// The operations the HTTP and WebSocket layers call into.
pub struct ChatService {
    registry: Arc<SessionRegistry>,
    pairing: PairingCoordinator,
    messages: MessageRelay,
    signals: SignalingRelay,
}

impl ChatService {
    pub fn new(db: Pool<Sqlite>, hub: Hub, config: &Config) -> Self {
        let registry = Arc::new(SessionRegistry::new(db, hub));
        Self {
            pairing: PairingCoordinator::new(registry.clone(), config.max_claim_attempts),
            messages: MessageRelay::new(registry.clone(), config.max_message_chars),
            signals: SignalingRelay::new(registry.clone()),
            registry,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub async fn start(&self, user: &UserId) -> Result<Pairing, AppError> {
        self.pairing.request_pairing(user).await
    }

    pub async fn send_message(
        &self,
        session_id: SessionId,
        user: &UserId,
        text: &str,
    ) -> Result<ChatMessage, AppError> {
        self.messages.post_message(session_id, user, text).await
    }

    /// Leave the current session (the given one, or whichever the user occupies) and pair again.
    pub async fn next(
        &self,
        user: &UserId,
        current: Option<SessionId>,
    ) -> Result<Pairing, AppError> {
        if let Some(session_id) = current.or_else(|| self.registry.session_of(user)) {
            self.registry.leave(session_id, user).await?;
        }
        self.start(user).await
    }

    pub async fn leave(&self, session_id: SessionId, user: &UserId) -> Result<LeaveOutcome, AppError> {
        self.registry.leave(session_id, user).await
    }

    /// Transport-level disconnect; handled exactly like an explicit leave.
    pub async fn disconnect(&self, user: &UserId) -> Result<LeaveOutcome, AppError> {
        match self.registry.session_of(user) {
            Some(session_id) => self.registry.leave(session_id, user).await,
            None => Ok(LeaveOutcome::NotMember),
        }
    }

    pub async fn relay_signal(&self, from: &UserId, raw: Value) -> Result<SignalOutcome, AppError> {
        self.signals.relay_raw(from, raw).await
    }

    pub async fn history(
        &self,
        session_id: SessionId,
        user: &UserId,
    ) -> Result<Vec<ChatMessage>, AppError> {
        self.messages.history(session_id, user).await
    }

    pub async fn session_view(
        &self,
        session_id: SessionId,
        user: &UserId,
    ) -> Result<SessionView, AppError> {
        let view = self
            .registry
            .snapshot(session_id)
            .await
            .ok_or_else(|| AppError::PermissionDenied("Session has ended".to_string()))?;

        if !view.occupants.contains(user) {
            return Err(AppError::PermissionDenied(
                "Not a participant of this session".to_string(),
            ));
        }
        Ok(view)
    }
}
