use std::sync::Arc;

use sqlx::{Pool, Sqlite};

use crate::db::{ChatMessage, MessageRepository};
use crate::error::AppError;
use crate::realtime::{Hub, ServerEvent};
use crate::rooms::{Session, SessionId, SessionRegistry, UserId, SYSTEM_SENDER};

/// Persist a message and push it to every occupant except its sender.
///
/// A missed push is not an error: the message is stored and shows up in history.
async fn append_and_publish(
    db: &Pool<Sqlite>,
    hub: &Hub,
    session: &Session,
    sender: Option<&UserId>,
    text: &str,
) -> Result<ChatMessage, AppError> {
    let sender_id = sender.map(UserId::as_str).unwrap_or(SYSTEM_SENDER);
    let message =
        MessageRepository::create(db, &session.id().to_string(), sender_id, text, sender.is_none())
            .await?;

    let recipients = session.occupants().filter(|user| Some(*user) != sender);
    let event = ServerEvent::MessageCreated {
        message: message.clone(),
    };
    let delivered = hub.publish(recipients, &event);
    tracing::debug!(session = %session.id(), delivered, "message published");

    Ok(message)
}

/// System notice on a join/leave transition. Failures are logged, never propagated: the
/// transition itself already committed.
pub(crate) async fn post_notice(db: &Pool<Sqlite>, hub: &Hub, session: &Session, text: &str) {
    if let Err(e) = append_and_publish(db, hub, session, None, text).await {
        tracing::warn!(session = %session.id(), "failed to record system notice: {}", e);
    }
}

pub struct MessageRelay {
    registry: Arc<SessionRegistry>,
    max_chars: usize,
}

impl MessageRelay {
    pub fn new(registry: Arc<SessionRegistry>, max_chars: usize) -> Self {
        Self {
            registry,
            max_chars,
        }
    }

    fn validate<'a>(&self, text: &'a str) -> Result<&'a str, AppError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(AppError::Validation("Message cannot be empty".to_string()));
        }
        if trimmed.chars().count() > self.max_chars {
            return Err(AppError::Validation(format!(
                "Message must be at most {} characters",
                self.max_chars
            )));
        }
        Ok(trimmed)
    }

    /// Append a chat message to `session_id` and deliver it to the other occupant.
    pub async fn post_message(
        &self,
        session_id: SessionId,
        sender: &UserId,
        text: &str,
    ) -> Result<ChatMessage, AppError> {
        let text = self.validate(text)?;

        // holding the lock keeps creation order and delivery order identical
        let session = self
            .registry
            .lock_session(session_id)
            .await
            .ok_or_else(|| AppError::PermissionDenied("Session has ended".to_string()))?;

        if !session.has_occupant(sender) {
            return Err(AppError::PermissionDenied(
                "Not a participant of this session".to_string(),
            ));
        }

        append_and_publish(
            self.registry.db(),
            self.registry.hub(),
            &session,
            Some(sender),
            text,
        )
        .await
    }

    /// Stored messages of a session, oldest first, for a current occupant.
    pub async fn history(
        &self,
        session_id: SessionId,
        user: &UserId,
    ) -> Result<Vec<ChatMessage>, AppError> {
        {
            let session = self
                .registry
                .lock_session(session_id)
                .await
                .ok_or_else(|| AppError::PermissionDenied("Session has ended".to_string()))?;
            if !session.has_occupant(user) {
                return Err(AppError::PermissionDenied(
                    "Not a participant of this session".to_string(),
                ));
            }
        }

        MessageRepository::list_for_session(self.registry.db(), &session_id.to_string()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn user(id: &str) -> UserId {
        UserId::parse(id).unwrap()
    }

    async fn paired() -> (Arc<SessionRegistry>, Hub, SessionId) {
        let hub = Hub::new();
        let registry = Arc::new(SessionRegistry::new(db::memory().await.unwrap(), hub.clone()));
        let id = registry.create_waiting(&user("a")).await.unwrap().session_id;
        registry.join(id, &user("b")).await.unwrap();
        (registry, hub, id)
    }

    #[tokio::test]
    async fn delivers_to_partner_without_echo() {
        let (registry, hub, id) = paired().await;
        let (_, mut a_rx) = hub.connect(&user("a"));
        let (_, mut b_rx) = hub.connect(&user("b"));
        let relay = MessageRelay::new(registry, 100);

        let message = relay.post_message(id, &user("a"), "  hello ").await.unwrap();
        assert_eq!(message.text, "hello");
        assert!(!message.is_system);

        match b_rx.recv().await {
            Some(ServerEvent::MessageCreated { message: got }) => assert_eq!(got, message),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn rejects_outsiders_and_bad_text() {
        let (registry, _hub, id) = paired().await;
        let relay = MessageRelay::new(registry, 5);

        assert!(matches!(
            relay.post_message(id, &user("c"), "hi").await,
            Err(AppError::PermissionDenied(_))
        ));
        assert!(matches!(
            relay.post_message(id, &user("a"), "   ").await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            relay.post_message(id, &user("a"), "too long").await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn history_is_in_creation_order() {
        let (registry, _hub, id) = paired().await;
        let relay = MessageRelay::new(registry, 100);

        relay.post_message(id, &user("a"), "one").await.unwrap();
        relay.post_message(id, &user("b"), "two").await.unwrap();

        let texts: Vec<String> = relay
            .history(id, &user("a"))
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.text)
            .collect();
        assert_eq!(texts, vec!["Stranger connected.", "one", "two"]);

        assert!(matches!(
            relay.history(id, &user("c")).await,
            Err(AppError::PermissionDenied(_))
        ));
    }
}
