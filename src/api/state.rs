use std::sync::Arc;
#[cfg(test)]
use std::time::Instant;

use crate::config::Config;
use crate::realtime::{Hub, PresenceTracker, ServerEvent};
use crate::rooms::{ChatService, UserId};

#[derive(Clone)]
pub struct AppState {
    pub chat: Arc<ChatService>,
    pub hub: Hub,
    pub presence: Arc<PresenceTracker>,
    pub config: Arc<Config>,
}

impl AppState {
    /// Push the current online set to every connection.
    pub fn broadcast_presence(&self) {
        let users = self.presence.snapshot();
        let event = ServerEvent::PresenceSync {
            online: users.len(),
            users,
        };
        self.hub.broadcast(&event);
    }

    /// Evict visitors whose heartbeat lapsed: close their connection and leave their session.
    pub async fn sweep_presence(&self) -> usize {
        self.evict(self.presence.sweep()).await
    }

    #[cfg(test)]
    async fn sweep_presence_at(&self, now: Instant) -> usize {
        self.evict(self.presence.sweep_at(now)).await
    }

    async fn evict(&self, evicted: Vec<UserId>) -> usize {
        if evicted.is_empty() {
            return 0;
        }

        for user in &evicted {
            self.hub.close(user);
            if let Err(e) = self.chat.disconnect(user).await {
                tracing::error!(user = %user, "cleanup after presence expiry failed: {}", e);
            }
        }

        tracing::debug!(count = evicted.len(), "evicted silent visitors");
        self.broadcast_presence();
        evicted.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::rooms::LeaveOutcome;
    use std::time::Duration;

    fn user(id: &str) -> UserId {
        UserId::parse(id).unwrap()
    }

    async fn state() -> AppState {
        let config = Config::default();
        let hub = Hub::new();
        let pool = db::memory().await.unwrap();
        AppState {
            chat: Arc::new(ChatService::new(pool, hub.clone(), &config)),
            hub,
            presence: Arc::new(PresenceTracker::new(Duration::from_secs(30))),
            config: Arc::new(config),
        }
    }

    #[tokio::test]
    async fn silent_visitor_is_removed_from_their_session() {
        let state = state().await;
        let (_, mut silent_rx) = state.hub.connect(&user("u1"));
        let (_, mut partner_rx) = state.hub.connect(&user("u2"));
        state.presence.track(&user("u1"));

        let x = state.chat.start(&user("u1")).await.unwrap().session_id;
        state.chat.start(&user("u2")).await.unwrap();
        while partner_rx.try_recv().is_ok() {}

        let later = Instant::now() + Duration::from_secs(31);
        assert_eq!(state.sweep_presence_at(later).await, 1);

        assert!(!state.hub.is_connected(&user("u1")));
        assert_eq!(state.chat.registry().session_of(&user("u1")), None);
        assert_eq!(
            state.chat.leave(x, &user("u1")).await.unwrap(),
            LeaveOutcome::NotMember
        );

        let mut left = false;
        while let Ok(event) = partner_rx.try_recv() {
            if let ServerEvent::ParticipantLeft { user_id, session_id } = event {
                assert_eq!((user_id, session_id), (user("u1"), x));
                left = true;
            }
        }
        assert!(left);

        // the evicted connection's queue is closed after what was already queued
        while silent_rx.try_recv().is_ok() {}
        assert!(silent_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn sweep_without_expiry_is_a_noop() {
        let state = state().await;
        state.presence.track(&user("u1"));
        assert_eq!(state.sweep_presence().await, 0);
        assert_eq!(state.presence.count(), 1);
    }
}
