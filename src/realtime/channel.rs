use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use uuid::Uuid;

use crate::db::ChatMessage;
use crate::rooms::{SessionId, SignalEnvelope, UserId};

/// Events pushed to connected clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum ServerEvent {
    #[serde(rename = "message.created")]
    MessageCreated { message: ChatMessage },

    #[serde(rename = "participant.joined")]
    ParticipantJoined {
        session_id: SessionId,
        user_id: UserId,
    },

    #[serde(rename = "participant.left")]
    ParticipantLeft {
        session_id: SessionId,
        user_id: UserId,
    },

    #[serde(rename = "signal")]
    Signal { envelope: SignalEnvelope },

    #[serde(rename = "presence.sync")]
    PresenceSync { online: usize, users: Vec<UserId> },

    #[serde(rename = "error")]
    Error { kind: String, message: String },
}

struct Connection {
    id: Uuid,
    tx: UnboundedSender<ServerEvent>,
}

/// Routes events to the live connection of each user.
///
/// Queues are unbounded so publishing never waits, which lets callers publish while holding a
/// session lock. Each queue is FIFO, so events to one user keep their publish order.
#[derive(Clone, Default)]
pub struct Hub {
    connections: Arc<DashMap<UserId, Connection>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for `user`, replacing any older one.
    ///
    /// Dropping the older queue ends its sender task, which closes that socket.
    pub fn connect(&self, user: &UserId) -> (Uuid, UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();

        if self
            .connections
            .insert(user.clone(), Connection { id, tx })
            .is_some()
        {
            tracing::debug!(user = %user, "replaced existing connection");
        }

        (id, rx)
    }

    /// Drop `user`'s connection if it is still `connection_id`.
    ///
    /// Returns false when a newer connection has taken over, in which case the user is still
    /// online and no cleanup should run.
    pub fn disconnect(&self, user: &UserId, connection_id: Uuid) -> bool {
        self.connections
            .remove_if(user, |_, conn| conn.id == connection_id)
            .is_some()
    }

    /// Drop `user`'s connection whichever it is. Its socket closes once the queue drains.
    pub fn close(&self, user: &UserId) -> bool {
        self.connections.remove(user).is_some()
    }

    /// Whether `connection_id` is still the live connection of `user`.
    pub fn is_current(&self, user: &UserId, connection_id: Uuid) -> bool {
        self.connections
            .get(user)
            .map(|conn| conn.id == connection_id)
            .unwrap_or(false)
    }

    pub fn is_connected(&self, user: &UserId) -> bool {
        self.connections
            .get(user)
            .map(|conn| !conn.tx.is_closed())
            .unwrap_or(false)
    }

    /// Queue `event` for `user`. Returns false if the user has no live connection.
    pub fn send(&self, user: &UserId, event: ServerEvent) -> bool {
        match self.connections.get(user) {
            Some(conn) => conn.tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Fan `event` out to `recipients`; returns how many queues accepted it.
    pub fn publish<'a, I>(&self, recipients: I, event: &ServerEvent) -> usize
    where
        I: IntoIterator<Item = &'a UserId>,
    {
        recipients
            .into_iter()
            .filter(|user| self.send(user, event.clone()))
            .count()
    }

    /// Send `event` to every connected user.
    pub fn broadcast(&self, event: &ServerEvent) -> usize {
        let mut delivered = 0;
        for conn in self.connections.iter() {
            if conn.tx.send(event.clone()).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}
