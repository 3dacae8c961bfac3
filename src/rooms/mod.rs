//! Two-person rooms: pairing, lifecycle and relays.

pub mod pairing;
pub mod registry;
pub mod relay;
pub mod service;
pub mod signaling;

pub use pairing::PairingCoordinator;
pub use registry::SessionRegistry;
pub use relay::MessageRelay;
pub use service::ChatService;
pub use signaling::{DropReason, SignalEnvelope, SignalOutcome, SignalPayload, SignalingRelay};

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

pub type SessionId = Uuid;

/// Sender id stored on system-originated messages. Never accepted as a user id.
pub const SYSTEM_SENDER: &str = "system";

const MAX_USER_ID_LEN: usize = 64;

/// Opaque, client-generated visitor identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    pub fn parse(raw: impl Into<String>) -> Result<Self, AppError> {
        let raw = raw.into();
        let trimmed = raw.trim();

        if trimmed.is_empty() || trimmed.len() > MAX_USER_ID_LEN {
            return Err(AppError::Validation(format!(
                "user id must be 1-{} characters",
                MAX_USER_ID_LEN
            )));
        }

        if !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(AppError::Validation(
                "user id must be alphanumeric, underscore, or hyphen".to_string(),
            ));
        }

        if trimmed.eq_ignore_ascii_case(SYSTEM_SENDER) {
            return Err(AppError::Validation("user id is reserved".to_string()));
        }

        Ok(UserId(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for UserId {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        UserId::parse(value)
    }
}

impl From<UserId> for String {
    fn from(value: UserId) -> Self {
        value.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Waiting,
    Active,
    Ended,
}

#[derive(Debug, Clone)]
pub struct Occupant {
    pub user_id: UserId,
    pub joined_at: i64,
}

/// In-memory state of one room. Only the registry mutates it, always under the room's lock.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    created_at: i64,
    state: SessionState,
    occupants: Vec<Occupant>,
    departed: HashSet<UserId>,
}

impl Session {
    pub(crate) fn new(id: SessionId, created_at: i64, first: UserId) -> Self {
        Session {
            id,
            created_at,
            state: SessionState::Waiting,
            occupants: vec![Occupant {
                user_id: first,
                joined_at: created_at,
            }],
            departed: HashSet::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn occupants(&self) -> impl Iterator<Item = &UserId> {
        self.occupants.iter().map(|o| &o.user_id)
    }

    pub fn occupant_count(&self) -> usize {
        self.occupants.len()
    }

    pub fn has_occupant(&self, user: &UserId) -> bool {
        self.occupants.iter().any(|o| &o.user_id == user)
    }

    pub fn partner_of(&self, user: &UserId) -> Option<&UserId> {
        if !self.has_occupant(user) {
            return None;
        }
        self.occupants().find(|other| *other != user)
    }

    pub fn has_departed(&self, user: &UserId) -> bool {
        self.departed.contains(user)
    }

    /// Why `user` cannot take the free seat, if they cannot.
    pub(crate) fn claim_blocker(&self, user: &UserId) -> Option<&'static str> {
        if self.state != SessionState::Waiting {
            return Some("session is not waiting");
        }
        if self.occupants.len() != 1 {
            return Some("session has no single occupant");
        }
        if self.has_occupant(user) {
            return Some("user already occupies this session");
        }
        if self.has_departed(user) {
            return Some("user already left this session");
        }
        None
    }

    pub(crate) fn admit(&mut self, user: UserId, joined_at: i64) {
        self.occupants.push(Occupant {
            user_id: user,
            joined_at,
        });
        self.state = SessionState::Active;
    }

    /// Remove `user`; returns false when they were not an occupant.
    pub(crate) fn remove(&mut self, user: &UserId) -> bool {
        let before = self.occupants.len();
        self.occupants.retain(|o| &o.user_id != user);
        if self.occupants.len() == before {
            return false;
        }

        self.departed.insert(user.clone());
        self.state = if self.occupants.is_empty() {
            SessionState::Ended
        } else {
            SessionState::Waiting
        };
        true
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            id: self.id,
            state: self.state,
            created_at: self.created_at,
            occupants: self.occupants().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub id: SessionId,
    pub state: SessionState,
    pub created_at: i64,
    pub occupants: Vec<UserId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PairingStatus {
    Searching,
    Chatting,
}

/// Result of a pairing request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pairing {
    pub session_id: SessionId,
    pub partner_id: Option<UserId>,
    pub status: PairingStatus,
}

impl Pairing {
    pub fn searching(session_id: SessionId) -> Self {
        Pairing {
            session_id,
            partner_id: None,
            status: PairingStatus::Searching,
        }
    }

    pub fn chatting(session_id: SessionId, partner: UserId) -> Self {
        Pairing {
            session_id,
            partner_id: Some(partner),
            status: PairingStatus::Chatting,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// The user was not an occupant; nothing changed.
    NotMember,
    /// One occupant remains and the session is waiting again.
    Requeued,
    /// The last occupant left and the session is gone.
    Ended,
}
