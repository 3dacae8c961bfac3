//! Targeted relay of peer-connection negotiation envelopes.
//!
//! The relay never inspects negotiation state; it only checks that sender and target share a
//! live session and hands the envelope to the target's queue.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;
use crate::realtime::ServerEvent;
use crate::rooms::{SessionId, SessionRegistry, UserId};

const KNOWN_KINDS: [&str; 4] = ["offer", "answer", "candidate", "bye"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalPayload {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    Candidate {
        candidate: String,
        #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
        #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
        sdp_m_line_index: Option<u32>,
        #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
        username_fragment: Option<String>,
    },
    Bye,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    pub from: UserId,
    pub to: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(flatten)]
    pub payload: SignalPayload,
}

/// Envelope as sent by a client; the sender comes from the connection, not the body.
#[derive(Deserialize)]
struct WireSignal {
    to: UserId,
    #[serde(default)]
    session_id: Option<SessionId>,
    #[serde(flatten)]
    payload: SignalPayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Envelope(SignalEnvelope),
    Unknown(String),
}

/// Parse a raw client envelope. Unknown kinds are reported, not rejected.
pub fn decode(from: &UserId, raw: Value) -> Result<Decoded, AppError> {
    let kind = raw
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::Validation("signal type is missing".to_string()))?;

    if !KNOWN_KINDS.contains(&kind) {
        return Ok(Decoded::Unknown(kind.to_string()));
    }

    let wire: WireSignal = serde_json::from_value(raw)
        .map_err(|e| AppError::Validation(format!("malformed signal: {}", e)))?;

    Ok(Decoded::Envelope(SignalEnvelope {
        from: from.clone(),
        to: wire.to,
        session_id: wire.session_id,
        payload: wire.payload,
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    SelfAddressed,
    StaleSession,
    TargetNotInSession,
    TargetOffline,
    UnknownKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Delivered,
    Dropped(DropReason),
}

pub struct SignalingRelay {
    registry: Arc<SessionRegistry>,
}

impl SignalingRelay {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Decode and relay a raw envelope from `from`.
    pub async fn relay_raw(&self, from: &UserId, raw: Value) -> Result<SignalOutcome, AppError> {
        match decode(from, raw)? {
            Decoded::Envelope(envelope) => self.relay(envelope).await,
            Decoded::Unknown(kind) => {
                tracing::warn!(from = %from, kind = %kind, "dropping signal of unknown type");
                Ok(SignalOutcome::Dropped(DropReason::UnknownKind))
            }
        }
    }

    pub async fn relay(&self, envelope: SignalEnvelope) -> Result<SignalOutcome, AppError> {
        if envelope.from == envelope.to {
            tracing::debug!(user = %envelope.from, "dropping self-addressed signal");
            return Ok(SignalOutcome::Dropped(DropReason::SelfAddressed));
        }

        let current = self
            .registry
            .session_of(&envelope.from)
            .ok_or_else(|| AppError::PermissionDenied("Not in a session".to_string()))?;

        if envelope.session_id.is_some_and(|claimed| claimed != current) {
            tracing::debug!(from = %envelope.from, "dropping signal for a previous session");
            return Ok(SignalOutcome::Dropped(DropReason::StaleSession));
        }

        // the lock is held while queueing so a departing target cannot receive it afterwards
        let session = self
            .registry
            .lock_session(current)
            .await
            .ok_or_else(|| AppError::PermissionDenied("Session has ended".to_string()))?;

        if !session.has_occupant(&envelope.from) {
            return Err(AppError::PermissionDenied(
                "Not a participant of this session".to_string(),
            ));
        }
        if !session.has_occupant(&envelope.to) {
            return Ok(SignalOutcome::Dropped(DropReason::TargetNotInSession));
        }

        let target = envelope.to.clone();
        if !self
            .registry
            .hub()
            .send(&target, ServerEvent::Signal { envelope })
        {
            return Ok(SignalOutcome::Dropped(DropReason::TargetOffline));
        }

        Ok(SignalOutcome::Delivered)
    }
}
