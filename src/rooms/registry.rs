use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use sqlx::{Pool, Sqlite};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::db::SessionRepository;
use crate::error::AppError;
use crate::realtime::{Hub, ServerEvent};
use crate::rooms::relay;
use crate::rooms::{LeaveOutcome, Pairing, Session, SessionId, SessionState, SessionView, UserId};

const JOINED_NOTICE: &str = "Stranger connected.";
const LEFT_NOTICE: &str = "Stranger disconnected.";

struct SessionSlot {
    // set while one caller is filling the free seat; readers never touch it
    claiming: AtomicBool,
    session: Arc<Mutex<Session>>,
}

/// Exclusive right to fill the free seat of one session.
///
/// Only claimers contend on it, so a reader holding the session lock delays a claim instead of
/// making it skip the session.
pub struct Claim {
    slot: Arc<SessionSlot>,
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.slot.claiming.store(false, Ordering::Release);
    }
}

/// A waiting session already visible to claimers but not yet stored.
///
/// Its lock stays held until [`SessionRegistry::commit_waiting`] finishes, so a claimer that
/// finds it simply waits for the row to exist.
pub struct Reservation {
    id: SessionId,
    created_at: i64,
    user: UserId,
    session: OwnedMutexGuard<Session>,
}

impl Reservation {
    pub fn id(&self) -> SessionId {
        self.id
    }
}

/// Owner of every live session.
///
/// Each session sits behind its own lock, so unrelated sessions never contend. Storage is
/// written before a change becomes final; a failed write rolls the in-memory state back.
pub struct SessionRegistry {
    db: Pool<Sqlite>,
    hub: Hub,
    sessions: DashMap<SessionId, Arc<SessionSlot>>,
    // sessions with exactly one occupant, keyed to their creation time
    waiting: DashMap<SessionId, i64>,
    membership: DashMap<UserId, SessionId>,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

impl SessionRegistry {
    pub fn new(db: Pool<Sqlite>, hub: Hub) -> Self {
        Self {
            db,
            hub,
            sessions: DashMap::new(),
            waiting: DashMap::new(),
            membership: DashMap::new(),
        }
    }

    pub fn db(&self) -> &Pool<Sqlite> {
        &self.db
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Close sessions persisted by a previous process; their occupants are gone.
    pub async fn reconcile(&self) -> Result<u64, AppError> {
        let closed = SessionRepository::end_all_open(&self.db, now_millis()).await?;
        if closed > 0 {
            tracing::info!(closed, "ended sessions left open by a previous run");
        }
        Ok(closed)
    }

    /// Waiting sessions, oldest first.
    pub fn waiting_candidates(&self) -> Vec<SessionId> {
        let mut candidates: Vec<(i64, SessionId)> = self
            .waiting
            .iter()
            .map(|entry| (*entry.value(), *entry.key()))
            .collect();
        candidates.sort();
        candidates.into_iter().map(|(_, id)| id).collect()
    }

    pub fn session_of(&self, user: &UserId) -> Option<SessionId> {
        self.membership.get(user).map(|entry| *entry.value())
    }

    pub fn live_sessions(&self) -> usize {
        self.sessions.len()
    }

    fn slot(&self, id: SessionId) -> Option<Arc<SessionSlot>> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    /// Take the claim on `id` without waiting. `None` if it is gone or already being claimed.
    pub fn try_claim(&self, id: SessionId) -> Option<Claim> {
        let slot = self.slot(id)?;
        slot.claiming
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(Claim { slot })
    }

    /// Exclusive access to a live session. `None` once it has ended.
    pub async fn lock_session(&self, id: SessionId) -> Option<OwnedMutexGuard<Session>> {
        let slot = self.slot(id)?;
        let session = slot.session.clone().lock_owned().await;
        if session.state() == SessionState::Ended {
            return None;
        }
        Some(session)
    }

    pub async fn snapshot(&self, id: SessionId) -> Option<SessionView> {
        self.lock_session(id).await.map(|session| session.view())
    }

    /// The session `user` currently occupies, as a pairing result.
    pub async fn placement(&self, user: &UserId) -> Option<Pairing> {
        let id = self.session_of(user)?;
        let session = self.lock_session(id).await?;
        if !session.has_occupant(user) {
            return None;
        }

        Some(match session.partner_of(user) {
            Some(partner) => Pairing::chatting(id, partner.clone()),
            None => Pairing::searching(id),
        })
    }

    pub async fn create_waiting(&self, user: &UserId) -> Result<Pairing, AppError> {
        let reservation = self.reserve_waiting(user)?;
        self.commit_waiting(reservation).await
    }

    /// Publish a new waiting session for `user` in memory only. Never waits.
    pub fn reserve_waiting(&self, user: &UserId) -> Result<Reservation, AppError> {
        if let Some(existing) = self.session_of(user) {
            return Err(AppError::Internal(format!(
                "{} is already placed in session {}",
                user, existing
            )));
        }

        let id = Uuid::now_v7();
        let created_at = now_millis();

        let cell = Arc::new(Mutex::new(Session::new(id, created_at, user.clone())));
        let session = cell
            .clone()
            .try_lock_owned()
            .map_err(|_| AppError::Internal(format!("fresh session {} is locked", id)))?;

        self.sessions.insert(
            id,
            Arc::new(SessionSlot {
                claiming: AtomicBool::new(false),
                session: cell,
            }),
        );
        self.membership.insert(user.clone(), id);
        self.waiting.insert(id, created_at);

        Ok(Reservation {
            id,
            created_at,
            user: user.clone(),
            session,
        })
    }

    /// Store a reserved session. On failure the reservation is withdrawn and claimers waiting on
    /// it see an ended session.
    pub async fn commit_waiting(&self, reservation: Reservation) -> Result<Pairing, AppError> {
        let Reservation {
            id,
            created_at,
            user,
            mut session,
        } = reservation;

        let stored =
            SessionRepository::create_waiting(&self.db, &id.to_string(), user.as_str(), created_at)
                .await;

        if let Err(e) = stored {
            session.remove(&user);
            self.sessions.remove(&id);
            self.waiting.remove(&id);
            self.membership.remove_if(&user, |_, current| *current == id);

            return Err(if e.is_unique_violation() {
                AppError::Internal(format!("{} already holds a participant entry", user))
            } else {
                e
            });
        }

        tracing::debug!(session = %id, user = %user, "created waiting session");
        Ok(Pairing::searching(id))
    }

    /// Claim-or-skip: take the free seat of `id` without waiting on other claimers.
    ///
    /// Returns `Conflict` when another caller is claiming the session, it is no longer
    /// claimable, or the storage insert lost a race.
    pub async fn join(&self, id: SessionId, user: &UserId) -> Result<Pairing, AppError> {
        if !self.sessions.contains_key(&id) {
            return Err(AppError::Conflict(format!("session {} is gone", id)));
        }
        let claim = self
            .try_claim(id)
            .ok_or_else(|| AppError::Conflict(format!("session {} is being claimed", id)))?;

        let mut session = claim.slot.session.clone().lock_owned().await;

        if let Some(reason) = session.claim_blocker(user) {
            return Err(AppError::Conflict(reason.to_string()));
        }
        if self.membership.contains_key(user) {
            return Err(AppError::Conflict(format!("{} is already placed", user)));
        }

        let partner = session
            .occupants()
            .next()
            .cloned()
            .ok_or_else(|| AppError::Conflict(format!("session {} is empty", id)))?;

        let joined_at = now_millis();
        SessionRepository::activate(&self.db, &id.to_string(), user.as_str(), joined_at)
            .await
            .map_err(|e| {
                if e.is_unique_violation() {
                    AppError::Conflict(format!("participant insert for {} lost a race", user))
                } else {
                    e
                }
            })?;

        session.admit(user.clone(), joined_at);
        self.waiting.remove(&id);
        self.membership.insert(user.clone(), id);

        let event = ServerEvent::ParticipantJoined {
            session_id: id,
            user_id: user.clone(),
        };
        self.hub.publish(session.occupants(), &event);
        relay::post_notice(&self.db, &self.hub, &session, JOINED_NOTICE).await;

        tracing::info!(session = %id, user = %user, partner = %partner, "paired");
        Ok(Pairing::chatting(id, partner))
    }

    /// Remove `user` from `id`. Leaving a session one is not part of is a no-op.
    pub async fn leave(&self, id: SessionId, user: &UserId) -> Result<LeaveOutcome, AppError> {
        let Some(slot) = self.slot(id) else {
            return Ok(LeaveOutcome::NotMember);
        };

        let mut session = slot.session.clone().lock_owned().await;
        if !session.has_occupant(user) {
            return Ok(LeaveOutcome::NotMember);
        }

        let session_key = id.to_string();

        if session.occupant_count() == 1 {
            SessionRepository::end(&self.db, &session_key, now_millis()).await?;

            session.remove(user);
            self.sessions.remove(&id);
            self.waiting.remove(&id);
            self.membership.remove_if(user, |_, current| *current == id);

            tracing::info!(session = %id, user = %user, "session ended");
            return Ok(LeaveOutcome::Ended);
        }

        SessionRepository::release(&self.db, &session_key, user.as_str()).await?;

        session.remove(user);
        self.membership.remove_if(user, |_, current| *current == id);
        self.waiting.insert(id, session.created_at());

        let event = ServerEvent::ParticipantLeft {
            session_id: id,
            user_id: user.clone(),
        };
        self.hub.publish(session.occupants(), &event);
        relay::post_notice(&self.db, &self.hub, &session, LEFT_NOTICE).await;

        tracing::info!(session = %id, user = %user, "participant left, session waiting again");
        Ok(LeaveOutcome::Requeued)
    }
}
