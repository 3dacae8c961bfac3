use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::AppError;
use crate::rooms::{Pairing, SessionId, SessionRegistry, UserId};

/// Places each requester into exactly one session.
pub struct PairingCoordinator {
    registry: Arc<SessionRegistry>,
    // serializes a single user's own requests; different users never share a gate
    gates: DashMap<UserId, Arc<Mutex<()>>>,
    // held only while deciding to open a new session; never across a claim or a storage write
    creating: Mutex<()>,
    max_claim_attempts: usize,
}

impl PairingCoordinator {
    pub fn new(registry: Arc<SessionRegistry>, max_claim_attempts: usize) -> Self {
        Self {
            registry,
            gates: DashMap::new(),
            creating: Mutex::new(()),
            max_claim_attempts: max_claim_attempts.max(1),
        }
    }

    /// Join the oldest claimable waiting session, or open a new one.
    ///
    /// A user who already occupies a session gets that session back unchanged.
    pub async fn request_pairing(&self, user: &UserId) -> Result<Pairing, AppError> {
        let gate = self.gates.entry(user.clone()).or_default().clone();

        let result = {
            let _guard = gate.lock().await;
            self.place(user).await
        };

        drop(gate);
        self.gates.remove_if(user, |_, gate| Arc::strong_count(gate) == 1);

        result
    }

    async fn place(&self, user: &UserId) -> Result<Pairing, AppError> {
        if let Some(existing) = self.registry.placement(user).await {
            tracing::debug!(user = %user, session = %existing.session_id, "already placed");
            return Ok(existing);
        }

        let mut skipped = HashSet::new();
        for _ in 0..self.max_claim_attempts {
            if let Some(pairing) = self.claim_any(user, &mut skipped).await? {
                return Ok(pairing);
            }

            // a session another requester opened since the last pass is claimed, not duplicated
            let reservation = {
                let _creating = self.creating.lock().await;
                let fresh = self
                    .registry
                    .waiting_candidates()
                    .into_iter()
                    .any(|id| !skipped.contains(&id));
                if fresh {
                    None
                } else {
                    Some(self.registry.reserve_waiting(user)?)
                }
            };

            if let Some(reservation) = reservation {
                return self.registry.commit_waiting(reservation).await;
            }
        }

        self.registry.create_waiting(user).await
    }

    /// Try waiting sessions oldest first, skipping any that cannot be claimed right now.
    async fn claim_any(
        &self,
        user: &UserId,
        skipped: &mut HashSet<SessionId>,
    ) -> Result<Option<Pairing>, AppError> {
        let candidates: Vec<SessionId> = self
            .registry
            .waiting_candidates()
            .into_iter()
            .filter(|id| !skipped.contains(id))
            .take(self.max_claim_attempts)
            .collect();

        for candidate in candidates {
            match self.registry.join(candidate, user).await {
                Ok(pairing) => return Ok(Some(pairing)),
                Err(AppError::Conflict(reason)) => {
                    tracing::debug!(user = %user, session = %candidate, "skipping candidate: {}", reason);
                    skipped.insert(candidate);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }
}
