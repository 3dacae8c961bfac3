use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::rooms::UserId;

/// Set of connected visitors, independent of pairing.
pub struct PresenceTracker {
    members: DashMap<UserId, Instant>,
    ttl: Duration,
}

impl PresenceTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            members: DashMap::new(),
            ttl,
        }
    }

    /// Returns true when `user` was not already present.
    pub fn track(&self, user: &UserId) -> bool {
        self.members.insert(user.clone(), Instant::now()).is_none()
    }

    pub fn untrack(&self, user: &UserId) -> bool {
        self.members.remove(user).is_some()
    }

    /// Heartbeat. Re-adds a member that was swept while still connected.
    pub fn touch(&self, user: &UserId) -> bool {
        self.track(user)
    }

    pub fn count(&self) -> usize {
        self.members.len()
    }

    pub fn snapshot(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.members.iter().map(|e| e.key().clone()).collect();
        users.sort();
        users
    }

    /// Evict members whose last heartbeat is older than the ttl.
    pub fn sweep(&self) -> Vec<UserId> {
        self.sweep_at(Instant::now())
    }

    pub(crate) fn sweep_at(&self, now: Instant) -> Vec<UserId> {
        let mut evicted = Vec::new();
        self.members.retain(|user, seen| {
            let alive = now.saturating_duration_since(*seen) <= self.ttl;
            if !alive {
                evicted.push(user.clone());
            }
            alive
        });
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> UserId {
        UserId::parse(id).unwrap()
    }

    #[test]
    fn counts_distinct_users() {
        let presence = PresenceTracker::new(Duration::from_secs(30));
        assert!(presence.track(&user("a")));
        assert!(!presence.track(&user("a")));
        presence.track(&user("b"));
        assert_eq!(presence.count(), 2);

        assert!(presence.untrack(&user("a")));
        assert!(!presence.untrack(&user("a")));
        assert_eq!(presence.snapshot(), vec![user("b")]);
    }

    #[test]
    fn sweep_evicts_silent_members() {
        let presence = PresenceTracker::new(Duration::from_secs(30));
        presence.track(&user("a"));

        assert!(presence.sweep().is_empty());
        let later = Instant::now() + Duration::from_secs(31);
        assert_eq!(presence.sweep_at(later), vec![user("a")]);
        assert_eq!(presence.count(), 0);
    }
}
