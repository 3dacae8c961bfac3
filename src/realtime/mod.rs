//! Real-time channel plumbing shared by rooms and presence.

pub mod channel;
pub mod presence;

pub use channel::{Hub, ServerEvent};
pub use presence::PresenceTracker;
