//! Online-user tracking.
//!
//! Maintains the set of users reported online by the realtime channel,
//! with the time each was last seen coming online.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use courier_shared::{ServerEvent, UserId};
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct PresenceTracker {
    online: HashMap<UserId, DateTime<Utc>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_online(&mut self, user_id: UserId) {
        debug!(user = %user_id, "User online");
        self.online.entry(user_id).or_insert_with(Utc::now);
    }

    pub fn on_offline(&mut self, user_id: &UserId) {
        if self.online.remove(user_id).is_some() {
            debug!(user = %user_id, "User offline");
        }
    }

    /// Apply a presence event. Returns `false` for every other event kind.
    pub fn apply(&mut self, event: &ServerEvent) -> bool {
        match event {
            ServerEvent::UserOnline { user_id, .. } => {
                self.on_online(user_id.clone());
                true
            }
            ServerEvent::UserOffline { user_id, .. } => {
                self.on_offline(user_id);
                true
            }
            _ => false,
        }
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.online.contains_key(user_id)
    }

    pub fn online_since(&self, user_id: &UserId) -> Option<DateTime<Utc>> {
        self.online.get(user_id).copied()
    }

    /// Online users, sorted for stable display.
    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.online.keys().cloned().collect();
        users.sort();
        users
    }

    pub fn online_count(&self) -> usize {
        self.online.len()
    }
}
