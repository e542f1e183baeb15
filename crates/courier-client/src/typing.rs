//! Ephemeral "is typing" state for one conversation.
//!
//! Each start hands out a generation number. The session arms an idle timer
//! with it; when the timer fires, [`TypingTracker::expire`] only removes the
//! user if no newer start (or explicit stop) has happened since.

use std::collections::HashMap;
use std::time::Duration;

use courier_shared::UserId;

#[derive(Debug, Clone)]
pub struct TypingTracker {
    idle: Duration,
    active: HashMap<UserId, u64>,
    generation: u64,
}

impl TypingTracker {
    pub fn new(idle: Duration) -> Self {
        Self {
            idle,
            active: HashMap::new(),
            generation: 0,
        }
    }

    /// How long a start stays valid without a refresh.
    pub fn idle(&self) -> Duration {
        self.idle
    }

    /// Mark `user` typing. Returns the generation to expire with.
    pub fn start(&mut self, user: UserId) -> u64 {
        self.generation += 1;
        self.active.insert(user, self.generation);
        self.generation
    }

    pub fn stop(&mut self, user: &UserId) -> bool {
        self.active.remove(user).is_some()
    }

    /// Idle timeout for `user`. Stale generations are ignored.
    pub fn expire(&mut self, user: &UserId, generation: u64) -> bool {
        if self.active.get(user) == Some(&generation) {
            self.active.remove(user);
            true
        } else {
            false
        }
    }

    pub fn is_typing(&self, user: &UserId) -> bool {
        self.active.contains_key(user)
    }

    /// Typing users, sorted for stable display.
    pub fn users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self.active.keys().cloned().collect();
        users.sort();
        users
    }
}
