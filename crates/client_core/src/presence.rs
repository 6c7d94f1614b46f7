//! Ephemeral signals: remote typing indicators, the local typing debouncer
//! and the online set.

use std::collections::{HashMap, HashSet};

use shared::domain::{ConversationId, UserId};
use tokio::time::{Duration, Instant};

pub const DEFAULT_TYPING_EXPIRY: Duration = Duration::from_secs(3);
pub const DEFAULT_TYPING_IDLE: Duration = Duration::from_secs(1);

/// Remote typing state keyed by conversation and user.
///
/// A `true` is only trusted until its deadline; after that the user reads as
/// not typing even if no explicit `false` ever arrived.
#[derive(Debug)]
pub struct TypingTracker {
    expiry: Duration,
    deadlines: HashMap<(ConversationId, UserId), Instant>,
}

impl Default for TypingTracker {
    fn default() -> Self {
        Self::new(DEFAULT_TYPING_EXPIRY)
    }
}

impl TypingTracker {
    pub fn new(expiry: Duration) -> Self {
        Self {
            expiry,
            deadlines: HashMap::new(),
        }
    }

    /// Records a typing event and returns the new deadline when the user is
    /// now typing. Each event supersedes the previous deadline.
    pub fn observe(
        &mut self,
        conversation_id: &ConversationId,
        user_id: &UserId,
        is_typing: bool,
        now: Instant,
    ) -> Option<Instant> {
        let key = (conversation_id.clone(), user_id.clone());
        if is_typing {
            let deadline = now + self.expiry;
            self.deadlines.insert(key, deadline);
            Some(deadline)
        } else {
            self.deadlines.remove(&key);
            None
        }
    }

    pub fn is_typing(&self, conversation_id: &ConversationId, user_id: &UserId, now: Instant) -> bool {
        self.deadlines
            .get(&(conversation_id.clone(), user_id.clone()))
            .is_some_and(|deadline| *deadline > now)
    }

    /// Drops every entry whose window has passed and returns them.
    pub fn expire(&mut self, now: Instant) -> Vec<(ConversationId, UserId)> {
        let expired: Vec<_> = self
            .deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.deadlines.remove(key);
        }
        expired
    }

    pub fn typing_users(&self, conversation_id: &ConversationId, now: Instant) -> Vec<UserId> {
        let mut users: Vec<_> = self
            .deadlines
            .iter()
            .filter(|((conversation, _), deadline)| conversation == conversation_id && **deadline > now)
            .map(|((_, user), _)| user.clone())
            .collect();
        users.sort();
        users
    }

    pub fn clear_conversation(&mut self, conversation_id: &ConversationId) {
        self.deadlines
            .retain(|(conversation, _), _| conversation != conversation_id);
    }

    pub fn clear(&mut self) {
        self.deadlines.clear();
    }
}

/// Turns composer edits into `typing` emissions.
///
/// Emits `true` once when content appears, `false` after the idle window,
/// immediately when the content is cleared, and on [`stop`](Self::stop).
#[derive(Debug)]
pub struct TypingDebouncer {
    idle: Duration,
    active: bool,
    deadline: Option<Instant>,
}

impl Default for TypingDebouncer {
    fn default() -> Self {
        Self::new(DEFAULT_TYPING_IDLE)
    }
}

impl TypingDebouncer {
    pub fn new(idle: Duration) -> Self {
        Self {
            idle,
            active: false,
            deadline: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn input_changed(&mut self, content: &str, now: Instant) -> Option<bool> {
        if content.trim().is_empty() {
            return self.stop();
        }
        self.deadline = Some(now + self.idle);
        if self.active {
            None
        } else {
            self.active = true;
            Some(true)
        }
    }

    /// Returns `Some(false)` once the idle window has elapsed.
    pub fn poll(&mut self, now: Instant) -> Option<bool> {
        match self.deadline {
            Some(deadline) if deadline <= now => self.stop(),
            _ => None,
        }
    }

    pub fn stop(&mut self) -> Option<bool> {
        self.deadline = None;
        if self.active {
            self.active = false;
            Some(false)
        } else {
            None
        }
    }

    /// Forgets state without emitting, used when the link is gone.
    pub fn reset(&mut self) {
        self.active = false;
        self.deadline = None;
    }
}

#[derive(Debug, Default)]
pub struct PresenceSet {
    online: HashSet<UserId>,
}

impl PresenceSet {
    pub fn mark_online(&mut self, user_id: UserId) -> bool {
        self.online.insert(user_id)
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.online.contains(user_id)
    }

    pub fn clear(&mut self) {
        self.online.clear();
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
