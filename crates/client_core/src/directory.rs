use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, MessageId},
    protocol::ConversationSummary,
};

const RECENT_IDS_PER_CONVERSATION: usize = 64;

/// Conversation list as last fetched, kept current by live traffic.
///
/// Most recent activity first.
#[derive(Debug, Default)]
pub struct ConversationDirectory {
    entries: Vec<ConversationSummary>,
    recent: HashMap<ConversationId, VecDeque<MessageId>>,
}

impl ConversationDirectory {
    pub fn replace(&mut self, conversations: Vec<ConversationSummary>) {
        self.entries = conversations;
    }

    pub fn list(&self) -> &[ConversationSummary] {
        &self.entries
    }

    pub fn get(&self, conversation_id: &ConversationId) -> Option<&ConversationSummary> {
        self.entries
            .iter()
            .find(|entry| &entry.id == conversation_id)
    }

    pub fn upsert(&mut self, conversation: ConversationSummary) {
        self.entries.retain(|entry| entry.id != conversation.id);
        self.entries.insert(0, conversation);
    }

    /// Refreshes preview and ordering for a message seen on the wire. Unread
    /// only grows for incoming traffic outside the open conversation.
    /// Returns `false` when the conversation is not listed yet or the message
    /// id was already noted.
    pub fn note_message(
        &mut self,
        conversation_id: &ConversationId,
        message_id: &MessageId,
        preview: &str,
        at: Option<DateTime<Utc>>,
        counts_as_unread: bool,
    ) -> bool {
        let recent = self.recent.entry(conversation_id.clone()).or_default();
        if recent.contains(message_id) {
            return false;
        }
        if recent.len() == RECENT_IDS_PER_CONVERSATION {
            recent.pop_front();
        }
        recent.push_back(message_id.clone());

        let Some(index) = self
            .entries
            .iter()
            .position(|entry| &entry.id == conversation_id)
        else {
            return false;
        };
        let mut entry = self.entries.remove(index);
        entry.last_message = Some(preview.to_string());
        if at.is_some() {
            entry.last_message_at = at;
        }
        if counts_as_unread {
            entry.unread_count = entry.unread_count.saturating_add(1);
        }
        self.entries.insert(0, entry);
        true
    }

    pub fn mark_read(&mut self, conversation_id: &ConversationId) -> bool {
        match self
            .entries
            .iter_mut()
            .find(|entry| &entry.id == conversation_id)
        {
            Some(entry) if entry.unread_count > 0 => {
                entry.unread_count = 0;
                true
            }
            _ => false,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.recent.clear();
    }
}
