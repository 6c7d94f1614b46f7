use std::collections::HashSet;

use shared::{domain::ConversationId, protocol::ClientCommand};

/// Tracks which conversation rooms the server believes this client is in.
///
/// Every method returns the commands to put on the wire; nothing is emitted
/// while offline, and the open conversation is re-joined on reconnect.
#[derive(Debug, Default)]
pub struct RoomMembership {
    open: Option<ConversationId>,
    joined: HashSet<ConversationId>,
}

impl RoomMembership {
    pub fn open_conversation(&self) -> Option<&ConversationId> {
        self.open.as_ref()
    }

    pub fn is_open(&self, conversation_id: &ConversationId) -> bool {
        self.open.as_ref() == Some(conversation_id)
    }

    pub fn is_joined(&self, conversation_id: &ConversationId) -> bool {
        self.joined.contains(conversation_id)
    }

    pub fn join(&mut self, conversation_id: &ConversationId, connected: bool) -> Option<ClientCommand> {
        if !connected || !self.joined.insert(conversation_id.clone()) {
            return None;
        }
        Some(ClientCommand::JoinConversation {
            conversation_id: conversation_id.clone(),
        })
    }

    pub fn leave(&mut self, conversation_id: &ConversationId, connected: bool) -> Option<ClientCommand> {
        if !self.joined.remove(conversation_id) || !connected {
            return None;
        }
        Some(ClientCommand::LeaveConversation {
            conversation_id: conversation_id.clone(),
        })
    }

    /// Makes `conversation_id` the open conversation, leaving whichever one
    /// was open before.
    pub fn open(&mut self, conversation_id: &ConversationId, connected: bool) -> Vec<ClientCommand> {
        let mut commands = Vec::new();
        if let Some(previous) = self.open.take() {
            if &previous != conversation_id {
                commands.extend(self.leave(&previous, connected));
            }
        }
        self.open = Some(conversation_id.clone());
        commands.extend(self.join(conversation_id, connected));
        commands
    }

    pub fn close(&mut self, conversation_id: &ConversationId, connected: bool) -> Vec<ClientCommand> {
        if self.is_open(conversation_id) {
            self.open = None;
        }
        self.leave(conversation_id, connected).into_iter().collect()
    }

    pub fn on_connected(&mut self) -> Vec<ClientCommand> {
        self.joined.clear();
        match self.open.clone() {
            Some(open) => self.join(&open, true).into_iter().collect(),
            None => Vec::new(),
        }
    }

    pub fn on_disconnected(&mut self) {
        self.joined.clear();
    }

    pub fn leave_all(&mut self, connected: bool) -> Vec<ClientCommand> {
        self.open = None;
        let mut joined: Vec<_> = self.joined.drain().collect();
        joined.sort();
        if !connected {
            return Vec::new();
        }
        joined
            .into_iter()
            .map(|conversation_id| ClientCommand::LeaveConversation { conversation_id })
            .collect()
    }
}
