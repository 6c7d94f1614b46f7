//! Merges REST history and push events into one ordered message list per
//! conversation.
//!
//! The list never holds two messages with the same id. History keeps the
//! server's order; live events append in arrival order.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, MessageId, MessageKind, MessageStatus, UserId},
    protocol::MessagePayload,
};

#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub kind: MessageKind,
    pub status: MessageStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub is_from_me: bool,
}

impl ChatMessage {
    pub fn from_payload(payload: MessagePayload, is_from_me: bool) -> Self {
        let sent_at = payload.timestamp();
        Self {
            id: payload.id,
            conversation_id: payload.conversation_id,
            sender_id: payload.sender_id,
            content: payload.content,
            kind: payload.kind,
            status: payload.status.unwrap_or_default(),
            sent_at,
            is_from_me,
        }
    }

    pub fn is_unread_incoming(&self) -> bool {
        !self.is_from_me && !self.status.is_read()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushKind {
    Received,
    SentEcho,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Appended,
    Duplicate,
    /// Nothing is cached for the conversation yet; the caller should load
    /// history instead.
    NoCache,
}

pub fn tag_push(payload: MessagePayload, kind: PushKind, me: &UserId) -> ChatMessage {
    let is_from_me = match kind {
        PushKind::SentEcho => true,
        PushKind::Received => &payload.sender_id == me,
    };
    ChatMessage::from_payload(payload, is_from_me)
}

/// Appends a pushed message unless its id is already held.
pub fn merge_push(
    list: &mut Vec<ChatMessage>,
    payload: MessagePayload,
    kind: PushKind,
    me: &UserId,
) -> bool {
    if list.iter().any(|held| held.id == payload.id) {
        return false;
    }
    list.push(tag_push(payload, kind, me));
    true
}

/// Builds the held list from a fetched page.
///
/// Held messages missing from the page survive only when they are newer than
/// everything in it, which covers pushes that raced a stale fetch. A message
/// already read locally stays read.
pub fn merge_history(
    held: &[ChatMessage],
    page: Vec<MessagePayload>,
    me: &UserId,
) -> Vec<ChatMessage> {
    let read_locally: HashSet<&MessageId> = held
        .iter()
        .filter(|message| message.status.is_read())
        .map(|message| &message.id)
        .collect();

    let mut seen = HashSet::new();
    let mut merged = Vec::with_capacity(page.len());
    for payload in page {
        if !seen.insert(payload.id.clone()) {
            continue;
        }
        let is_from_me = &payload.sender_id == me;
        let mut message = ChatMessage::from_payload(payload, is_from_me);
        if read_locally.contains(&message.id) {
            message.status = MessageStatus::Read;
        }
        merged.push(message);
    }

    let newest = merged.iter().filter_map(|message| message.sent_at).max();
    for message in held {
        if seen.contains(&message.id) {
            continue;
        }
        let keep = match (newest, message.sent_at) {
            (None, _) => true,
            (Some(newest), Some(sent_at)) => sent_at > newest,
            (Some(_), None) => false,
        };
        if keep {
            seen.insert(message.id.clone());
            merged.push(message.clone());
        }
    }
    merged
}

/// Marks matching messages read; unknown ids are ignored. Returns how many
/// changed.
pub fn apply_read_receipt(list: &mut [ChatMessage], message_ids: &[MessageId]) -> usize {
    let targets: HashSet<&MessageId> = message_ids.iter().collect();
    let mut changed = 0;
    for message in list.iter_mut() {
        if targets.contains(&message.id) && !message.status.is_read() {
            message.status = MessageStatus::Read;
            changed += 1;
        }
    }
    changed
}

pub fn unread_incoming(list: &[ChatMessage]) -> Vec<MessageId> {
    list.iter()
        .filter(|message| message.is_unread_incoming())
        .map(|message| message.id.clone())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LoadPhase {
    #[default]
    Empty,
    Loading,
    Loaded,
    Failed(String),
}

#[derive(Debug, Default)]
struct ConversationView {
    phase: LoadPhase,
    messages: Option<Vec<ChatMessage>>,
}

/// Per-conversation held lists, the single source the UI reads from.
#[derive(Debug, Default)]
pub struct MessageCache {
    views: HashMap<ConversationId, ConversationView>,
}

impl MessageCache {
    pub fn phase(&self, conversation_id: &ConversationId) -> LoadPhase {
        self.views
            .get(conversation_id)
            .map(|view| view.phase.clone())
            .unwrap_or_default()
    }

    pub fn messages(&self, conversation_id: &ConversationId) -> Option<&[ChatMessage]> {
        self.views
            .get(conversation_id)
            .and_then(|view| view.messages.as_deref())
    }

    pub fn begin_load(&mut self, conversation_id: &ConversationId) {
        self.views
            .entry(conversation_id.clone())
            .or_default()
            .phase = LoadPhase::Loading;
    }

    pub fn complete_load(
        &mut self,
        conversation_id: &ConversationId,
        page: Vec<MessagePayload>,
        me: &UserId,
    ) {
        let view = self.views.entry(conversation_id.clone()).or_default();
        let held = view.messages.take().unwrap_or_default();
        view.messages = Some(merge_history(&held, page, me));
        view.phase = LoadPhase::Loaded;
    }

    pub fn fail_load(&mut self, conversation_id: &ConversationId, reason: impl Into<String>) {
        self.views
            .entry(conversation_id.clone())
            .or_default()
            .phase = LoadPhase::Failed(reason.into());
    }

    pub fn merge_push(
        &mut self,
        payload: MessagePayload,
        kind: PushKind,
        me: &UserId,
    ) -> MergeOutcome {
        let Some(list) = self
            .views
            .get_mut(&payload.conversation_id)
            .and_then(|view| view.messages.as_mut())
        else {
            return MergeOutcome::NoCache;
        };
        if merge_push(list, payload, kind, me) {
            MergeOutcome::Appended
        } else {
            MergeOutcome::Duplicate
        }
    }

    pub fn apply_read_receipt(
        &mut self,
        conversation_id: &ConversationId,
        message_ids: &[MessageId],
    ) -> usize {
        self.views
            .get_mut(conversation_id)
            .and_then(|view| view.messages.as_mut())
            .map_or(0, |list| apply_read_receipt(list, message_ids))
    }

    pub fn unread_incoming(&self, conversation_id: &ConversationId) -> Vec<MessageId> {
        self.messages(conversation_id)
            .map(unread_incoming)
            .unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.views.clear();
    }
}

#[cfg(test)]
#[path = "tests/reconciler_tests.rs"]
mod tests;
