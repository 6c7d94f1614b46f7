use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{ConversationId, MessageId, MessageKind, MessageStatus, Participant, UserId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<UserId>,
    pub content: String,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl MessagePayload {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.sent_at.or(self.created_at)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: ConversationId,
    pub participant: Participant,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub unread_count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingNotice {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    pub conversation_id: ConversationId,
    pub message_ids: Vec<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_by: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceNotice {
    pub user_id: UserId,
}

/// Server to client events on the messaging namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    NewMessage(MessagePayload),
    MessageSent(MessagePayload),
    UserTyping(TypingNotice),
    MessagesRead(ReadReceipt),
    UserOnline(PresenceNotice),
}

impl ServerEvent {
    pub const NAMES: [&'static str; 5] = [
        "new-message",
        "message-sent",
        "user-typing",
        "messages-read",
        "user-online",
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::NewMessage(_) => "new-message",
            Self::MessageSent(_) => "message-sent",
            Self::UserTyping(_) => "user-typing",
            Self::MessagesRead(_) => "messages-read",
            Self::UserOnline(_) => "user-online",
        }
    }

    /// Decodes a named event. Names this client does not consume yield
    /// `Ok(None)`; known names with a malformed body are an error.
    pub fn from_named(name: &str, data: Value) -> Result<Option<Self>, serde_json::Error> {
        if !Self::NAMES.contains(&name) {
            return Ok(None);
        }
        let tagged = serde_json::json!({ "event": name, "data": data });
        serde_json::from_value(tagged).map(Some)
    }

    pub fn into_named(self) -> Result<(String, Value), serde_json::Error> {
        split_named(serde_json::to_value(self)?)
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Self::NewMessage(message) | Self::MessageSent(message) => {
                Some(&message.conversation_id)
            }
            Self::UserTyping(notice) => Some(&notice.conversation_id),
            Self::MessagesRead(receipt) => Some(&receipt.conversation_id),
            Self::UserOnline(_) => None,
        }
    }
}

/// Client to server commands on the messaging namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientCommand {
    JoinConversation {
        conversation_id: ConversationId,
    },
    LeaveConversation {
        conversation_id: ConversationId,
    },
    SendMessage {
        conversation_id: ConversationId,
        content: String,
        #[serde(rename = "type")]
        kind: MessageKind,
    },
    Typing {
        conversation_id: ConversationId,
        is_typing: bool,
    },
    MarkRead {
        conversation_id: ConversationId,
        message_ids: Vec<MessageId>,
    },
}

impl ClientCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinConversation { .. } => "join-conversation",
            Self::LeaveConversation { .. } => "leave-conversation",
            Self::SendMessage { .. } => "send-message",
            Self::Typing { .. } => "typing",
            Self::MarkRead { .. } => "mark-read",
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        match self {
            Self::JoinConversation { conversation_id }
            | Self::LeaveConversation { conversation_id }
            | Self::SendMessage {
                conversation_id, ..
            }
            | Self::Typing {
                conversation_id, ..
            }
            | Self::MarkRead {
                conversation_id, ..
            } => conversation_id,
        }
    }

    pub fn into_named(self) -> Result<(String, Value), serde_json::Error> {
        split_named(serde_json::to_value(self)?)
    }

    pub fn from_named(name: &str, data: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::json!({ "event": name, "data": data }))
    }
}

fn split_named(value: Value) -> Result<(String, Value), serde_json::Error> {
    use serde::de::Error as _;

    let Value::Object(mut fields) = value else {
        return Err(serde_json::Error::custom("tagged event must be an object"));
    };
    let name = match fields.remove("event") {
        Some(Value::String(name)) => name,
        _ => return Err(serde_json::Error::custom("tagged event is missing its name")),
    };
    let data = fields.remove("data").unwrap_or(Value::Null);
    Ok((name, data))
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationListQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePageQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateConversationRequest {
    pub participant_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub conversation_id: ConversationId,
    pub content: String,
    #[serde(rename = "type", default)]
    pub kind: MessageKind,
}

/// List endpoints answer either with a bare array or a `{ "data": [...] }`
/// envelope.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ListResponse<T> {
    Envelope { data: Vec<T> },
    Bare(Vec<T>),
}

impl<T> ListResponse<T> {
    pub fn into_items(self) -> Vec<T> {
        match self {
            Self::Envelope { data } => data,
            Self::Bare(items) => items,
        }
    }
}

/// Single-object endpoints may wrap their body the same way.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ItemResponse<T> {
    Envelope { data: T },
    Bare(T),
}

impl<T> ItemResponse<T> {
    pub fn into_item(self) -> T {
        match self {
            Self::Envelope { data } => data,
            Self::Bare(item) => item,
        }
    }
}
