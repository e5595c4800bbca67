/// Push events delivered by the realtime transport
use crate::error::{Result, SyncError};
use crate::model::{ConversationKind, Message, MessageSnapshot, Timestamp};
use serde::{Deserialize, Serialize};

pub const EVENT_NEW_MESSAGE: &str = "message:new";
pub const EVENT_CONVERSATION_UPDATED: &str = "conversation:updated";
pub const EVENT_CONVERSATION_CREATED: &str = "conversation:created";

/// Every event name the session subscribes to
pub const PUSH_EVENT_NAMES: [&str; 3] = [
    EVENT_NEW_MESSAGE,
    EVENT_CONVERSATION_UPDATED,
    EVENT_CONVERSATION_CREATED,
];

/// `message:new` payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessageEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub sent_at: Timestamp,
}

impl NewMessageEvent {
    pub fn into_message(self) -> Message {
        // Older servers omit the message id; derive a stable one so duplicates still collapse
        let id = self
            .id
            .unwrap_or_else(|| {
                format!(
                    "{}:{}:{}",
                    self.conversation_id,
                    self.sender_id,
                    self.sent_at.to_rfc3339()
                )
            });
        Message {
            id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            content: self.content,
            sent_at: self.sent_at,
        }
    }
}

/// `conversation:updated` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationUpdatedEvent {
    pub conversation_id: String,
    #[serde(default)]
    pub last_message: Option<MessageSnapshot>,
    pub updated_at: Timestamp,
}

/// `conversation:created` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationCreatedEvent {
    pub conversation_id: String,
    pub kind: ConversationKind,
    #[serde(default)]
    pub participant_ids: Option<Vec<String>>,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub last_message: Option<MessageSnapshot>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl ConversationCreatedEvent {
    /// The metadata-refresh view of this event, used when the id is already known
    pub fn as_update(&self) -> ConversationUpdatedEvent {
        ConversationUpdatedEvent {
            conversation_id: self.conversation_id.clone(),
            last_message: self.last_message.clone(),
            updated_at: self.updated_at,
        }
    }

    /// First participant that is not the local user
    pub fn other_participant(&self, local_user_id: &str) -> Option<&str> {
        self.participant_ids
            .as_deref()?
            .iter()
            .map(String::as_str)
            .find(|id| *id != local_user_id && !id.is_empty())
    }
}

#[derive(Debug, Clone)]
pub enum PushEvent {
    NewMessage(Message),
    ConversationUpdated(ConversationUpdatedEvent),
    ConversationCreated(ConversationCreatedEvent),
}

impl PushEvent {
    /// Decode a raw transport payload for the given event name
    pub fn decode(event_name: &str, payload: serde_json::Value) -> Result<Self> {
        match event_name {
            EVENT_NEW_MESSAGE => {
                let ev: NewMessageEvent = serde_json::from_value(payload)?;
                Ok(PushEvent::NewMessage(ev.into_message()))
            }
            EVENT_CONVERSATION_UPDATED => {
                Ok(PushEvent::ConversationUpdated(serde_json::from_value(payload)?))
            }
            EVENT_CONVERSATION_CREATED => {
                Ok(PushEvent::ConversationCreated(serde_json::from_value(payload)?))
            }
            other => Err(SyncError::MalformedEvent(format!(
                "unknown event name '{}'",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PushEvent::NewMessage(_) => EVENT_NEW_MESSAGE,
            PushEvent::ConversationUpdated(_) => EVENT_CONVERSATION_UPDATED,
            PushEvent::ConversationCreated(_) => EVENT_CONVERSATION_CREATED,
        }
    }

    pub fn conversation_id(&self) -> &str {
        match self {
            PushEvent::NewMessage(m) => &m.conversation_id,
            PushEvent::ConversationUpdated(e) => &e.conversation_id,
            PushEvent::ConversationCreated(e) => &e.conversation_id,
        }
    }
}
