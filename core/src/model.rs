/// Conversation data model shared by the store, reconciler and collaborators
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type Timestamp = DateTime<Utc>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationKind {
    Direct,
    Group,
}

/// The other party of a direct conversation.
/// Empty `display_name` means the descriptor has not been enriched yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantDescriptor {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub email: String,
}

impl ParticipantDescriptor {
    pub fn placeholder(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: String::new(),
            email: String::new(),
        }
    }

    pub fn is_enriched(&self) -> bool {
        !self.display_name.is_empty()
    }
}

/// Group metadata. Empty `name` means not enriched yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub avatar: Option<String>,
}

impl GroupDescriptor {
    pub fn placeholder(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            description: String::new(),
            avatar: None,
        }
    }

    pub fn is_enriched(&self) -> bool {
        !self.name.is_empty()
    }
}

/// Who the conversation is with; doubles as the `kind` discriminator on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Counterpart {
    Direct { peer: ParticipantDescriptor },
    Group { group: GroupDescriptor },
}

impl Counterpart {
    pub fn kind(&self) -> ConversationKind {
        match self {
            Counterpart::Direct { .. } => ConversationKind::Direct,
            Counterpart::Group { .. } => ConversationKind::Group,
        }
    }

    pub fn is_enriched(&self) -> bool {
        match self {
            Counterpart::Direct { peer } => peer.is_enriched(),
            Counterpart::Group { group } => group.is_enriched(),
        }
    }

    /// Id of the peer or group this descriptor points at
    pub fn target_id(&self) -> &str {
        match self {
            Counterpart::Direct { peer } => &peer.id,
            Counterpart::Group { group } => &group.id,
        }
    }
}

/// Snapshot of the latest message kept on a conversation for list previews
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSnapshot {
    pub id: String,
    pub sender_id: String,
    pub content: String,
    pub sent_at: Timestamp,
}

/// A chat message as delivered by push events and `send_message`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub sent_at: Timestamp,
}

impl Message {
    pub fn snapshot(&self) -> MessageSnapshot {
        MessageSnapshot {
            id: self.id.clone(),
            sender_id: self.sender_id.clone(),
            content: self.content.clone(),
            sent_at: self.sent_at,
        }
    }
}

/// One entry of the conversation list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    #[serde(flatten)]
    pub counterpart: Counterpart,
    #[serde(default)]
    pub last_message: Option<MessageSnapshot>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default)]
    pub total_messages: u64,
    pub updated_at: Timestamp,
}

impl Conversation {
    pub fn direct(id: impl Into<String>, peer: ParticipantDescriptor, updated_at: Timestamp) -> Self {
        Self {
            id: id.into(),
            counterpart: Counterpart::Direct { peer },
            last_message: None,
            unread_count: 0,
            total_messages: 0,
            updated_at,
        }
    }

    pub fn group(id: impl Into<String>, group: GroupDescriptor, updated_at: Timestamp) -> Self {
        Self {
            id: id.into(),
            counterpart: Counterpart::Group { group },
            last_message: None,
            unread_count: 0,
            total_messages: 0,
            updated_at,
        }
    }

    pub fn kind(&self) -> ConversationKind {
        self.counterpart.kind()
    }

    /// True while the peer or group metadata is still missing
    pub fn needs_enrichment(&self) -> bool {
        !self.counterpart.is_enriched()
    }

    pub fn peer(&self) -> Option<&ParticipantDescriptor> {
        match &self.counterpart {
            Counterpart::Direct { peer } => Some(peer),
            Counterpart::Group { .. } => None,
        }
    }

    pub fn group_descriptor(&self) -> Option<&GroupDescriptor> {
        match &self.counterpart {
            Counterpart::Group { group } => Some(group),
            Counterpart::Direct { .. } => None,
        }
    }
}
