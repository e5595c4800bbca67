/// Collaborator contracts: the REST data-access layer and the push transport
///
/// Both are implemented outside this crate; `sim::MemoryBackend` is the
/// in-process implementation used by the demo binary and the tests.
use crate::error::Result;
use crate::model::{Conversation, GroupDescriptor, Message, ParticipantDescriptor};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Outbound message. Without a `conversation_id` the server creates the
/// conversation lazily from `recipient_id` or `group_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessagePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub content: String,
}

/// REST data access
#[async_trait]
pub trait ConversationApi: Send + Sync {
    /// Full conversation list for the signed-in user
    async fn fetch_conversations(&self) -> Result<Vec<Conversation>>;

    /// `Ok(None)` when the group does not exist
    async fn fetch_group_by_id(&self, group_id: &str) -> Result<Option<GroupDescriptor>>;

    /// `Ok(None)` when the user does not exist
    async fn fetch_participant_by_id(&self, user_id: &str) -> Result<Option<ParticipantDescriptor>>;

    async fn mark_conversation_read(&self, conversation_id: &str) -> Result<()>;

    async fn send_message(&self, payload: SendMessagePayload) -> Result<Message>;
}

/// Receives the raw JSON payload of one push event
pub type EventHandler = Arc<dyn Fn(serde_json::Value) + Send + Sync>;

/// Push-event transport. Reconnects are the transport's business.
pub trait EventTransport: Send + Sync {
    /// Register the handler for an event name, replacing any previous one
    fn subscribe(&self, event_name: &str, handler: EventHandler) -> Result<()>;

    fn unsubscribe(&self, event_name: &str);
}
