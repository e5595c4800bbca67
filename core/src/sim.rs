/// In-memory backend and scenario replay
///
/// `MemoryBackend` implements both collaborator traits against process-local
/// state. It backs the `chatsync` binary and the integration tests, and can be
/// told to fail or slow down individual calls.
use crate::api::{ConversationApi, EventHandler, EventTransport, SendMessagePayload};
use crate::error::{Result, SyncError};
use crate::model::{Conversation, GroupDescriptor, Message, ParticipantDescriptor};
use crate::session::SyncSession;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// Failure and latency switches
#[derive(Debug, Clone, Default)]
pub struct Faults {
    pub fail_fetch: bool,
    pub fail_lookups: bool,
    pub fail_mark_read: bool,
    pub fetch_delay: Option<Duration>,
    pub lookup_delay: Option<Duration>,
    pub mark_read_delay: Option<Duration>,
}

#[derive(Default)]
struct BackendState {
    conversations: Vec<Conversation>,
    participants: HashMap<String, ParticipantDescriptor>,
    groups: HashMap<String, GroupDescriptor>,
    faults: Faults,
    fetch_calls: usize,
    lookup_calls: usize,
    reads_started: Vec<String>,
    reads_completed: Vec<String>,
    sent: Vec<Message>,
}

#[derive(Clone)]
pub struct MemoryBackend {
    local_user_id: String,
    state: Arc<RwLock<BackendState>>,
    handlers: Arc<Mutex<HashMap<String, EventHandler>>>,
}

impl MemoryBackend {
    pub fn new(local_user_id: impl Into<String>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            state: Arc::new(RwLock::new(BackendState::default())),
            handlers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    // ===== Server-side state =====

    pub async fn set_conversations(&self, list: Vec<Conversation>) {
        self.state.write().await.conversations = list;
    }

    pub async fn upsert_conversation(&self, conv: Conversation) {
        let mut state = self.state.write().await;
        state.conversations.retain(|c| c.id != conv.id);
        state.conversations.push(conv);
    }

    pub async fn add_participant(&self, participant: ParticipantDescriptor) {
        self.state
            .write()
            .await
            .participants
            .insert(participant.id.clone(), participant);
    }

    pub async fn add_group(&self, group: GroupDescriptor) {
        self.state.write().await.groups.insert(group.id.clone(), group);
    }

    pub async fn set_faults(&self, faults: Faults) {
        self.state.write().await.faults = faults;
    }

    // ===== Inspection =====

    pub async fn fetch_calls(&self) -> usize {
        self.state.read().await.fetch_calls
    }

    pub async fn lookup_calls(&self) -> usize {
        self.state.read().await.lookup_calls
    }

    pub async fn reads_started(&self) -> Vec<String> {
        self.state.read().await.reads_started.clone()
    }

    pub async fn reads_completed(&self) -> Vec<String> {
        self.state.read().await.reads_completed.clone()
    }

    pub async fn sent_messages(&self) -> Vec<Message> {
        self.state.read().await.sent.clone()
    }

    // ===== Push side =====

    pub fn is_subscribed(&self, event_name: &str) -> bool {
        self.handlers
            .lock()
            .map(|h| h.contains_key(event_name))
            .unwrap_or(false)
    }

    /// Deliver a raw payload to the subscribed handler. Returns false when nobody listens.
    pub fn emit(&self, event_name: &str, payload: serde_json::Value) -> bool {
        // Clone the handler out so it runs without the lock held
        let handler = match self.handlers.lock() {
            Ok(handlers) => handlers.get(event_name).cloned(),
            Err(_) => None,
        };
        match handler {
            Some(handler) => {
                handler(payload);
                true
            }
            None => {
                debug!("no subscriber for {}", event_name);
                false
            }
        }
    }
}

#[async_trait]
impl ConversationApi for MemoryBackend {
    async fn fetch_conversations(&self) -> Result<Vec<Conversation>> {
        // Snapshot is taken at request time, so a slow response can be stale on arrival
        let (list, faults) = {
            let mut state = self.state.write().await;
            state.fetch_calls += 1;
            (state.conversations.clone(), state.faults.clone())
        };
        if let Some(delay) = faults.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        if faults.fail_fetch {
            return Err(SyncError::Transport("conversation list unavailable".to_string()));
        }
        Ok(list)
    }

    async fn fetch_group_by_id(&self, group_id: &str) -> Result<Option<GroupDescriptor>> {
        let faults = self.begin_lookup().await;
        if faults.fail_lookups {
            return Err(SyncError::Transport(format!("group lookup {} failed", group_id)));
        }
        Ok(self.state.read().await.groups.get(group_id).cloned())
    }

    async fn fetch_participant_by_id(&self, user_id: &str) -> Result<Option<ParticipantDescriptor>> {
        let faults = self.begin_lookup().await;
        if faults.fail_lookups {
            return Err(SyncError::Transport(format!("user lookup {} failed", user_id)));
        }
        Ok(self.state.read().await.participants.get(user_id).cloned())
    }

    async fn mark_conversation_read(&self, conversation_id: &str) -> Result<()> {
        let faults = {
            let mut state = self.state.write().await;
            state.reads_started.push(conversation_id.to_string());
            state.faults.clone()
        };
        if let Some(delay) = faults.mark_read_delay {
            tokio::time::sleep(delay).await;
        }
        if faults.fail_mark_read {
            return Err(SyncError::Transport(format!(
                "mark-as-read {} rejected",
                conversation_id
            )));
        }

        let mut state = self.state.write().await;
        if let Some(conv) = state.conversations.iter_mut().find(|c| c.id == conversation_id) {
            conv.unread_count = 0;
        }
        state.reads_completed.push(conversation_id.to_string());
        Ok(())
    }

    async fn send_message(&self, payload: SendMessagePayload) -> Result<Message> {
        let mut state = self.state.write().await;
        let now = Utc::now();

        let conversation_id = match payload.conversation_id {
            Some(id) => id,
            None => {
                let id = format!("conv-{}", Uuid::new_v4());
                let conv = match (payload.recipient_id, payload.group_id) {
                    (Some(recipient), _) => {
                        let peer = state
                            .participants
                            .get(&recipient)
                            .cloned()
                            .unwrap_or_else(|| ParticipantDescriptor::placeholder(recipient));
                        Conversation::direct(&id, peer, now)
                    }
                    (None, Some(group_id)) => {
                        let group = state
                            .groups
                            .get(&group_id)
                            .cloned()
                            .unwrap_or_else(|| GroupDescriptor::placeholder(group_id));
                        Conversation::group(&id, group, now)
                    }
                    (None, None) => {
                        return Err(SyncError::Transport(
                            "message needs a conversation, recipient or group".to_string(),
                        ))
                    }
                };
                state.conversations.push(conv);
                id
            }
        };

        let message = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.clone(),
            sender_id: self.local_user_id.clone(),
            content: payload.content,
            sent_at: now,
        };

        match state.conversations.iter_mut().find(|c| c.id == conversation_id) {
            Some(conv) => {
                conv.last_message = Some(message.snapshot());
                conv.total_messages += 1;
                conv.updated_at = now;
            }
            None => {
                return Err(SyncError::NotFound(format!("conversation {}", conversation_id)));
            }
        }
        state.sent.push(message.clone());
        Ok(message)
    }
}

impl MemoryBackend {
    async fn begin_lookup(&self) -> Faults {
        let faults = {
            let mut state = self.state.write().await;
            state.lookup_calls += 1;
            state.faults.clone()
        };
        if let Some(delay) = faults.lookup_delay {
            tokio::time::sleep(delay).await;
        }
        faults
    }
}

impl EventTransport for MemoryBackend {
    fn subscribe(&self, event_name: &str, handler: EventHandler) -> Result<()> {
        let mut handlers = self
            .handlers
            .lock()
            .map_err(|_| SyncError::Transport("handler registry poisoned".to_string()))?;
        handlers.insert(event_name.to_string(), handler);
        Ok(())
    }

    fn unsubscribe(&self, event_name: &str) {
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.remove(event_name);
        }
    }
}

// ===== Scenario replay =====

/// Scripted session run: initial server state plus a list of steps
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    #[serde(default)]
    pub conversations: Vec<Conversation>,
    #[serde(default)]
    pub participants: Vec<ParticipantDescriptor>,
    #[serde(default)]
    pub groups: Vec<GroupDescriptor>,
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Pause after the last step so in-flight work can land
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

fn default_settle_ms() -> u64 {
    200
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Step {
    /// Deliver a push event through the transport
    Emit {
        event: String,
        payload: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    Select { conversation_id: String },
    Deselect,
    Refresh,
    Send { message: SendMessagePayload },
    /// Change what the next bulk fetch returns
    SetConversations { conversations: Vec<Conversation> },
    #[serde(rename_all = "camelCase")]
    Wait { ms: u64 },
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Seed the backend with the scenario's initial server state
    pub async fn seed(&self, backend: &MemoryBackend) {
        backend.set_conversations(self.conversations.clone()).await;
        for p in &self.participants {
            backend.add_participant(p.clone()).await;
        }
        for g in &self.groups {
            backend.add_group(g.clone()).await;
        }
    }

    /// Play every step against a running session
    pub async fn play(&self, session: &SyncSession, backend: &MemoryBackend) -> Result<()> {
        for (i, step) in self.steps.iter().enumerate() {
            debug!("scenario step {}: {:?}", i, step);
            match step {
                Step::Emit { event, payload } => {
                    if !backend.emit(event, payload.clone()) {
                        info!("step {}: nobody subscribed to {}", i, event);
                    }
                }
                Step::Select { conversation_id } => session.select(conversation_id.clone())?,
                Step::Deselect => session.deselect()?,
                Step::Refresh => session.refresh()?,
                Step::Send { message } => {
                    session.send_message(message.clone()).await?;
                }
                Step::SetConversations { conversations } => {
                    backend.set_conversations(conversations.clone()).await;
                }
                Step::Wait { ms } => tokio::time::sleep(Duration::from_millis(*ms)).await,
            }
        }
        tokio::time::sleep(Duration::from_millis(self.settle_ms)).await;
        Ok(())
    }
}
