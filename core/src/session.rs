/// Sync session: owns the store and processes every mutation on one event loop
///
/// Bulk fetches, enrichment lookups, mark-as-read calls and the push stream all
/// run concurrently, but each completion becomes a `Command` on a single mpsc
/// channel. The loop applies them one at a time through the reconciler, so the
/// store itself never needs a lock.
use crate::api::{ConversationApi, EventHandler, EventTransport, SendMessagePayload};
use crate::config::SyncConfig;
use crate::enrichment::{EnrichmentCoordinator, EnrichmentOutcome};
use crate::error::{Result, SyncError};
use crate::events::{PushEvent, PUSH_EVENT_NAMES};
use crate::model::{Conversation, Message};
use crate::read_state::{ReadEffect, ReadStateTracker};
use crate::reconciler::{self, Input, ReconcileContext};
use crate::store::ConversationStore;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const WARNING_CHANNEL_CAPACITY: usize = 64;

/// What observers see: the ordered list plus the current selection
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    pub version: u64,
    pub conversations: Arc<[Conversation]>,
    pub selected: Option<String>,
}

impl Default for StoreSnapshot {
    fn default() -> Self {
        Self {
            version: 0,
            conversations: Arc::from(Vec::new()),
            selected: None,
        }
    }
}

impl StoreSnapshot {
    pub fn find(&self, id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.conversations.iter().map(|c| c.id.as_str()).collect()
    }
}

/// Non-fatal problems surfaced to the UI layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncWarning {
    RefreshFailed { reason: String },
    LookupFailed { conversation_id: String, reason: String },
    MarkReadFailed { conversation_id: String, reason: String },
    EventDropped { event: String, reason: String },
    ReconciliationRejected { reason: String },
}

/// Work items processed by the session loop
#[derive(Debug)]
pub enum Command {
    Refresh,
    SnapshotLoaded(Result<Vec<Conversation>>),
    Push(PushEvent),
    Enriched(EnrichmentOutcome),
    Select(String),
    Deselect,
    MessageSent(Message),
    Shutdown,
}

impl From<EnrichmentOutcome> for Command {
    fn from(outcome: EnrichmentOutcome) -> Self {
        Command::Enriched(outcome)
    }
}

/// Handle to a running session. Cheap to clone; all clones drive the same loop.
#[derive(Clone)]
pub struct SyncSession {
    tx: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<StoreSnapshot>,
    warnings: broadcast::Sender<SyncWarning>,
    api: Arc<dyn ConversationApi>,
    transport: Arc<dyn EventTransport>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SyncSession {
    /// Subscribe to push events and spawn the session loop. Must run inside a tokio runtime.
    pub fn start(
        config: SyncConfig,
        api: Arc<dyn ConversationApi>,
        transport: Arc<dyn EventTransport>,
    ) -> Result<Self> {
        config.validate()?;

        let (tx, rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(StoreSnapshot::default());
        let (warnings_tx, _) = broadcast::channel(WARNING_CHANNEL_CAPACITY);

        // Only `SyncSession` handles keep the loop alive; everything else holds weak senders
        for name in PUSH_EVENT_NAMES {
            transport.subscribe(name, push_handler(name, tx.downgrade(), warnings_tx.clone()))?;
        }

        let periodic = config.periodic_refresh_interval.map(|every| {
            let tx = tx.downgrade();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                // First tick completes immediately; the initial fetch is handled separately
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    match tx.upgrade() {
                        Some(tx) if tx.send(Command::Refresh).is_ok() => {}
                        _ => break,
                    }
                }
            })
        });

        if config.refresh_on_start {
            let _ = tx.send(Command::Refresh);
        }

        info!("Starting conversation sync for user {}", config.local_user_id);

        let session_loop = SessionLoop {
            coordinator: EnrichmentCoordinator::new(config.fallback_refresh_delay),
            config,
            api: Arc::clone(&api),
            transport: Arc::clone(&transport),
            store: ConversationStore::new(),
            tracker: ReadStateTracker::new(),
            tx: tx.downgrade(),
            snapshot_tx,
            warnings_tx: warnings_tx.clone(),
            refresh_in_flight: false,
            refresh_queued: false,
            periodic,
        };
        let task = tokio::spawn(session_loop.run(rx));

        Ok(Self {
            tx,
            snapshots: snapshot_rx,
            warnings: warnings_tx,
            api,
            transport,
            task: Arc::new(Mutex::new(Some(task))),
        })
    }

    /// Latest published state
    pub fn snapshot(&self) -> StoreSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Observe every published state
    pub fn subscribe(&self) -> watch::Receiver<StoreSnapshot> {
        self.snapshots.clone()
    }

    pub fn warnings(&self) -> broadcast::Receiver<SyncWarning> {
        self.warnings.subscribe()
    }

    /// Request a bulk refresh; concurrent requests coalesce
    pub fn refresh(&self) -> Result<()> {
        self.send(Command::Refresh)
    }

    /// Select a conversation: unread drops to zero immediately, mark-as-read runs in the background
    pub fn select(&self, conversation_id: impl Into<String>) -> Result<()> {
        self.send(Command::Select(conversation_id.into()))
    }

    pub fn deselect(&self) -> Result<()> {
        self.send(Command::Deselect)
    }

    /// Inject an already decoded push event, bypassing the transport
    pub fn push(&self, event: PushEvent) -> Result<()> {
        self.send(Command::Push(event))
    }

    /// Send a message and fold it into the list as the local user's latest message
    pub async fn send_message(&self, payload: SendMessagePayload) -> Result<Message> {
        let message = self.api.send_message(payload).await?;
        debug!(
            "sent message {} in conversation {}",
            message.id, message.conversation_id
        );
        self.send(Command::MessageSent(message.clone()))?;
        Ok(message)
    }

    /// Unsubscribe, cancel scheduled refreshes and stop the loop. Safe to call twice.
    pub async fn shutdown(&self) {
        for name in PUSH_EVENT_NAMES {
            self.transport.unsubscribe(name);
        }
        let _ = self.tx.send(Command::Shutdown);

        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                error!("session loop ended abnormally: {}", e);
            }
        }
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.tx.send(cmd).map_err(|_| SyncError::SessionClosed)
    }
}

fn push_handler(
    name: &'static str,
    tx: mpsc::WeakUnboundedSender<Command>,
    warnings: broadcast::Sender<SyncWarning>,
) -> EventHandler {
    Arc::new(move |payload| match PushEvent::decode(name, payload) {
        Ok(event) => {
            let delivered = tx
                .upgrade()
                .is_some_and(|tx| tx.send(Command::Push(event)).is_ok());
            if !delivered {
                debug!("dropping {} event: session closed", name);
            }
        }
        Err(e) => {
            warn!("dropping malformed {} event: {}", name, e);
            let _ = warnings.send(SyncWarning::EventDropped {
                event: name.to_string(),
                reason: e.to_string(),
            });
        }
    })
}

struct SessionLoop {
    config: SyncConfig,
    api: Arc<dyn ConversationApi>,
    transport: Arc<dyn EventTransport>,
    store: ConversationStore,
    tracker: ReadStateTracker,
    coordinator: EnrichmentCoordinator,
    /// Weak so that dropping every `SyncSession` handle ends the loop
    tx: mpsc::WeakUnboundedSender<Command>,
    snapshot_tx: watch::Sender<StoreSnapshot>,
    warnings_tx: broadcast::Sender<SyncWarning>,
    refresh_in_flight: bool,
    refresh_queued: bool,
    periodic: Option<JoinHandle<()>>,
}

impl SessionLoop {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Refresh => self.start_refresh(),
                Command::SnapshotLoaded(result) => self.on_snapshot(result),
                Command::Push(event) => {
                    debug!("push event {} for {}", event.name(), event.conversation_id());
                    self.apply(Input::Push(event));
                }
                Command::Enriched(outcome) => self.on_enriched(outcome),
                Command::Select(id) => self.on_select(id),
                Command::Deselect => {
                    if self.tracker.deselect().is_some() {
                        self.publish();
                    }
                }
                Command::MessageSent(message) => {
                    let known = self.store.contains(&message.conversation_id);
                    self.apply(Input::Push(PushEvent::NewMessage(message)));
                    if !known {
                        // Conversation created server-side by this send
                        self.start_refresh();
                    }
                }
                Command::Shutdown => break,
            }
        }

        // Also reached when every handle was dropped without `shutdown()`
        for name in PUSH_EVENT_NAMES {
            self.transport.unsubscribe(name);
        }
        self.coordinator.shutdown();
        if let Some(periodic) = self.periodic.take() {
            periodic.abort();
        }
        info!("Conversation sync stopped");
    }

    fn context(&self) -> ReconcileContext<'_> {
        ReconcileContext {
            local_user_id: &self.config.local_user_id,
            selected_id: self.tracker.selected(),
            placeholder_grace_cycles: self.config.placeholder_grace_cycles,
        }
    }

    /// The one place the store is replaced
    fn apply(&mut self, input: Input) -> bool {
        let result = reconciler::reconcile(&self.store, &self.context(), input);
        match result {
            Ok(outcome) => {
                let tx = self.tx.upgrade();
                if outcome.schedule_fallback_refresh {
                    if let Some(tx) = &tx {
                        self.coordinator.schedule_fallback_refresh(tx, Command::Refresh);
                    }
                }
                let changed = !outcome.is_noop();
                self.store = outcome.store;
                if changed {
                    debug!("store v{}: {:?}", self.store.version(), outcome.changes);
                    self.publish();
                    if let Some(tx) = &tx {
                        self.coordinator.dispatch(&self.store, &self.api, tx);
                    }
                }
                changed
            }
            Err(e) => {
                error!("reconciliation rejected, keeping previous state: {}", e);
                self.warn(SyncWarning::ReconciliationRejected {
                    reason: e.to_string(),
                });
                false
            }
        }
    }

    fn start_refresh(&mut self) {
        if self.refresh_in_flight {
            self.refresh_queued = true;
            return;
        }
        let Some(tx) = self.tx.upgrade() else {
            return;
        };
        self.refresh_in_flight = true;

        let api = Arc::clone(&self.api);
        tokio::spawn(async move {
            let result = api.fetch_conversations().await;
            let _ = tx.send(Command::SnapshotLoaded(result));
        });
    }

    fn on_snapshot(&mut self, result: Result<Vec<Conversation>>) {
        self.refresh_in_flight = false;
        match result {
            Ok(list) => {
                debug!("bulk fetch returned {} conversations", list.len());
                self.coordinator.on_snapshot();
                if !self.apply(Input::Snapshot(list)) {
                    // Nothing visible changed, but placeholders may need another lookup
                    if let Some(tx) = self.tx.upgrade() {
                        self.coordinator.dispatch(&self.store, &self.api, &tx);
                    }
                }
            }
            Err(e) => {
                warn!("bulk fetch failed: {}", e);
                self.warn(SyncWarning::RefreshFailed {
                    reason: e.to_string(),
                });
            }
        }

        if self.refresh_queued {
            self.refresh_queued = false;
            self.start_refresh();
        }
    }

    fn on_enriched(&mut self, outcome: EnrichmentOutcome) {
        self.coordinator.complete(&outcome);
        let conversation_id = outcome.lookup.conversation_id().to_string();
        match outcome.result {
            Ok(Some(counterpart)) => {
                self.apply(Input::Enriched {
                    conversation_id,
                    counterpart,
                });
            }
            Ok(None) => {}
            Err(e) => self.warn(SyncWarning::LookupFailed {
                conversation_id,
                reason: e.to_string(),
            }),
        }
    }

    fn on_select(&mut self, id: String) {
        let effect = self.tracker.select(&id);
        let changed = self.apply(Input::Selected(id));
        if effect.is_some() && !changed {
            // Selection itself is part of the published state
            self.publish();
        }

        if let Some(ReadEffect::MarkRead(conversation_id)) = effect {
            let api = Arc::clone(&self.api);
            let warnings = self.warnings_tx.clone();
            tokio::spawn(async move {
                if let Err(e) = api.mark_conversation_read(&conversation_id).await {
                    // Optimistic zero stays; the user has already seen the conversation
                    warn!("mark-as-read for {} failed: {}", conversation_id, e);
                    let _ = warnings.send(SyncWarning::MarkReadFailed {
                        conversation_id,
                        reason: e.to_string(),
                    });
                }
            });
        }
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(StoreSnapshot {
            version: self.store.version(),
            conversations: self.store.view().conversations,
            selected: self.tracker.selected().map(str::to_string),
        });
    }

    fn warn(&self, warning: SyncWarning) {
        // No receivers is fine: warnings are advisory
        let _ = self.warnings_tx.send(warning);
    }
}
