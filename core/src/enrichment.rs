/// Enrichment coordinator: resolves missing peer/group metadata for placeholders
use crate::api::ConversationApi;
use crate::error::Result;
use crate::model::{Counterpart, Conversation};
use crate::store::ConversationStore;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// One targeted metadata lookup
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Lookup {
    Participant {
        conversation_id: String,
        participant_id: String,
    },
    Group {
        conversation_id: String,
        group_id: String,
    },
}

impl Lookup {
    /// The lookup a conversation needs, if any
    pub fn for_conversation(conv: &Conversation) -> Option<Self> {
        if !conv.needs_enrichment() {
            return None;
        }
        Some(match &conv.counterpart {
            Counterpart::Direct { peer } => Lookup::Participant {
                conversation_id: conv.id.clone(),
                participant_id: peer.id.clone(),
            },
            Counterpart::Group { group } => Lookup::Group {
                conversation_id: conv.id.clone(),
                group_id: group.id.clone(),
            },
        })
    }

    pub fn conversation_id(&self) -> &str {
        match self {
            Lookup::Participant { conversation_id, .. } => conversation_id,
            Lookup::Group { conversation_id, .. } => conversation_id,
        }
    }

    /// Run the lookup. `Ok(None)` means the target does not exist.
    pub async fn resolve(&self, api: &dyn ConversationApi) -> Result<Option<Counterpart>> {
        match self {
            Lookup::Participant { participant_id, .. } => Ok(api
                .fetch_participant_by_id(participant_id)
                .await?
                .map(|peer| Counterpart::Direct { peer })),
            Lookup::Group { group_id, .. } => Ok(api
                .fetch_group_by_id(group_id)
                .await?
                .map(|group| Counterpart::Group { group })),
        }
    }
}

/// Completion of a lookup, fed back into the session's command stream
#[derive(Debug)]
pub struct EnrichmentOutcome {
    pub lookup: Lookup,
    pub result: Result<Option<Counterpart>>,
}

/// Tracks outstanding lookups (at most one per conversation) and owns the
/// delayed safety-net refresh scheduled after conversation creation.
pub struct EnrichmentCoordinator {
    in_flight: HashSet<String>,
    /// Lookups that failed or found nothing; retried only after the next snapshot
    exhausted: HashSet<String>,
    fallback_delay: Duration,
    fallback: Option<JoinHandle<()>>,
}

impl EnrichmentCoordinator {
    pub fn new(fallback_delay: Duration) -> Self {
        Self {
            in_flight: HashSet::new(),
            exhausted: HashSet::new(),
            fallback_delay,
            fallback: None,
        }
    }

    pub fn is_in_flight(&self, conversation_id: &str) -> bool {
        self.in_flight.contains(conversation_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Lookups to start now; each returned conversation is marked in flight
    pub fn plan(&mut self, store: &ConversationStore) -> Vec<Lookup> {
        let mut lookups = Vec::new();
        for conv in store.get() {
            if self.in_flight.contains(&conv.id) || self.exhausted.contains(&conv.id) {
                continue;
            }
            if let Some(lookup) = Lookup::for_conversation(conv) {
                self.in_flight.insert(conv.id.clone());
                lookups.push(lookup);
            }
        }
        lookups
    }

    /// Plan and spawn lookups; results arrive on `done` as `T::from(outcome)`
    pub fn dispatch<T>(
        &mut self,
        store: &ConversationStore,
        api: &Arc<dyn ConversationApi>,
        done: &UnboundedSender<T>,
    ) -> usize
    where
        T: From<EnrichmentOutcome> + Send + 'static,
    {
        let lookups = self.plan(store);
        let count = lookups.len();
        for lookup in lookups {
            debug!("enrichment lookup started: {:?}", lookup);
            let api = Arc::clone(api);
            let done = done.clone();
            tokio::spawn(async move {
                let result = lookup.resolve(api.as_ref()).await;
                // Receiver gone means the session was torn down
                let _ = done.send(T::from(EnrichmentOutcome { lookup, result }));
            });
        }
        count
    }

    /// Record a finished lookup. Failures and misses are not retried automatically.
    pub fn complete(&mut self, outcome: &EnrichmentOutcome) {
        let id = outcome.lookup.conversation_id();
        self.in_flight.remove(id);
        match &outcome.result {
            Ok(Some(counterpart)) if counterpart.is_enriched() => {
                self.exhausted.remove(id);
            }
            Ok(Some(_)) => {
                debug!("enrichment target for {} has no display data yet", id);
                self.exhausted.insert(id.to_string());
            }
            Ok(None) => {
                debug!("enrichment target for {} not found", id);
                self.exhausted.insert(id.to_string());
            }
            Err(e) => {
                warn!("enrichment lookup for {} failed: {}", id, e);
                self.exhausted.insert(id.to_string());
            }
        }
    }

    /// A bulk snapshot landed: placeholders that are still incomplete get another try
    pub fn on_snapshot(&mut self) {
        self.exhausted.clear();
    }

    /// Schedule the safety-net refresh a full delay from now. A pending one is
    /// re-armed rather than duplicated; returns true when that happened.
    pub fn schedule_fallback_refresh<T>(&mut self, tx: &UnboundedSender<T>, due: T) -> bool
    where
        T: Send + 'static,
    {
        let rearmed = match self.fallback.take() {
            Some(pending) if !pending.is_finished() => {
                pending.abort();
                true
            }
            _ => false,
        };

        let delay = self.fallback_delay;
        let tx = tx.clone();
        self.fallback = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(due);
        }));
        rearmed
    }

    pub fn has_pending_fallback(&self) -> bool {
        self.fallback.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Cancel the scheduled refresh and forget outstanding lookups
    pub fn shutdown(&mut self) {
        if let Some(handle) = self.fallback.take() {
            handle.abort();
        }
        self.in_flight.clear();
        self.exhausted.clear();
    }
}

impl Drop for EnrichmentCoordinator {
    fn drop(&mut self) {
        if let Some(handle) = self.fallback.take() {
            handle.abort();
        }
    }
}
