/// In-memory conversation list, ordered most recently active first
use crate::error::{Result, SyncError};
use crate::model::{Conversation, Counterpart, MessageSnapshot, Timestamp};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Partial update applied by `ConversationStore::patch`. `None` fields are left alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationPatch {
    pub counterpart: Option<Counterpart>,
    pub last_message: Option<Option<MessageSnapshot>>,
    pub unread_count: Option<u32>,
    pub total_messages: Option<u64>,
    pub updated_at: Option<Timestamp>,
}

impl ConversationPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn apply_to(&self, conv: &mut Conversation) {
        if let Some(counterpart) = &self.counterpart {
            conv.counterpart = counterpart.clone();
        }
        if let Some(last) = &self.last_message {
            conv.last_message = last.clone();
        }
        if let Some(unread) = self.unread_count {
            conv.unread_count = unread;
        }
        if let Some(total) = self.total_messages {
            conv.total_messages = total;
        }
        if let Some(updated_at) = self.updated_at {
            conv.updated_at = updated_at;
        }
    }
}

/// Immutable, cheaply clonable view handed to observers
#[derive(Debug, Clone)]
pub struct StoreView {
    pub version: u64,
    pub conversations: Arc<[Conversation]>,
}

/// Display order: newest `updated_at` first, id ascending on ties
pub fn display_order(a: &Conversation, b: &Conversation) -> Ordering {
    b.updated_at
        .cmp(&a.updated_at)
        .then_with(|| a.id.cmp(&b.id))
}

#[derive(Debug, Clone, Default)]
pub struct ConversationStore {
    entries: Vec<Conversation>,
    /// Locally created placeholders not yet seen in a bulk snapshot,
    /// with the number of snapshots they have already been missing from
    unconfirmed: HashMap<String, u32>,
    /// Message ids already reflected in a conversation's counters, kept only
    /// for the newest instant that was counted
    counted: HashMap<String, CountedMessages>,
    version: u64,
}

#[derive(Debug, Clone, PartialEq)]
struct CountedMessages {
    at: Timestamp,
    ids: HashSet<String>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ===== Getters =====

    pub fn get(&self) -> &[Conversation] {
        &self.entries
    }

    pub fn find(&self, id: &str) -> Option<&Conversation> {
        self.entries.iter().find(|c| c.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn view(&self) -> StoreView {
        StoreView {
            version: self.version,
            conversations: Arc::from(self.entries.clone()),
        }
    }

    pub fn is_unconfirmed(&self, id: &str) -> bool {
        self.unconfirmed.contains_key(id)
    }

    /// Snapshots an unconfirmed placeholder has been missing from
    pub fn missed_refreshes(&self, id: &str) -> Option<u32> {
        self.unconfirmed.get(id).copied()
    }

    /// Whether `message_id` was already counted into unread/total for this conversation
    pub fn is_counted(&self, conversation_id: &str, message_id: &str) -> bool {
        self.counted
            .get(conversation_id)
            .is_some_and(|c| c.ids.contains(message_id))
    }

    /// Send time of the newest message counted for this conversation
    pub fn counted_at(&self, conversation_id: &str) -> Option<Timestamp> {
        self.counted.get(conversation_id).map(|c| c.at)
    }

    // ===== Mutations =====
    // Every mutator bumps the version and returns it.

    /// Replace the whole list. Duplicate ids collapse onto the newest entry.
    pub fn replace_all(&mut self, list: Vec<Conversation>) -> u64 {
        let mut by_id: HashMap<String, Conversation> = HashMap::with_capacity(list.len());
        for conv in list {
            match by_id.get(&conv.id) {
                Some(existing) if existing.updated_at >= conv.updated_at => {}
                _ => {
                    by_id.insert(conv.id.clone(), conv);
                }
            }
        }

        let mut entries: Vec<Conversation> = by_id.into_values().collect();
        entries.sort_by(display_order);
        self.entries = entries;

        let live: HashSet<&str> = self.entries.iter().map(|c| c.id.as_str()).collect();
        self.unconfirmed.retain(|id, _| live.contains(id.as_str()));
        self.counted.retain(|id, _| live.contains(id.as_str()));
        self.bump()
    }

    /// Insert or replace by id, repositioning by `updated_at`
    pub fn upsert(&mut self, conv: Conversation) -> u64 {
        if let Some(pos) = self.position(&conv.id) {
            self.entries.remove(pos);
        }
        self.insert_sorted(conv);
        self.bump()
    }

    /// Apply a partial update; the entry is repositioned if its `updated_at` changed
    pub fn patch(&mut self, id: &str, patch: &ConversationPatch) -> Result<u64> {
        let pos = self
            .position(id)
            .ok_or_else(|| SyncError::NotFound(format!("conversation {}", id)))?;

        let mut conv = self.entries.remove(pos);
        patch.apply_to(&mut conv);
        self.insert_sorted(conv);
        Ok(self.bump())
    }

    pub fn remove(&mut self, id: &str) -> Option<Conversation> {
        let pos = self.position(id)?;
        let removed = self.entries.remove(pos);
        self.unconfirmed.remove(id);
        self.counted.remove(id);
        self.bump();
        Some(removed)
    }

    pub fn mark_unconfirmed(&mut self, id: &str) {
        self.unconfirmed.insert(id.to_string(), 0);
    }

    pub fn confirm(&mut self, id: &str) {
        self.unconfirmed.remove(id);
    }

    /// Record that an unconfirmed placeholder was absent from one more snapshot
    pub fn note_missed_refresh(&mut self, id: &str) {
        if let Some(missed) = self.unconfirmed.get_mut(id) {
            *missed = missed.saturating_add(1);
        }
    }

    /// Record a message as counted. Older instants than the one on record are ignored,
    /// a newer instant replaces the record.
    pub fn mark_counted(&mut self, conversation_id: &str, message_id: &str, at: Timestamp) {
        let entry = self
            .counted
            .entry(conversation_id.to_string())
            .or_insert_with(|| CountedMessages {
                at,
                ids: HashSet::new(),
            });
        match at.cmp(&entry.at) {
            Ordering::Less => {}
            Ordering::Equal => {
                entry.ids.insert(message_id.to_string());
            }
            Ordering::Greater => {
                entry.at = at;
                entry.ids.clear();
                entry.ids.insert(message_id.to_string());
            }
        }
    }

    /// Unique ids and descending order
    pub fn check_invariants(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.entries.len());
        for conv in &self.entries {
            if !seen.insert(conv.id.as_str()) {
                return Err(SyncError::InvariantViolation(format!(
                    "duplicate conversation id {}",
                    conv.id
                )));
            }
        }

        if let Some(pair) = self
            .entries
            .windows(2)
            .find(|w| display_order(&w[0], &w[1]) == Ordering::Greater)
        {
            return Err(SyncError::InvariantViolation(format!(
                "conversation {} is ordered before newer {}",
                pair[0].id, pair[1].id
            )));
        }
        Ok(())
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.entries.iter().position(|c| c.id == id)
    }

    fn insert_sorted(&mut self, conv: Conversation) {
        let pos = self
            .entries
            .partition_point(|c| display_order(c, &conv) == Ordering::Less);
        self.entries.insert(pos, conv);
    }

    fn bump(&mut self) -> u64 {
        self.version += 1;
        self.version
    }
}
