/// Reconciler: folds snapshots, push events and enrichment results into the store
///
/// Every function here is pure: it takes the current store by reference and
/// returns the next store plus a description of what changed. The caller swaps
/// the store in only when the result is `Ok`, so a rejected reconciliation
/// leaves the previous valid state in place.
use crate::error::Result;
use crate::events::{ConversationCreatedEvent, ConversationUpdatedEvent, PushEvent};
use crate::model::{
    Conversation, ConversationKind, Counterpart, GroupDescriptor, Message, MessageSnapshot, ParticipantDescriptor,
};
use crate::read_state::unread_delta;
use crate::store::{ConversationPatch, ConversationStore};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Session facts the merge rules depend on
#[derive(Debug, Clone, Copy)]
pub struct ReconcileContext<'a> {
    pub local_user_id: &'a str,
    pub selected_id: Option<&'a str>,
    pub placeholder_grace_cycles: u32,
}

/// Inbound signal funneled through the single mutation path
#[derive(Debug, Clone)]
pub enum Input {
    /// Authoritative bulk fetch result
    Snapshot(Vec<Conversation>),
    Push(PushEvent),
    /// Resolved peer or group metadata for a placeholder
    Enriched {
        conversation_id: String,
        counterpart: Counterpart,
    },
    /// Optimistic zeroing of the unread count on selection
    Selected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Change {
    Inserted(String),
    /// Content changed in place
    Updated(String),
    /// `updated_at` changed, so the entry was repositioned
    Moved(String),
    Removed(String),
}

#[derive(Debug, Clone)]
pub struct Reconciliation {
    pub store: ConversationStore,
    pub changes: Vec<Change>,
    /// Why the input was dropped, when it was
    pub ignored: Option<String>,
    /// A CONVERSATION_CREATED was seen; the safety-net bulk refresh is due
    pub schedule_fallback_refresh: bool,
}

impl Reconciliation {
    pub fn is_noop(&self) -> bool {
        self.changes.is_empty()
    }

    fn ignored(store: &ConversationStore, reason: String) -> Self {
        debug!("reconciliation ignored: {}", reason);
        Self {
            store: store.clone(),
            changes: Vec::new(),
            ignored: Some(reason),
            schedule_fallback_refresh: false,
        }
    }
}

/// Single entry point: dispatch an input to its merge rule
pub fn reconcile(store: &ConversationStore, ctx: &ReconcileContext, input: Input) -> Result<Reconciliation> {
    match input {
        Input::Snapshot(list) => replace_all_from(store, ctx, list),
        Input::Push(PushEvent::NewMessage(msg)) => apply_new_message(store, ctx, &msg),
        Input::Push(PushEvent::ConversationUpdated(ev)) => apply_conversation_updated(store, &ev),
        Input::Push(PushEvent::ConversationCreated(ev)) => apply_conversation_created(store, ctx, &ev),
        Input::Enriched {
            conversation_id,
            counterpart,
        } => apply_enrichment(store, &conversation_id, counterpart),
        Input::Selected(id) => apply_selection(store, &id),
    }
}

// ===== Bulk snapshot =====

/// Merge an authoritative snapshot. Per id the newer `updated_at` keeps its
/// payload (ties keep the existing, push-applied payload). Absent entries are
/// pruned unless they are unconfirmed placeholders still inside their grace.
pub fn replace_all_from(
    store: &ConversationStore,
    ctx: &ReconcileContext,
    incoming: Vec<Conversation>,
) -> Result<Reconciliation> {
    // Collapse duplicates inside the snapshot onto the newest entry
    let mut snapshot: HashMap<String, Conversation> = HashMap::with_capacity(incoming.len());
    for conv in incoming {
        match snapshot.get(&conv.id) {
            Some(prev) if prev.updated_at >= conv.updated_at => {}
            _ => {
                snapshot.insert(conv.id.clone(), conv);
            }
        }
    }

    let mut merged = Vec::with_capacity(snapshot.len() + store.len());
    let mut kept_placeholders = Vec::new();

    for existing in store.get() {
        if snapshot.contains_key(&existing.id) {
            continue;
        }
        let within_grace = store
            .missed_refreshes(&existing.id)
            .is_some_and(|missed| missed < ctx.placeholder_grace_cycles);
        if within_grace {
            kept_placeholders.push(existing.id.clone());
            merged.push(existing.clone());
        } else {
            debug!("pruning conversation {} absent from snapshot", existing.id);
        }
    }

    let confirmed: Vec<String> = snapshot.keys().cloned().collect();
    // The server's counters already include each listed last message
    let server_counted: Vec<(String, MessageSnapshot)> = snapshot
        .values()
        .filter_map(|c| c.last_message.clone().map(|m| (c.id.clone(), m)))
        .collect();
    for (_, incoming) in snapshot {
        let mut conv = match store.find(&incoming.id) {
            Some(existing) => merge_entry(existing, incoming),
            None => incoming,
        };
        if ctx.selected_id == Some(conv.id.as_str()) {
            conv.unread_count = 0;
        }
        merged.push(conv);
    }

    let mut next = store.clone();
    next.replace_all(merged);

    let mut result = finish(store, next)?;
    // Confirmation bookkeeping is kept even when nothing visible changed
    for id in &confirmed {
        result.store.confirm(id);
    }
    for id in &kept_placeholders {
        result.store.note_missed_refresh(id);
    }
    for (id, last) in &server_counted {
        result.store.mark_counted(id, &last.id, last.sent_at);
    }
    Ok(result)
}

fn merge_entry(existing: &Conversation, incoming: Conversation) -> Conversation {
    let total_messages = existing.total_messages.max(incoming.total_messages);
    let counterpart = pick_counterpart(&existing.counterpart, &incoming.counterpart);

    let mut winner = if existing.updated_at >= incoming.updated_at {
        existing.clone()
    } else {
        incoming
    };
    winner.counterpart = counterpart;
    winner.total_messages = total_messages;
    winner
}

/// Prefer the snapshot's descriptor unless only the local one is enriched
fn pick_counterpart(existing: &Counterpart, incoming: &Counterpart) -> Counterpart {
    let same_target =
        existing.kind() == incoming.kind() && existing.target_id() == incoming.target_id();
    if !incoming.is_enriched() && existing.is_enriched() && same_target {
        existing.clone()
    } else {
        incoming.clone()
    }
}

// ===== Push events =====

pub fn apply_new_message(
    store: &ConversationStore,
    ctx: &ReconcileContext,
    msg: &Message,
) -> Result<Reconciliation> {
    let Some(existing) = store.find(&msg.conversation_id) else {
        return Ok(Reconciliation::ignored(
            store,
            format!("new message for unknown conversation {}", msg.conversation_id),
        ));
    };

    if store.is_counted(&msg.conversation_id, &msg.id) {
        return Ok(Reconciliation::ignored(
            store,
            format!("duplicate message {} in {}", msg.id, msg.conversation_id),
        ));
    }

    let delta = unread_delta(&msg.sender_id, &msg.conversation_id, ctx.local_user_id, ctx.selected_id);
    let counted_patch = ConversationPatch {
        last_message: Some(Some(msg.snapshot())),
        updated_at: Some(msg.sent_at),
        unread_count: Some(existing.unread_count.saturating_add(delta)),
        total_messages: Some(existing.total_messages.saturating_add(1)),
        ..Default::default()
    };

    let patch = match msg.sent_at.cmp(&existing.updated_at) {
        Ordering::Less => {
            return Ok(Reconciliation::ignored(
                store,
                format!("stale message {} in {}", msg.id, msg.conversation_id),
            ));
        }
        Ordering::Greater => counted_patch,
        // Same instant as what we hold. Count it when that instant came from a
        // metadata-only update of this message, or from other counted messages.
        Ordering::Equal => {
            let shown_uncounted = existing.last_message.as_ref().is_some_and(|last| last.id == msg.id);
            if shown_uncounted || store.counted_at(&msg.conversation_id) == Some(msg.sent_at) {
                counted_patch
            } else {
                // A snapshot already reflects this instant; take the push payload only
                ConversationPatch {
                    last_message: Some(Some(msg.snapshot())),
                    ..Default::default()
                }
            }
        }
    };

    let mut next = store.clone();
    next.patch(&msg.conversation_id, &patch)?;
    let mut result = finish(store, next)?;
    result.store.mark_counted(&msg.conversation_id, &msg.id, msg.sent_at);
    Ok(result)
}

pub fn apply_conversation_updated(
    store: &ConversationStore,
    ev: &ConversationUpdatedEvent,
) -> Result<Reconciliation> {
    let Some(existing) = store.find(&ev.conversation_id) else {
        return Ok(Reconciliation::ignored(
            store,
            format!("update for unknown conversation {}", ev.conversation_id),
        ));
    };

    if ev.updated_at < existing.updated_at {
        return Ok(Reconciliation::ignored(
            store,
            format!("stale update for {}", ev.conversation_id),
        ));
    }

    let patch = ConversationPatch {
        last_message: ev.last_message.clone().map(Some),
        updated_at: Some(ev.updated_at),
        ..Default::default()
    };

    let mut next = store.clone();
    next.patch(&ev.conversation_id, &patch)?;
    finish(store, next)
}

pub fn apply_conversation_created(
    store: &ConversationStore,
    ctx: &ReconcileContext,
    ev: &ConversationCreatedEvent,
) -> Result<Reconciliation> {
    let mut result = if store.contains(&ev.conversation_id) {
        apply_conversation_updated(store, &ev.as_update())?
    } else {
        match placeholder_from(ctx, ev) {
            Some(conv) => {
                let first = conv.last_message.clone();
                let mut next = store.clone();
                next.upsert(conv);
                next.mark_unconfirmed(&ev.conversation_id);
                if let Some(first) = first {
                    next.mark_counted(&ev.conversation_id, &first.id, first.sent_at);
                }
                finish(store, next)?
            }
            None => Reconciliation::ignored(
                store,
                format!("created event for {} lacks a peer or group id", ev.conversation_id),
            ),
        }
    };
    result.schedule_fallback_refresh = true;
    Ok(result)
}

fn placeholder_from(ctx: &ReconcileContext, ev: &ConversationCreatedEvent) -> Option<Conversation> {
    let updated_at = ev.updated_at.max(ev.created_at);
    let mut conv = match ev.kind {
        ConversationKind::Direct => {
            let peer_id = ev.other_participant(ctx.local_user_id)?;
            Conversation::direct(&ev.conversation_id, ParticipantDescriptor::placeholder(peer_id), updated_at)
        }
        ConversationKind::Group => {
            let group_id = ev.group_id.as_deref().filter(|id| !id.is_empty())?;
            Conversation::group(&ev.conversation_id, GroupDescriptor::placeholder(group_id), updated_at)
        }
    };

    if let Some(last) = &ev.last_message {
        conv.unread_count = unread_delta(&last.sender_id, &ev.conversation_id, ctx.local_user_id, ctx.selected_id);
        conv.total_messages = 1;
        conv.last_message = Some(last.clone());
    }
    Some(conv)
}

// ===== Enrichment and selection =====

/// Patch only the descriptor; everything reconciled meanwhile is preserved
pub fn apply_enrichment(
    store: &ConversationStore,
    conversation_id: &str,
    counterpart: Counterpart,
) -> Result<Reconciliation> {
    let Some(existing) = store.find(conversation_id) else {
        return Ok(Reconciliation::ignored(
            store,
            format!("enrichment for departed conversation {}", conversation_id),
        ));
    };

    if existing.counterpart.is_enriched() {
        return Ok(Reconciliation::ignored(
            store,
            format!("{} was enriched meanwhile; late lookup result dropped", conversation_id),
        ));
    }

    if existing.counterpart.kind() != counterpart.kind()
        || existing.counterpart.target_id() != counterpart.target_id()
    {
        return Ok(Reconciliation::ignored(
            store,
            format!("enrichment for {} no longer matches its descriptor", conversation_id),
        ));
    }

    let mut next = store.clone();
    next.patch(
        conversation_id,
        &ConversationPatch {
            counterpart: Some(counterpart),
            ..Default::default()
        },
    )?;
    finish(store, next)
}

pub fn apply_selection(store: &ConversationStore, conversation_id: &str) -> Result<Reconciliation> {
    match store.find(conversation_id) {
        None => Ok(Reconciliation::ignored(
            store,
            format!("selected unknown conversation {}", conversation_id),
        )),
        Some(conv) if conv.unread_count == 0 => Ok(Reconciliation {
            store: store.clone(),
            changes: Vec::new(),
            ignored: None,
            schedule_fallback_refresh: false,
        }),
        Some(_) => {
            let mut next = store.clone();
            next.patch(
                conversation_id,
                &ConversationPatch {
                    unread_count: Some(0),
                    ..Default::default()
                },
            )?;
            finish(store, next)
        }
    }
}

// ===== Helpers =====

/// Validate the candidate store and describe how it differs from `prev`.
/// With no visible difference the previous store (and version) is kept.
fn finish(prev: &ConversationStore, next: ConversationStore) -> Result<Reconciliation> {
    next.check_invariants()?;

    let changes = diff(prev, &next);
    let store = if changes.is_empty() { prev.clone() } else { next };
    Ok(Reconciliation {
        store,
        changes,
        ignored: None,
        schedule_fallback_refresh: false,
    })
}

fn diff(prev: &ConversationStore, next: &ConversationStore) -> Vec<Change> {
    let before: HashMap<&str, &Conversation> =
        prev.get().iter().map(|c| (c.id.as_str(), c)).collect();
    let mut changes = Vec::new();
    let mut seen = HashSet::with_capacity(next.len());

    for conv in next.get() {
        seen.insert(conv.id.as_str());
        match before.get(conv.id.as_str()) {
            None => changes.push(Change::Inserted(conv.id.clone())),
            Some(old) if old.updated_at != conv.updated_at => {
                changes.push(Change::Moved(conv.id.clone()))
            }
            Some(old) if *old != conv => changes.push(Change::Updated(conv.id.clone())),
            Some(_) => {}
        }
    }
    for conv in prev.get() {
        if !seen.contains(conv.id.as_str()) {
            changes.push(Change::Removed(conv.id.clone()));
        }
    }
    changes
}
