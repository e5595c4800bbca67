#![allow(clippy::field_reassign_with_default)]
/// Session tests - push events, bulk refreshes, enrichment and read state end to end
use chatsync_core::api::SendMessagePayload;
use chatsync_core::sim::{Faults, MemoryBackend};
use chatsync_core::{
    Conversation, GroupDescriptor, ParticipantDescriptor, StoreSnapshot, SyncConfig, SyncError,
    SyncSession, SyncWarning,
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

const ME: &str = "me";
const T1: &str = "2024-05-01T10:00:00Z";
const T2: &str = "2024-05-01T10:05:00Z";
const T3: &str = "2024-05-01T10:10:00Z";

fn at(raw: &str) -> DateTime<Utc> {
    raw.parse().unwrap()
}

// Periodic refresh off and a long fallback delay so tests control every fetch
fn quiet_config() -> SyncConfig {
    let mut config = SyncConfig::new(ME);
    config.periodic_refresh_interval = None;
    config.fallback_refresh_delay = Duration::from_secs(30);
    config
}

fn peer(id: &str, name: &str) -> ParticipantDescriptor {
    ParticipantDescriptor {
        id: id.to_string(),
        display_name: name.to_string(),
        email: format!("{}@example.com", id),
    }
}

fn direct(id: &str, peer_id: &str, updated_at: &str) -> Conversation {
    Conversation::direct(id, peer(peer_id, &format!("User {}", peer_id)), at(updated_at))
}

async fn start(backend: &MemoryBackend, config: SyncConfig) -> SyncSession {
    SyncSession::start(config, Arc::new(backend.clone()), Arc::new(backend.clone())).unwrap()
}

async fn wait_for<F>(session: &SyncSession, mut pred: F) -> StoreSnapshot
where
    F: FnMut(&StoreSnapshot) -> bool,
{
    let mut rx = session.subscribe();
    let waiting = async {
        loop {
            let snap = rx.borrow_and_update().clone();
            if pred(&snap) {
                return snap;
            }
            rx.changed().await.expect("session closed while waiting");
        }
    };
    timeout(Duration::from_secs(5), waiting)
        .await
        .expect("timed out waiting for store state")
}

async fn next_warning(rx: &mut broadcast::Receiver<SyncWarning>) -> SyncWarning {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for warning")
        .expect("warning channel closed")
}

fn new_message(conversation_id: &str, id: &str, sender: &str, sent_at: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "conversationId": conversation_id,
        "senderId": sender,
        "content": format!("message {}", id),
        "sentAt": sent_at,
    })
}

fn created_direct(conversation_id: &str, other: &str, sender: &str, when: &str) -> serde_json::Value {
    serde_json::json!({
        "conversationId": conversation_id,
        "kind": "DIRECT",
        "participantIds": [ME, other],
        "lastMessage": {
            "id": format!("{}-first", conversation_id),
            "senderId": sender,
            "content": "hello",
            "sentAt": when,
        },
        "createdAt": when,
        "updatedAt": when,
    })
}

#[tokio::test]
async fn test_initial_bulk_fetch_populates_store() {
    let backend = MemoryBackend::new(ME);
    backend.set_conversations(vec![direct("c1", "u1", T1)]).await;

    let session = start(&backend, quiet_config()).await;
    let snap = wait_for(&session, |s| !s.conversations.is_empty()).await;

    assert_eq!(snap.ids(), vec!["c1"]);
    assert_eq!(snap.find("c1").unwrap().unread_count, 0);
    session.shutdown().await;
}

#[tokio::test]
async fn test_new_message_from_peer_increments_unread() {
    let backend = MemoryBackend::new(ME);
    backend
        .set_conversations(vec![direct("c1", "u1", T1), direct("c0", "u0", T2)])
        .await;
    let session = start(&backend, quiet_config()).await;
    wait_for(&session, |s| s.conversations.len() == 2).await;

    assert!(backend.emit("message:new", new_message("c1", "m1", "u1", T3)));
    let snap = wait_for(&session, |s| s.find("c1").is_some_and(|c| c.unread_count == 1)).await;

    let c1 = snap.find("c1").unwrap();
    assert_eq!(c1.updated_at, at(T3));
    assert_eq!(c1.last_message.as_ref().unwrap().id, "m1");
    assert_eq!(snap.ids(), vec!["c1", "c0"]);
    session.shutdown().await;
}

#[tokio::test]
async fn test_own_and_selected_messages_do_not_count() {
    let backend = MemoryBackend::new(ME);
    backend
        .set_conversations(vec![direct("c1", "u1", T1), direct("c2", "u2", T1)])
        .await;
    let session = start(&backend, quiet_config()).await;
    wait_for(&session, |s| s.conversations.len() == 2).await;

    session.select("c2").unwrap();
    wait_for(&session, |s| s.selected.as_deref() == Some("c2")).await;

    backend.emit("message:new", new_message("c1", "m1", ME, T2));
    backend.emit("message:new", new_message("c2", "m2", "u2", T3));
    let snap = wait_for(&session, |s| {
        s.find("c1").is_some_and(|c| c.updated_at == at(T2))
            && s.find("c2").is_some_and(|c| c.updated_at == at(T3))
    })
    .await;

    assert_eq!(snap.find("c1").unwrap().unread_count, 0);
    assert_eq!(snap.find("c2").unwrap().unread_count, 0);
    session.shutdown().await;
}

#[tokio::test]
async fn test_created_placeholder_is_enriched_in_place() {
    let backend = MemoryBackend::new(ME);
    backend.set_conversations(vec![direct("c1", "u1", T1)]).await;
    backend.add_participant(peer("u9", "Nine")).await;
    backend
        .set_faults(Faults {
            lookup_delay: Some(Duration::from_millis(150)),
            ..Default::default()
        })
        .await;

    let session = start(&backend, quiet_config()).await;
    wait_for(&session, |s| s.conversations.len() == 1).await;

    backend.emit("conversation:created", created_direct("c2", "u9", "u9", T2));
    let placeholder = wait_for(&session, |s| s.find("c2").is_some()).await;
    let c2 = placeholder.find("c2").unwrap();
    assert_eq!(c2.peer().unwrap().id, "u9");
    assert_eq!(c2.peer().unwrap().display_name, "");
    assert_eq!(c2.unread_count, 1);
    assert_eq!(placeholder.ids(), vec!["c2", "c1"]);

    let enriched = wait_for(&session, |s| {
        s.find("c2").is_some_and(|c| !c.needs_enrichment())
    })
    .await;
    let c2 = enriched.find("c2").unwrap();
    assert_eq!(c2.peer().unwrap().display_name, "Nine");
    assert_eq!(c2.unread_count, 1);
    assert_eq!(enriched.ids(), vec!["c2", "c1"]);
    assert_eq!(backend.lookup_calls().await, 1);
    session.shutdown().await;
}

#[tokio::test]
async fn test_group_placeholder_enriched_from_group_lookup() {
    let backend = MemoryBackend::new(ME);
    backend
        .add_group(GroupDescriptor {
            id: "g1".into(),
            name: "Ops".into(),
            description: "on-call".into(),
            avatar: None,
        })
        .await;
    let session = start(&backend, quiet_config()).await;

    backend.emit(
        "conversation:created",
        serde_json::json!({
            "conversationId": "gc",
            "kind": "GROUP",
            "groupId": "g1",
            "createdAt": T1,
            "updatedAt": T1,
        }),
    );

    let snap = wait_for(&session, |s| {
        s.find("gc").is_some_and(|c| !c.needs_enrichment())
    })
    .await;
    let group = snap.find("gc").unwrap().group_descriptor().unwrap().clone();
    assert_eq!(group.name, "Ops");
    assert_eq!(group.description, "on-call");
    assert_eq!(snap.find("gc").unwrap().unread_count, 0);
    session.shutdown().await;
}

#[tokio::test]
async fn test_select_zeroes_unread_before_mark_read_resolves() {
    let backend = MemoryBackend::new(ME);
    let mut c2 = direct("c2", "u9", T1);
    c2.unread_count = 3;
    backend.set_conversations(vec![c2]).await;
    backend
        .set_faults(Faults {
            mark_read_delay: Some(Duration::from_millis(300)),
            ..Default::default()
        })
        .await;

    let session = start(&backend, quiet_config()).await;
    wait_for(&session, |s| s.find("c2").is_some_and(|c| c.unread_count == 3)).await;

    session.select("c2").unwrap();
    let snap = wait_for(&session, |s| s.find("c2").is_some_and(|c| c.unread_count == 0)).await;
    assert_eq!(snap.selected.as_deref(), Some("c2"));
    assert!(backend.reads_completed().await.is_empty());

    timeout(Duration::from_secs(5), async {
        while backend.reads_completed().await.is_empty() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    // Re-selecting the open conversation does not issue another mark-as-read
    session.select("c2").unwrap();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.reads_started().await, vec!["c2".to_string()]);
    session.shutdown().await;
}

#[tokio::test]
async fn test_mark_read_failure_keeps_optimistic_zero() {
    let backend = MemoryBackend::new(ME);
    let mut c1 = direct("c1", "u1", T1);
    c1.unread_count = 2;
    backend.set_conversations(vec![c1]).await;
    backend
        .set_faults(Faults {
            fail_mark_read: true,
            ..Default::default()
        })
        .await;

    let session = start(&backend, quiet_config()).await;
    let mut warnings = session.warnings();
    wait_for(&session, |s| s.find("c1").is_some()).await;

    session.select("c1").unwrap();
    let warning = next_warning(&mut warnings).await;
    assert!(matches!(
        warning,
        SyncWarning::MarkReadFailed { ref conversation_id, .. } if conversation_id == "c1"
    ));
    assert_eq!(session.snapshot().find("c1").unwrap().unread_count, 0);

    session.deselect().unwrap();
    let snap = wait_for(&session, |s| s.selected.is_none()).await;
    assert_eq!(snap.find("c1").unwrap().unread_count, 0);
    session.shutdown().await;
}

#[tokio::test]
async fn test_slow_bulk_response_does_not_regress_push() {
    let backend = MemoryBackend::new(ME);
    backend.set_conversations(vec![direct("a", "u1", T1)]).await;
    let session = start(&backend, quiet_config()).await;
    wait_for(&session, |s| s.find("a").is_some()).await;

    backend
        .set_faults(Faults {
            fetch_delay: Some(Duration::from_millis(200)),
            ..Default::default()
        })
        .await;
    session.refresh().unwrap();
    backend.emit("message:new", new_message("a", "m1", "u1", T2));
    wait_for(&session, |s| s.find("a").is_some_and(|c| c.updated_at == at(T2))).await;

    timeout(Duration::from_secs(5), async {
        while backend.fetch_calls().await < 2 {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
    sleep(Duration::from_millis(400)).await;

    let a = session.snapshot().find("a").unwrap().clone();
    assert_eq!(a.updated_at, at(T2));
    assert_eq!(a.last_message.unwrap().id, "m1");
    assert_eq!(a.unread_count, 1);
    session.shutdown().await;
}

#[tokio::test]
async fn test_fallback_refresh_after_created_event() {
    let backend = MemoryBackend::new(ME);
    let mut config = quiet_config();
    config.fallback_refresh_delay = Duration::from_millis(50);
    backend.set_conversations(vec![direct("c0", "u0", T1)]).await;
    let session = start(&backend, config).await;
    wait_for(&session, |s| s.find("c0").is_some()).await;

    // Server already knows the conversation; targeted lookup finds nobody
    let mut known = direct("c3", "u3", T2);
    known.unread_count = 1;
    backend
        .set_conversations(vec![direct("c0", "u0", T1), known])
        .await;
    backend.emit("conversation:created", created_direct("c3", "u3", "u3", T2));

    let snap = wait_for(&session, |s| {
        s.find("c3").is_some_and(|c| c.peer().is_some_and(|p| p.display_name == "User u3"))
    })
    .await;
    assert_eq!(snap.find("c3").unwrap().unread_count, 1);
    assert!(backend.fetch_calls().await >= 2);
    session.shutdown().await;
}

#[tokio::test]
async fn test_failed_lookup_waits_for_next_refresh() {
    let backend = MemoryBackend::new(ME);
    backend
        .set_faults(Faults {
            fail_lookups: true,
            ..Default::default()
        })
        .await;
    backend.set_conversations(vec![direct("c0", "u0", T1)]).await;
    let session = start(&backend, quiet_config()).await;
    let mut warnings = session.warnings();
    wait_for(&session, |s| s.find("c0").is_some()).await;

    backend.emit("conversation:created", created_direct("c4", "u4", "u4", T1));
    let warning = next_warning(&mut warnings).await;
    assert!(matches!(warning, SyncWarning::LookupFailed { .. }));

    backend.emit("message:new", new_message("c4", "m2", "u4", T2));
    wait_for(&session, |s| s.find("c4").is_some_and(|c| c.unread_count == 2)).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.lookup_calls().await, 1);

    backend.set_faults(Faults::default()).await;
    backend.add_participant(peer("u4", "Four")).await;
    session.refresh().unwrap();
    let snap = wait_for(&session, |s| {
        s.find("c4").is_some_and(|c| !c.needs_enrichment())
    })
    .await;
    // Placeholder survives the refresh that does not list it yet
    assert_eq!(snap.find("c4").unwrap().unread_count, 2);
    session.shutdown().await;
}

#[tokio::test]
async fn test_malformed_and_unknown_events_are_dropped() {
    let backend = MemoryBackend::new(ME);
    backend.set_conversations(vec![direct("c1", "u1", T1)]).await;
    let session = start(&backend, quiet_config()).await;
    let mut warnings = session.warnings();
    let before = wait_for(&session, |s| s.find("c1").is_some()).await;

    backend.emit("message:new", serde_json::json!({ "conversationId": 42 }));
    let warning = next_warning(&mut warnings).await;
    assert!(matches!(warning, SyncWarning::EventDropped { ref event, .. } if event == "message:new"));

    backend.emit("message:new", new_message("ghost", "m1", "u1", T2));
    backend.emit(
        "conversation:updated",
        serde_json::json!({ "conversationId": "ghost", "updatedAt": T2 }),
    );
    sleep(Duration::from_millis(100)).await;

    let after = session.snapshot();
    assert_eq!(after.version, before.version);
    assert_eq!(after.ids(), vec!["c1"]);
    session.shutdown().await;
}

#[tokio::test]
async fn test_conversation_updated_twice_is_idempotent() {
    let backend = MemoryBackend::new(ME);
    let mut c1 = direct("c1", "u1", T1);
    c1.unread_count = 4;
    backend.set_conversations(vec![c1]).await;
    let session = start(&backend, quiet_config()).await;
    wait_for(&session, |s| s.find("c1").is_some()).await;

    let update = serde_json::json!({
        "conversationId": "c1",
        "lastMessage": { "id": "m7", "senderId": "u1", "content": "later", "sentAt": T2 },
        "updatedAt": T2,
    });
    backend.emit("conversation:updated", update.clone());
    let once = wait_for(&session, |s| s.find("c1").is_some_and(|c| c.updated_at == at(T2))).await;

    backend.emit("conversation:updated", update);
    sleep(Duration::from_millis(100)).await;
    let twice = session.snapshot();

    assert_eq!(twice.version, once.version);
    assert_eq!(twice.conversations, once.conversations);
    assert_eq!(twice.find("c1").unwrap().unread_count, 4);
    session.shutdown().await;
}

#[tokio::test]
async fn test_send_message_to_new_recipient_creates_conversation() {
    let backend = MemoryBackend::new(ME);
    backend.add_participant(peer("u5", "Five")).await;
    let session = start(&backend, quiet_config()).await;

    let message = session
        .send_message(SendMessagePayload {
            conversation_id: None,
            recipient_id: Some("u5".into()),
            group_id: None,
            content: "first contact".into(),
        })
        .await
        .unwrap();

    let snap = wait_for(&session, |s| s.find(&message.conversation_id).is_some()).await;
    let conv = snap.find(&message.conversation_id).unwrap();
    assert_eq!(conv.peer().unwrap().display_name, "Five");
    assert_eq!(conv.unread_count, 0);
    assert_eq!(backend.sent_messages().await.len(), 1);
    session.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_unsubscribes_and_closes() {
    let backend = MemoryBackend::new(ME);
    let session = start(&backend, quiet_config()).await;
    assert!(backend.is_subscribed("message:new"));
    assert!(backend.is_subscribed("conversation:created"));

    session.shutdown().await;
    session.shutdown().await;

    assert!(!backend.is_subscribed("message:new"));
    assert!(!backend.is_subscribed("conversation:updated"));
    assert!(matches!(session.refresh(), Err(SyncError::SessionClosed)));
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let backend = MemoryBackend::new(ME);
    let result = SyncSession::start(
        SyncConfig::default(),
        Arc::new(backend.clone()),
        Arc::new(backend),
    );
    assert!(matches!(result, Err(SyncError::Config(_))));
}

#[tokio::test]
async fn test_message_after_metadata_update_counts_once() {
    let backend = MemoryBackend::new(ME);
    backend.set_conversations(vec![direct("c1", "u1", T1)]).await;
    let session = start(&backend, quiet_config()).await;
    wait_for(&session, |s| s.find("c1").is_some()).await;

    backend.emit(
        "conversation:updated",
        serde_json::json!({
            "conversationId": "c1",
            "lastMessage": { "id": "m1", "senderId": "u1", "content": "hi", "sentAt": T2 },
            "updatedAt": T2,
        }),
    );
    wait_for(&session, |s| s.find("c1").is_some_and(|c| c.updated_at == at(T2))).await;

    backend.emit("message:new", new_message("c1", "m1", "u1", T2));
    backend.emit("message:new", new_message("c1", "m1", "u1", T2));
    wait_for(&session, |s| s.find("c1").is_some_and(|c| c.unread_count == 1)).await;
    sleep(Duration::from_millis(100)).await;

    let c1 = session.snapshot().find("c1").unwrap().clone();
    assert_eq!(c1.unread_count, 1);
    assert_eq!(c1.total_messages, 1);
    session.shutdown().await;
}

#[tokio::test]
async fn test_second_create_pushes_fallback_refresh_back() {
    let backend = MemoryBackend::new(ME);
    backend.set_conversations(vec![direct("c0", "u0", T1)]).await;
    let mut config = quiet_config();
    config.fallback_refresh_delay = Duration::from_millis(200);
    let session = start(&backend, config).await;
    wait_for(&session, |s| s.find("c0").is_some()).await;
    assert_eq!(backend.fetch_calls().await, 1);

    backend.emit("conversation:created", created_direct("c5", "u5", "u5", T2));
    sleep(Duration::from_millis(150)).await;
    let second = std::time::Instant::now();
    backend.emit("conversation:created", created_direct("c6", "u6", "u6", T3));

    sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.fetch_calls().await, 1);

    timeout(Duration::from_secs(5), async {
        while backend.fetch_calls().await < 2 {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert!(second.elapsed() >= Duration::from_millis(200));

    sleep(Duration::from_millis(300)).await;
    assert_eq!(backend.fetch_calls().await, 2);
    session.shutdown().await;
}

#[tokio::test]
async fn test_dropping_every_handle_stops_the_loop() {
    let backend = MemoryBackend::new(ME);
    let mut config = quiet_config();
    config.periodic_refresh_interval = Some(Duration::from_millis(30));
    let session = start(&backend, config).await;
    let observer = session.subscribe();
    assert!(backend.is_subscribed("message:new"));

    drop(session);

    timeout(Duration::from_secs(5), async {
        while backend.is_subscribed("message:new") {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("loop kept running after the last handle was dropped");
    assert!(!backend.is_subscribed("conversation:created"));

    let calls = backend.fetch_calls().await;
    sleep(Duration::from_millis(150)).await;
    assert_eq!(backend.fetch_calls().await, calls);
    drop(observer);
}
