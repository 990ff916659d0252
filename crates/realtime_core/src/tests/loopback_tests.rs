use super::*;
use serde_json::json;
use shared::protocol::RowEvent;

use crate::backend::{PresenceEventKind, RowChangeFilter};

fn recorder() -> (Arc<Mutex<Vec<ChannelEvent>>>, EventCallback) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    let callback: EventCallback = Arc::new(move |event| sink.lock().expect("lock").push(event));
    (events, callback)
}

fn status_recorder() -> (Arc<Mutex<Vec<SubscribeStatus>>>, StatusCallback) {
    let statuses = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&statuses);
    let callback: StatusCallback = Arc::new(move |status| sink.lock().expect("lock").push(status));
    (statuses, callback)
}

#[tokio::test]
async fn track_fans_out_join_then_authoritative_sync() {
    let hub = LoopbackHub::new();
    let alice = hub.connect();
    let bob = hub.connect();

    let alice_channel = alice.channel("user_presence", ChannelConfig::with_presence_key("alice"));
    let bob_channel = bob.channel("user_presence", ChannelConfig::with_presence_key("bob"));
    let (bob_events, callback) = recorder();
    bob_channel.on(ChannelBinding::Presence(PresenceEventKind::Join), Arc::clone(&callback));
    bob_channel.on(ChannelBinding::Presence(PresenceEventKind::Sync), callback);

    let (_, status) = status_recorder();
    alice_channel.subscribe(Arc::clone(&status)).await.expect("subscribe alice");
    bob_channel.subscribe(status).await.expect("subscribe bob");

    alice_channel
        .track(json!({ "user_id": "alice" }))
        .await
        .expect("track");

    let events = bob_events.lock().expect("lock").clone();
    // initial sync on subscribe, then join + sync for alice
    assert_eq!(events.len(), 3);
    assert!(matches!(&events[1], ChannelEvent::PresenceJoin { key, .. } if key.as_str() == "alice"));
    match &events[2] {
        ChannelEvent::PresenceSync(state) => {
            assert_eq!(state.len(), 1);
            assert_eq!(state[&UserId::new("alice")].len(), 1);
        }
        other => panic!("expected sync, got {other:?}"),
    }
}

#[tokio::test]
async fn removing_a_tracked_channel_emits_leave_to_remaining_subscribers() {
    let hub = LoopbackHub::new();
    let alice = hub.connect();
    let bob = hub.connect();
    let alice_channel = alice.channel("user_presence", ChannelConfig::with_presence_key("alice"));
    let bob_channel = bob.channel("user_presence", ChannelConfig::with_presence_key("bob"));
    let (bob_events, callback) = recorder();
    bob_channel.on(ChannelBinding::Presence(PresenceEventKind::Leave), callback);

    let (_, status) = status_recorder();
    alice_channel.subscribe(Arc::clone(&status)).await.expect("subscribe");
    bob_channel.subscribe(status).await.expect("subscribe");
    alice_channel.track(json!({})).await.expect("track");

    alice.remove_channel(alice_channel).await.expect("remove");

    assert!(hub.presence_state("user_presence").is_empty());
    assert_eq!(bob_events.lock().expect("lock").len(), 1);
    assert_eq!(hub.removed_count("user_presence"), 1);
    assert!(alice.open_channel_names().is_empty());
}

#[tokio::test]
async fn broadcast_skips_sender_unless_self_delivery_is_enabled() {
    let hub = LoopbackHub::new();
    let alice = hub.connect();
    let bob = hub.connect();
    let alice_channel = alice.channel("chat_a_b", ChannelConfig::default());
    let bob_channel = bob.channel("chat_a_b", ChannelConfig::default());
    let (alice_events, alice_cb) = recorder();
    let (bob_events, bob_cb) = recorder();
    alice_channel.on(ChannelBinding::Broadcast("typing".into()), alice_cb);
    bob_channel.on(ChannelBinding::Broadcast("typing".into()), bob_cb);

    let (_, status) = status_recorder();
    alice_channel.subscribe(Arc::clone(&status)).await.expect("subscribe");
    bob_channel.subscribe(status).await.expect("subscribe");

    alice_channel
        .send(BroadcastEnvelope::new("typing", json!({ "typing": true })))
        .await
        .expect("send");

    assert!(alice_events.lock().expect("lock").is_empty());
    assert_eq!(bob_events.lock().expect("lock").len(), 1);
}

#[tokio::test]
async fn injected_subscribe_failure_reports_channel_error_then_recovers() {
    let hub = LoopbackHub::new();
    let backend = hub.connect();
    hub.fail_subscribe("user_presence", 1);

    let (statuses, status) = status_recorder();
    let first = backend.channel("user_presence", ChannelConfig::default());
    first.subscribe(Arc::clone(&status)).await.expect("subscribe call");
    let second = backend.channel("user_presence", ChannelConfig::default());
    second.subscribe(status).await.expect("subscribe call");

    assert_eq!(
        *statuses.lock().expect("lock"),
        vec![SubscribeStatus::ChannelError, SubscribeStatus::Subscribed]
    );
    assert_eq!(hub.created_count("user_presence"), 2);
    assert_eq!(hub.subscribe_count("user_presence"), 1);
}

#[tokio::test]
async fn removal_is_idempotent_and_injected_failures_surface() {
    let hub = LoopbackHub::new();
    let backend = hub.connect();
    let channel = backend.channel("notifications_for_u1", ChannelConfig::default());
    let (_, status) = status_recorder();
    channel.subscribe(status).await.expect("subscribe");

    hub.fail_removal("notifications_for_u1", true);
    assert!(backend.remove_channel(Arc::clone(&channel)).await.is_err());
    assert_eq!(hub.subscriber_count("notifications_for_u1"), 1);

    hub.fail_removal("notifications_for_u1", false);
    backend.remove_channel(Arc::clone(&channel)).await.expect("remove");
    backend.remove_channel(channel).await.expect("second remove is a no-op");
    assert_eq!(hub.removed_count("notifications_for_u1"), 1);
    assert!(hub.live_channel_names().is_empty());
}

#[tokio::test]
async fn row_changes_reach_only_matching_filters() {
    let hub = LoopbackHub::new();
    let backend = hub.connect();
    let channel = backend.channel("notifications_for_u2", ChannelConfig::default());
    let (events, callback) = recorder();
    channel.on(
        ChannelBinding::RowChange(
            RowChangeFilter::new(RowEvent::Insert, "messages").with_filter("receiver_id=eq.u2"),
        ),
        callback,
    );
    let (_, status) = status_recorder();
    channel.subscribe(status).await.expect("subscribe");

    let delivered = hub.emit_row_change(RowChange::new(
        RowEvent::Insert,
        "messages",
        json!({ "receiver_id": "u2" }),
    ));
    let ignored = hub.emit_row_change(RowChange::new(
        RowEvent::Insert,
        "messages",
        json!({ "receiver_id": "u3" }),
    ));

    assert_eq!(delivered, 1);
    assert_eq!(ignored, 0);
    assert_eq!(events.lock().expect("lock").len(), 1);
}

#[tokio::test]
async fn break_channel_reports_errors_and_drops_subscribers() {
    let hub = LoopbackHub::new();
    let backend = hub.connect();
    let channel = backend.channel("group_chat_g1", ChannelConfig::default());
    let (statuses, status) = status_recorder();
    channel.subscribe(status).await.expect("subscribe");

    assert_eq!(hub.break_channel("group_chat_g1"), 1);
    assert_eq!(
        statuses.lock().expect("lock").last().copied(),
        Some(SubscribeStatus::ChannelError)
    );
    assert_eq!(hub.subscriber_count("group_chat_g1"), 0);
    assert!(channel
        .send(BroadcastEnvelope::new("message", json!({})))
        .await
        .is_err());
}

#[tokio::test]
async fn set_auth_records_the_latest_token() {
    let hub = LoopbackHub::new();
    let backend = hub.connect();
    backend.set_auth("token-1").await.expect("auth");
    backend.set_auth("token-2").await.expect("auth");
    assert_eq!(backend.access_token().as_deref(), Some("token-2"));
}
