use super::*;
use std::time::Duration;

use serde_json::json;
use shared::protocol::RowChange;

use crate::{
    loopback::{LoopbackBackend, LoopbackHub},
    reconnect::{DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS},
    test_support::{settle, RecordingStatusUpdater, ALICE, BOB},
};

struct Harness {
    hub: Arc<LoopbackHub>,
    backend: Arc<LoopbackBackend>,
    supervisor: Arc<ReconnectionSupervisor>,
    presence: Arc<PresenceCoordinator>,
    events: Arc<EventBus>,
    status: Arc<RecordingStatusUpdater>,
    registry: Arc<ChannelRegistry>,
}

fn harness() -> Harness {
    let hub = LoopbackHub::new();
    let backend = hub.connect();
    let supervisor = Arc::new(ReconnectionSupervisor::new(
        backend.clone(),
        DEFAULT_BASE_DELAY,
        DEFAULT_MAX_ATTEMPTS,
    ));
    let presence = Arc::new(PresenceCoordinator::new());
    let events = Arc::new(EventBus::new());
    let status = Arc::new(RecordingStatusUpdater::default());
    let registry = ChannelRegistry::new(
        backend.clone(),
        Arc::clone(&presence),
        Arc::clone(&events),
        Arc::clone(&supervisor),
        status.clone(),
    );
    Harness {
        hub,
        backend,
        supervisor,
        presence,
        events,
        status,
        registry,
    }
}

fn alice() -> UserId {
    UserId::new(ALICE)
}

#[tokio::test]
async fn building_main_channels_tracks_presence_and_reports_online() {
    let h = harness();
    h.registry.ensure_main_channels(Some(alice())).await;
    settle().await;

    assert!(h.registry.is_connected());
    assert_eq!(
        h.registry
            .descriptors()
            .iter()
            .map(|d| (d.name.clone(), d.status))
            .collect::<Vec<_>>(),
        vec![
            (PRESENCE_CHANNEL.to_string(), ChannelStatus::Subscribed),
            (notification_channel_name(&alice()), ChannelStatus::Subscribed),
        ]
    );
    assert!(h.presence.is_online(&alice()));
    assert_eq!(h.status.calls(), vec![(alice(), true)]);
}

#[tokio::test]
async fn rebuilding_replaces_channels_without_duplicates() {
    let h = harness();
    h.registry.ensure_main_channels(Some(alice())).await;
    h.registry.ensure_main_channels(Some(alice())).await;
    settle().await;

    assert_eq!(h.hub.created_count(PRESENCE_CHANNEL), 2);
    assert_eq!(h.hub.removed_count(PRESENCE_CHANNEL), 1);
    assert_eq!(h.hub.subscriber_count(PRESENCE_CHANNEL), 1);
    assert_eq!(
        h.backend.open_channel_names(),
        vec![notification_channel_name(&alice()), PRESENCE_CHANNEL.to_string()]
    );
    // one presence entry for alice, not one per build
    assert_eq!(h.hub.presence_state(PRESENCE_CHANNEL)[&alice()].len(), 1);
}

#[tokio::test]
async fn teardown_twice_is_harmless_and_reports_offline_once() {
    let h = harness();
    h.registry.ensure_main_channels(Some(alice())).await;
    settle().await;

    h.registry.teardown_all().await;
    h.registry.teardown_all().await;

    assert!(h.registry.descriptors().is_empty());
    assert!(h.registry.current_user().is_none());
    assert!(h.hub.live_channel_names().is_empty());
    assert_eq!(h.status.calls(), vec![(alice(), true), (alice(), false)]);
}

#[tokio::test]
async fn teardown_for_rebuild_leaves_the_online_flag_alone() {
    let h = harness();
    h.registry.ensure_main_channels(Some(alice())).await;
    settle().await;

    h.registry.teardown_for_rebuild().await;

    assert!(h.registry.descriptors().is_empty());
    assert!(h.hub.live_channel_names().is_empty());
    assert_eq!(h.status.calls(), vec![(alice(), true)]);
}

#[tokio::test]
async fn teardown_continues_past_a_failing_removal() {
    let h = harness();
    h.registry.ensure_main_channels(Some(alice())).await;
    settle().await;
    h.hub.fail_removal(PRESENCE_CHANNEL, true);

    h.registry.teardown_all().await;

    assert!(h.registry.descriptors().is_empty());
    assert_eq!(h.hub.subscriber_count(&notification_channel_name(&alice())), 0);
    assert_eq!(h.status.calls().last(), Some(&(alice(), false)));
}

#[tokio::test]
async fn ensure_without_user_tears_down() {
    let h = harness();
    h.registry.ensure_main_channels(Some(alice())).await;
    settle().await;
    h.registry.ensure_main_channels(None).await;
    assert!(h.registry.descriptors().is_empty());
    assert!(!h.registry.is_connected());
}

#[tokio::test]
async fn row_changes_become_bus_notifications() {
    let h = harness();
    let seen = Arc::new(Mutex::new(Vec::new()));
    for event in NotificationEvent::ALL {
        let sink = Arc::clone(&seen);
        h.events.subscribe(
            event.as_str(),
            Arc::new(move |_: &RowChange| sink.lock().expect("lock").push(event)),
        );
    }
    h.registry.ensure_main_channels(Some(alice())).await;
    settle().await;

    let emit = |event, table: &str, record| {
        h.hub.emit_row_change(RowChange::new(event, table, record));
    };
    emit(RowEvent::Insert, "messages", json!({ "receiver_id": ALICE, "sender_id": BOB }));
    emit(RowEvent::Insert, "messages", json!({ "receiver_id": BOB, "sender_id": ALICE }));
    emit(RowEvent::Insert, "group_chat_messages", json!({ "sender_id": BOB }));
    emit(RowEvent::Insert, "group_chat_messages", json!({ "sender_id": ALICE }));
    emit(RowEvent::Insert, "group_chat_participants", json!({ "user_id": ALICE }));
    emit(RowEvent::Insert, "group_chat_participants", json!({ "user_id": BOB }));
    emit(RowEvent::Update, "message_status", json!({ "sender_id": ALICE, "receiver_id": BOB }));
    emit(RowEvent::Update, "message_status", json!({ "sender_id": BOB, "receiver_id": "x" }));
    emit(RowEvent::Insert, "group_message_status", json!({ "group_id": "g1" }));

    assert_eq!(
        *seen.lock().expect("lock"),
        vec![
            NotificationEvent::NewMessage,
            NotificationEvent::NewGroupMessage,
            NotificationEvent::AddedToGroup,
            NotificationEvent::MessageStatusUpdated,
            NotificationEvent::GroupMessageStatusUpdated,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn failed_presence_subscription_is_rebuilt_after_backoff() {
    let h = harness();
    h.hub.fail_subscribe(PRESENCE_CHANNEL, 1);

    h.registry.ensure_main_channels(Some(alice())).await;
    settle().await;
    assert_eq!(h.supervisor.attempts(PRESENCE_CHANNEL), 1);
    assert!(h.supervisor.has_pending_retry(PRESENCE_CHANNEL));
    assert!(!h.registry.is_connected());

    tokio::time::sleep(Duration::from_millis(2001)).await;
    settle().await;

    assert_eq!(h.hub.created_count(PRESENCE_CHANNEL), 2);
    assert!(h.registry.is_connected());
    assert_eq!(h.supervisor.attempts(PRESENCE_CHANNEL), 0);
    assert_eq!(h.hub.subscriber_count(PRESENCE_CHANNEL), 1);
    assert_eq!(h.hub.subscriber_count(&notification_channel_name(&alice())), 1);
}

#[tokio::test(start_paused = true)]
async fn teardown_cancels_a_pending_rebuild() {
    let h = harness();
    h.hub.fail_subscribe(PRESENCE_CHANNEL, 1);
    h.registry.ensure_main_channels(Some(alice())).await;
    settle().await;
    assert!(h.supervisor.has_pending_retry(PRESENCE_CHANNEL));

    h.registry.teardown_all().await;
    tokio::time::sleep(Duration::from_secs(30)).await;
    settle().await;

    assert_eq!(h.hub.created_count(PRESENCE_CHANNEL), 1);
    assert!(h.hub.live_channel_names().is_empty());
}

#[tokio::test]
async fn track_status_requires_a_subscribed_presence_channel() {
    let h = harness();
    assert_eq!(h.registry.track_status(json!({ "status": "busy" })).await, TrackStatus::Error);
    assert_eq!(h.registry.untrack_status().await, TrackStatus::Error);

    h.registry.ensure_main_channels(Some(alice())).await;
    settle().await;
    assert_eq!(h.registry.track_status(json!({ "status": "busy" })).await, TrackStatus::Ok);
    let metas = &h.hub.presence_state(PRESENCE_CHANNEL)[&alice()];
    assert_eq!(metas[0].extra.get("status"), Some(&json!("busy")));

    assert_eq!(h.registry.untrack_status().await, TrackStatus::Ok);
    assert!(h.hub.presence_state(PRESENCE_CHANNEL).is_empty());
}
