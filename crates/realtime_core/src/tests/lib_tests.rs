use super::*;

use serde_json::json;
use shared::protocol::{NotificationEvent, RowChange, RowEvent, MESSAGE_EVENT};

use crate::{
    loopback::{LoopbackBackend, LoopbackHub},
    registry::ChannelKind,
    signals::{AuthEvent, AuthSession},
    test_support::{settle, RecordingStatusUpdater, ALICE, BOB, CAROL},
};

struct Device {
    backend: Arc<LoopbackBackend>,
    status: Arc<RecordingStatusUpdater>,
    client: RealtimeClient,
}

fn device(hub: &Arc<LoopbackHub>) -> Device {
    let backend = hub.connect();
    let status = Arc::new(RecordingStatusUpdater::default());
    let client = RealtimeClient::new_with_status_updater(
        backend.clone(),
        status.clone(),
        &RealtimeSettings::default(),
    );
    Device {
        backend,
        status,
        client,
    }
}

async fn sign_in(device: &Device, raw: &str) {
    device
        .client
        .orchestrator()
        .on_auth_event(AuthEvent::SignedIn(AuthSession {
            user_id: UserId::new(raw),
            access_token: format!("token-{raw}"),
        }))
        .await;
    settle().await;
}

#[tokio::test(start_paused = true)]
async fn chat_operations_need_a_signed_in_user() {
    let hub = LoopbackHub::new();
    let alice = device(&hub);

    let cleanup = alice
        .client
        .open_individual_chat(&UserId::new(BOB), ConversationCallbacks::default())
        .await;
    assert!(cleanup.is_noop());
    assert!(
        !alice
            .client
            .send_broadcast(ChatType::Individual, BOB, MESSAGE_EVENT, json!({}))
            .await
    );
    assert!(!alice.client.send_typing_indicator(ChatType::Group, "g1", true).await);
    assert_eq!(alice.client.track_status(json!({ "status": "away" })).await, TrackStatus::Error);
    assert!(hub.live_channel_names().is_empty());
}

#[tokio::test(start_paused = true)]
async fn two_devices_see_each_other_and_exchange_messages() {
    let hub = LoopbackHub::new();
    let alice = device(&hub);
    let bob = device(&hub);
    sign_in(&alice, ALICE).await;
    sign_in(&bob, BOB).await;

    assert!(alice.client.is_connected());
    assert_eq!(
        alice.client.online_users(),
        vec![UserId::new(ALICE), UserId::new(BOB)]
    );
    let members = alice.client.get_group_member_presence(&[
        UserId::new(BOB),
        UserId::new(CAROL),
    ]);
    assert_eq!(members.get(&UserId::new(BOB)), Some(&true));
    assert_eq!(members.get(&UserId::new(CAROL)), Some(&false));
    assert_eq!(bob.status.calls(), vec![(UserId::new(BOB), true)]);
    assert_eq!(alice.backend.access_token(), Some(format!("token-{ALICE}")));

    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let _bob_chat = bob
        .client
        .open_individual_chat(
            &UserId::new(ALICE),
            ConversationCallbacks::default().with_message(move |payload| {
                lock_unpoisoned(&sink).push(payload);
            }),
        )
        .await;
    let alice_chat = alice
        .client
        .open_individual_chat(&UserId::new(BOB), ConversationCallbacks::default())
        .await;
    settle().await;
    assert_eq!(
        alice
            .client
            .channel_descriptors()
            .iter()
            .map(|descriptor| descriptor.kind)
            .collect::<Vec<_>>(),
        vec![
            ChannelKind::Presence,
            ChannelKind::Notification,
            ChannelKind::IndividualChat
        ]
    );

    assert!(
        alice
            .client
            .send_broadcast(ChatType::Individual, BOB, MESSAGE_EVENT, json!({ "text": "hi" }))
            .await
    );
    settle().await;
    assert_eq!(*lock_unpoisoned(&received), vec![json!({ "text": "hi" })]);

    alice_chat.cleanup().await;
    assert!(
        !alice
            .client
            .send_broadcast(ChatType::Individual, BOB, MESSAGE_EVENT, json!({ "text": "gone" }))
            .await
    );
}

#[tokio::test(start_paused = true)]
async fn notification_listeners_can_be_added_and_removed() {
    let hub = LoopbackHub::new();
    let bob = device(&hub);
    sign_in(&bob, BOB).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let listener: Listener = Arc::new(move |change: &RowChange| {
        lock_unpoisoned(&sink).push(change.new_field("content").map(str::to_string));
    });
    let event = NotificationEvent::NewMessage.as_str();
    bob.client.subscribe_to_event(event, Arc::clone(&listener));

    hub.emit_row_change(RowChange::new(
        RowEvent::Insert,
        "messages",
        json!({ "receiver_id": BOB, "sender_id": ALICE, "content": "ping" }),
    ));
    // addressed to someone else
    hub.emit_row_change(RowChange::new(
        RowEvent::Insert,
        "messages",
        json!({ "receiver_id": CAROL, "sender_id": ALICE, "content": "nope" }),
    ));
    assert_eq!(*lock_unpoisoned(&seen), vec![Some("ping".to_string())]);

    assert!(bob.client.unsubscribe_from_event(event, &listener));
    hub.emit_row_change(RowChange::new(
        RowEvent::Insert,
        "messages",
        json!({ "receiver_id": BOB, "sender_id": ALICE, "content": "late" }),
    ));
    assert_eq!(lock_unpoisoned(&seen).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn presence_watchers_observe_departures() {
    let hub = LoopbackHub::new();
    let alice = device(&hub);
    let bob = device(&hub);
    sign_in(&alice, ALICE).await;
    sign_in(&bob, BOB).await;

    let mut watcher = alice.client.watch_presence();
    let _ = watcher.borrow_and_update();
    bob.client.shutdown().await;
    settle().await;

    assert!(watcher.has_changed().unwrap_or(false));
    assert!(!alice.client.is_user_online(&UserId::new(BOB)));
    assert!(alice.client.presence_state().contains_key(&UserId::new(ALICE)));
    assert!(!bob.client.is_connected());
}
