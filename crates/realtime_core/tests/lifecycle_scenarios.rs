use std::{sync::Arc, time::Duration};

use realtime_core::{
    config::RealtimeSettings,
    conversation::{ConversationCallbacks, ConversationKey},
    loopback::{LoopbackBackend, LoopbackHub},
    registry::PRESENCE_CHANNEL,
    signals::{AppState, AuthEvent, AuthSession, NetworkStatus},
    status::NoopStatusUpdater,
    RealtimeClient,
};
use shared::domain::UserId;

const ALICE: &str = "0b6c3c1e-6a8f-4f39-9d0e-5d1f2a3b4c5d";
const BOB: &str = "7e2d9a40-1c3b-4e5f-8a6b-9c0d1e2f3a4b";

async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

fn client(hub: &Arc<LoopbackHub>) -> (Arc<LoopbackBackend>, RealtimeClient) {
    let backend = hub.connect();
    let client = RealtimeClient::new_with_status_updater(
        backend.clone(),
        Arc::new(NoopStatusUpdater),
        &RealtimeSettings::default(),
    );
    (backend, client)
}

async fn sign_in(client: &RealtimeClient, raw: &str) {
    client
        .orchestrator()
        .on_auth_event(AuthEvent::SignedIn(AuthSession {
            user_id: UserId::new(raw),
            access_token: "token".to_string(),
        }))
        .await;
    settle().await;
}

async fn past_rebuild_delay() {
    tokio::time::sleep(Duration::from_millis(300)).await;
    settle().await;
}

#[tokio::test(start_paused = true)]
async fn swapped_open_while_offline_rebuilds_once_after_restore() {
    let hub = LoopbackHub::new();
    let (_, alice) = client(&hub);
    let (_, bob) = client(&hub);
    sign_in(&alice, ALICE).await;
    sign_in(&bob, BOB).await;

    let chat = ConversationKey::individual(&UserId::new(ALICE), &UserId::new(BOB)).channel_name();
    assert_eq!(
        chat,
        ConversationKey::individual(&UserId::new(BOB), &UserId::new(ALICE)).channel_name()
    );

    for device in [&alice, &bob] {
        device
            .orchestrator()
            .on_network_change(NetworkStatus::OFFLINE)
            .await;
    }
    hub.fail_subscribe(&chat, 2);
    let _a = alice
        .open_individual_chat(&UserId::new(BOB), ConversationCallbacks::default())
        .await;
    let _b = bob
        .open_individual_chat(&UserId::new(ALICE), ConversationCallbacks::default())
        .await;
    settle().await;

    assert_eq!(hub.created_count(&chat), 2);
    assert_eq!(hub.subscriber_count(&chat), 0);
    for device in [&alice, &bob] {
        assert!(!device.conversations().is_open(&chat));
        assert_eq!(device.supervisor().pending_retry_count(), 0);
    }

    for device in [&alice, &bob] {
        device
            .orchestrator()
            .on_network_change(NetworkStatus::ONLINE)
            .await;
    }
    // a flapping provider repeating "online" must not schedule a second rebuild
    alice
        .orchestrator()
        .on_network_change(NetworkStatus::ONLINE)
        .await;
    past_rebuild_delay().await;
    tokio::time::sleep(Duration::from_secs(60)).await;
    settle().await;

    for device in [&alice, &bob] {
        assert_eq!(device.orchestrator().rebuild_count(), 2);
        assert!(device.is_connected());
    }
    // conversation channels come back only when a view opens them again
    assert_eq!(hub.created_count(&chat), 2);
    let _a = alice
        .open_individual_chat(&UserId::new(BOB), ConversationCallbacks::default())
        .await;
    settle().await;
    assert_eq!(hub.subscriber_count(&chat), 1);
}

#[tokio::test(start_paused = true)]
async fn background_and_foreground_within_a_second_cycle_once() {
    let hub = LoopbackHub::new();
    let (backend, alice) = client(&hub);
    sign_in(&alice, ALICE).await;
    assert_eq!(hub.created_count(PRESENCE_CHANNEL), 1);

    let orchestrator = alice.orchestrator();
    orchestrator.on_app_state_change(AppState::Background).await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    orchestrator.on_app_state_change(AppState::Active).await;
    // late duplicate foreground report from the host
    orchestrator.on_app_state_change(AppState::Active).await;
    past_rebuild_delay().await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    settle().await;

    assert_eq!(hub.removed_count(PRESENCE_CHANNEL), 1);
    assert_eq!(hub.created_count(PRESENCE_CHANNEL), 2);
    assert_eq!(orchestrator.rebuild_count(), 2);
    assert_eq!(hub.subscriber_count(PRESENCE_CHANNEL), 1);
    assert!(alice.is_connected());
    assert_eq!(backend.open_channel_names().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn network_restore_clears_backoff_before_rebuilding() {
    let hub = LoopbackHub::new();
    let (_, alice) = client(&hub);
    sign_in(&alice, ALICE).await;

    hub.break_channel(PRESENCE_CHANNEL);
    settle().await;
    assert_eq!(alice.supervisor().attempts(PRESENCE_CHANNEL), 1);
    assert!(alice.supervisor().has_pending_retry(PRESENCE_CHANNEL));

    alice
        .orchestrator()
        .on_network_change(NetworkStatus::OFFLINE)
        .await;
    assert!(!alice.supervisor().has_pending_retry(PRESENCE_CHANNEL));
    assert_eq!(alice.supervisor().attempts(PRESENCE_CHANNEL), 1);

    alice
        .orchestrator()
        .on_network_change(NetworkStatus::ONLINE)
        .await;
    assert_eq!(alice.supervisor().attempts(PRESENCE_CHANNEL), 0);
    assert!(alice.orchestrator().has_pending_rebuild());
    assert!(!alice.is_connected());

    past_rebuild_delay().await;
    assert!(alice.is_connected());
    assert_eq!(alice.supervisor().attempts(PRESENCE_CHANNEL), 0);
}

#[tokio::test(start_paused = true)]
async fn teardown_twice_leaves_nothing_behind() {
    let hub = LoopbackHub::new();
    let (backend, alice) = client(&hub);
    sign_in(&alice, ALICE).await;

    alice.registry().teardown_all().await;
    alice.registry().teardown_all().await;

    assert!(alice.registry().descriptors().is_empty());
    assert!(hub.live_channel_names().is_empty());
    assert!(backend.open_channel_names().is_empty());
}
