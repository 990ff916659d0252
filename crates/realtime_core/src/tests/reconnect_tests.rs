use super::*;
use std::sync::atomic::AtomicUsize;

use crate::{
    backend::{ChannelConfig, StatusCallback},
    loopback::{LoopbackBackend, LoopbackHub},
};

fn supervisor() -> (Arc<LoopbackHub>, Arc<LoopbackBackend>, ReconnectionSupervisor) {
    let hub = LoopbackHub::new();
    let backend = hub.connect();
    let supervisor = ReconnectionSupervisor::new(
        backend.clone(),
        DEFAULT_BASE_DELAY,
        DEFAULT_MAX_ATTEMPTS,
    );
    (hub, backend, supervisor)
}

async fn failed_handle(backend: &Arc<LoopbackBackend>, name: &str) -> Arc<dyn ChannelHandle> {
    let handle = backend.channel(name, ChannelConfig::default());
    let noop: StatusCallback = Arc::new(|_| {});
    handle.subscribe(noop).await.expect("subscribe");
    handle
}

fn counting_retry(counter: &Arc<AtomicUsize>) -> Option<RetryAction> {
    let counter = Arc::clone(counter);
    Some(Box::new(move || {
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }))
}

async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

#[test]
fn backoff_doubles_from_the_base_delay() {
    let delays: Vec<u128> = (0..5)
        .map(|attempt| backoff_delay(DEFAULT_BASE_DELAY, attempt).as_millis())
        .collect();
    assert_eq!(delays, vec![2000, 4000, 8000, 16000, 32000]);
}

#[tokio::test(start_paused = true)]
async fn errors_schedule_exponential_retries_until_exhausted() {
    let (_hub, backend, supervisor) = supervisor();
    let retries = Arc::new(AtomicUsize::new(0));

    for expected_attempt in 0..DEFAULT_MAX_ATTEMPTS {
        let handle = failed_handle(&backend, "user_presence").await;
        let decision = supervisor
            .on_channel_error(handle, counting_retry(&retries))
            .await;
        assert_eq!(
            decision,
            ReconnectDecision::Scheduled {
                attempt: expected_attempt,
                delay: backoff_delay(DEFAULT_BASE_DELAY, expected_attempt),
            }
        );
    }

    let handle = failed_handle(&backend, "user_presence").await;
    let decision = supervisor
        .on_channel_error(handle, counting_retry(&retries))
        .await;
    assert_eq!(decision, ReconnectDecision::GivenUp);
    assert_eq!(supervisor.phase("user_presence"), ReconnectPhase::GivenUp);
    assert!(!supervisor.has_pending_retry("user_presence"));

    // Nothing fires later either: the pending timer was cancelled on give-up.
    tokio::time::sleep(Duration::from_secs(120)).await;
    settle().await;
    assert_eq!(retries.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn further_errors_after_give_up_stay_given_up_until_reset() {
    let (_hub, backend, supervisor) = supervisor();
    let retries = Arc::new(AtomicUsize::new(0));
    for _ in 0..(DEFAULT_MAX_ATTEMPTS + 3) {
        let handle = failed_handle(&backend, "notifications_for_u1").await;
        supervisor
            .on_channel_error(handle, counting_retry(&retries))
            .await;
    }
    assert_eq!(supervisor.attempts("notifications_for_u1"), DEFAULT_MAX_ATTEMPTS);
    assert_eq!(supervisor.phase("notifications_for_u1"), ReconnectPhase::GivenUp);

    supervisor.reset("notifications_for_u1");
    assert_eq!(supervisor.attempts("notifications_for_u1"), 0);
    let handle = failed_handle(&backend, "notifications_for_u1").await;
    assert!(matches!(
        supervisor.on_channel_error(handle, None).await,
        ReconnectDecision::Scheduled { attempt: 0, .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn retry_action_runs_after_the_backoff_delay() {
    let (_hub, backend, supervisor) = supervisor();
    let retries = Arc::new(AtomicUsize::new(0));
    let handle = failed_handle(&backend, "user_presence").await;
    supervisor
        .on_channel_error(handle, counting_retry(&retries))
        .await;

    tokio::time::sleep(Duration::from_millis(1999)).await;
    settle().await;
    assert_eq!(retries.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(2)).await;
    settle().await;
    assert_eq!(retries.load(Ordering::SeqCst), 1);
    assert_eq!(supervisor.phase("user_presence"), ReconnectPhase::Reconnecting(1));
}

#[tokio::test(start_paused = true)]
async fn offline_errors_are_deferred_without_consuming_attempts() {
    let (hub, backend, supervisor) = supervisor();
    supervisor.set_network_online(false);
    let retries = Arc::new(AtomicUsize::new(0));

    let handle = failed_handle(&backend, "chat_a_b").await;
    let decision = supervisor
        .on_channel_error(handle, counting_retry(&retries))
        .await;

    assert_eq!(decision, ReconnectDecision::DeferredOffline);
    assert_eq!(supervisor.attempts("chat_a_b"), 0);
    assert_eq!(supervisor.phase("chat_a_b"), ReconnectPhase::Backoff(0));
    assert_eq!(supervisor.pending_retry_count(), 0);
    // the failed handle is still released so nothing is orphaned remotely
    assert_eq!(hub.removed_count("chat_a_b"), 1);

    tokio::time::sleep(Duration::from_secs(60)).await;
    settle().await;
    assert_eq!(retries.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn a_new_error_replaces_the_pending_timer_for_the_same_name() {
    let (_hub, backend, supervisor) = supervisor();
    let retries = Arc::new(AtomicUsize::new(0));

    let first = failed_handle(&backend, "user_presence").await;
    supervisor.on_channel_error(first, counting_retry(&retries)).await;
    let second = failed_handle(&backend, "user_presence").await;
    supervisor.on_channel_error(second, counting_retry(&retries)).await;
    assert_eq!(supervisor.pending_retry_count(), 1);

    tokio::time::sleep(Duration::from_secs(10)).await;
    settle().await;
    assert_eq!(retries.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn reset_all_clears_counters_and_pending_timers() {
    let (_hub, backend, supervisor) = supervisor();
    let retries = Arc::new(AtomicUsize::new(0));
    for name in ["user_presence", "notifications_for_u1"] {
        let handle = failed_handle(&backend, name).await;
        supervisor.on_channel_error(handle, counting_retry(&retries)).await;
    }
    assert_eq!(supervisor.pending_retry_count(), 2);

    supervisor.reset_all();
    assert_eq!(supervisor.pending_retry_count(), 0);
    assert_eq!(supervisor.attempts("user_presence"), 0);
    assert_eq!(supervisor.phase("notifications_for_u1"), ReconnectPhase::Healthy);

    tokio::time::sleep(Duration::from_secs(10)).await;
    settle().await;
    assert_eq!(retries.load(Ordering::SeqCst), 0);
}
