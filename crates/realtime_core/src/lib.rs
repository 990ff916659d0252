use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use shared::{
    domain::{ChatType, GroupId, UserId},
    protocol::PresenceState,
};
use tokio::{sync::watch, task::JoinHandle};
use tracing::warn;

pub mod backend;
pub mod config;
pub mod conversation;
pub mod error;
pub mod event_bus;
pub mod lifecycle;
pub mod loopback;
pub mod presence;
pub mod reconnect;
pub mod registry;
pub mod signals;
pub mod status;
pub mod timers;
pub mod transport;

use backend::{RealtimeBackend, TrackStatus};
use config::RealtimeSettings;
use conversation::{ConversationCallbacks, ConversationChannelFactory, ConversationCleanup};
use event_bus::{EventBus, Listener};
use lifecycle::LifecycleOrchestrator;
use presence::PresenceCoordinator;
use reconnect::ReconnectionSupervisor;
use registry::{ChannelDescriptor, ChannelRegistry};
use signals::SignalSources;
use status::{HttpStatusUpdater, UserStatusUpdater};

/// Locks a std mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Presence, notification and conversation channels for one signed-in user,
/// kept alive across network loss, backgrounding and session changes.
pub struct RealtimeClient {
    backend: Arc<dyn RealtimeBackend>,
    events: Arc<EventBus>,
    presence: Arc<PresenceCoordinator>,
    supervisor: Arc<ReconnectionSupervisor>,
    registry: Arc<ChannelRegistry>,
    conversations: Arc<ConversationChannelFactory>,
    orchestrator: Arc<LifecycleOrchestrator>,
}

impl RealtimeClient {
    pub fn new(backend: Arc<dyn RealtimeBackend>, settings: &RealtimeSettings) -> Self {
        let updater: Arc<dyn UserStatusUpdater> =
            Arc::new(HttpStatusUpdater::from_settings(settings));
        Self::new_with_status_updater(backend, updater, settings)
    }

    pub fn new_with_status_updater(
        backend: Arc<dyn RealtimeBackend>,
        status_updater: Arc<dyn UserStatusUpdater>,
        settings: &RealtimeSettings,
    ) -> Self {
        let events = Arc::new(EventBus::new());
        let presence = Arc::new(PresenceCoordinator::new());
        let supervisor = Arc::new(ReconnectionSupervisor::new(
            Arc::clone(&backend),
            settings.reconnect_base_delay(),
            settings.reconnect_max_attempts,
        ));
        let registry = ChannelRegistry::new(
            Arc::clone(&backend),
            Arc::clone(&presence),
            Arc::clone(&events),
            Arc::clone(&supervisor),
            Arc::clone(&status_updater),
        );
        let conversations = ConversationChannelFactory::new(
            Arc::clone(&backend),
            Arc::clone(&supervisor),
            settings.typing_timeout(),
        );
        let orchestrator = LifecycleOrchestrator::new(
            Arc::clone(&backend),
            Arc::clone(&registry),
            Arc::clone(&conversations),
            Arc::clone(&supervisor),
            Arc::clone(&presence),
            status_updater,
            settings.rebuild_delay(),
        );
        Self {
            backend,
            events,
            presence,
            supervisor,
            registry,
            conversations,
            orchestrator,
        }
    }

    pub fn backend(&self) -> &Arc<dyn RealtimeBackend> {
        &self.backend
    }

    pub fn orchestrator(&self) -> &Arc<LifecycleOrchestrator> {
        &self.orchestrator
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn conversations(&self) -> &Arc<ConversationChannelFactory> {
        &self.conversations
    }

    pub fn supervisor(&self) -> &Arc<ReconnectionSupervisor> {
        &self.supervisor
    }

    /// Starts reacting to the host's signals.
    pub fn start(&self, signals: SignalSources) -> JoinHandle<()> {
        self.orchestrator.spawn(signals)
    }

    pub async fn shutdown(&self) {
        self.orchestrator.shutdown().await;
    }

    pub fn current_user(&self) -> Option<UserId> {
        self.orchestrator.current_user()
    }

    pub fn is_connected(&self) -> bool {
        self.registry.is_connected()
    }

    /// Main channels followed by the open conversation channels.
    pub fn channel_descriptors(&self) -> Vec<ChannelDescriptor> {
        let mut descriptors = self.registry.descriptors();
        descriptors.extend(self.conversations.descriptors());
        descriptors
    }

    pub fn subscribe_to_event(&self, event: &str, listener: Listener) {
        self.events.subscribe(event, listener);
    }

    pub fn unsubscribe_from_event(&self, event: &str, listener: &Listener) -> bool {
        self.events.unsubscribe(event, listener)
    }

    pub async fn open_individual_chat(
        &self,
        peer_id: &UserId,
        callbacks: ConversationCallbacks,
    ) -> ConversationCleanup {
        let Some(me) = self.current_user() else {
            warn!(peer_id = %peer_id, "cannot open a chat without a signed-in user");
            return ConversationCleanup::noop();
        };
        self.conversations
            .open_individual(&me, peer_id, callbacks)
            .await
    }

    pub async fn open_group_chat(
        &self,
        group_id: &GroupId,
        callbacks: ConversationCallbacks,
    ) -> ConversationCleanup {
        let Some(me) = self.current_user() else {
            warn!(group_id = %group_id, "cannot open a group chat without a signed-in user");
            return ConversationCleanup::noop();
        };
        self.conversations.open_group(&me, group_id, callbacks).await
    }

    pub async fn send_broadcast(
        &self,
        chat_type: ChatType,
        id: &str,
        event: &str,
        payload: Value,
    ) -> bool {
        let Some(me) = self.current_user() else {
            warn!(event, "cannot broadcast without a signed-in user");
            return false;
        };
        self.conversations
            .send_broadcast(&me, chat_type, id, event, payload)
            .await
    }

    pub async fn send_typing_indicator(&self, chat_type: ChatType, id: &str, is_typing: bool) -> bool {
        let Some(me) = self.current_user() else {
            warn!("cannot send a typing indicator without a signed-in user");
            return false;
        };
        self.conversations
            .send_typing_indicator(&me, chat_type, id, is_typing)
            .await
    }

    pub async fn track_status(&self, payload: Value) -> TrackStatus {
        self.registry.track_status(payload).await
    }

    pub async fn untrack_status(&self) -> TrackStatus {
        self.registry.untrack_status().await
    }

    pub fn is_user_online(&self, user_id: &UserId) -> bool {
        self.presence.is_online(user_id)
    }

    pub fn get_group_member_presence(
        &self,
        member_ids: &[UserId],
    ) -> std::collections::HashMap<UserId, bool> {
        self.presence.bulk_online_status(member_ids)
    }

    pub fn presence_state(&self) -> PresenceState {
        self.presence.snapshot()
    }

    pub fn online_users(&self) -> Vec<UserId> {
        self.presence.online_users()
    }

    pub fn watch_presence(&self) -> watch::Receiver<PresenceState> {
        self.presence.watch()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use anyhow::Result;
    use async_trait::async_trait;
    use shared::domain::UserId;

    use crate::{lock_unpoisoned, status::UserStatusUpdater};

    pub const ALICE: &str = "11111111-1111-4111-8111-111111111111";
    pub const BOB: &str = "22222222-2222-4222-8222-222222222222";
    pub const CAROL: &str = "33333333-3333-4333-8333-333333333333";

    /// Lets spawned status handlers and zero-delay tasks run to completion.
    pub async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    #[derive(Default)]
    pub struct RecordingStatusUpdater {
        calls: Mutex<Vec<(UserId, bool)>>,
    }

    impl RecordingStatusUpdater {
        pub fn calls(&self) -> Vec<(UserId, bool)> {
            lock_unpoisoned(&self.calls).clone()
        }
    }

    #[async_trait]
    impl UserStatusUpdater for RecordingStatusUpdater {
        async fn update_user_status(&self, user_id: &UserId, is_online: bool) -> Result<()> {
            lock_unpoisoned(&self.calls).push((user_id.clone(), is_online));
            Ok(())
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
