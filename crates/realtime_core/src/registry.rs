//! Presence and notification channels of the signed-in user.
//!
//! Every rebuild or teardown bumps an epoch. Status callbacks and retry
//! actions carry the epoch they were created under and do nothing once it is
//! stale, so a late timer can never resurrect channels that were torn down.

use std::sync::{Arc, Mutex, Weak};

use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use shared::{
    domain::UserId,
    protocol::{InitialPresence, NotificationEvent, RowChange, RowEvent},
};
use tracing::{debug, error, info, warn};

use crate::{
    backend::{
        ChannelBinding, ChannelConfig, ChannelEvent, ChannelHandle, PresenceEventKind,
        RealtimeBackend, RowChangeFilter, StatusCallback, SubscribeStatus, TrackStatus,
    },
    event_bus::EventBus,
    lock_unpoisoned,
    presence::PresenceCoordinator,
    reconnect::{ReconnectionSupervisor, RetryAction},
    status::{report_user_status, UserStatusUpdater},
};

pub const PRESENCE_CHANNEL: &str = "user_presence";

pub fn notification_channel_name(user_id: &UserId) -> String {
    format!("notifications_for_{user_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Presence,
    Notification,
    IndividualChat,
    GroupChat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Idle,
    Subscribing,
    Subscribed,
    Errored,
}

impl ChannelStatus {
    pub fn from_subscribe(status: SubscribeStatus) -> Self {
        match status {
            SubscribeStatus::Subscribed => ChannelStatus::Subscribed,
            SubscribeStatus::ChannelError | SubscribeStatus::TimedOut => ChannelStatus::Errored,
            SubscribeStatus::Closed => ChannelStatus::Idle,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDescriptor {
    pub name: String,
    pub kind: ChannelKind,
    pub status: ChannelStatus,
}

struct MainChannel {
    descriptor: ChannelDescriptor,
    handle: Arc<dyn ChannelHandle>,
}

#[derive(Default)]
struct MainChannels {
    user_id: Option<UserId>,
    epoch: u64,
    presence: Option<MainChannel>,
    notifications: Option<MainChannel>,
}

impl MainChannels {
    fn slot_mut(&mut self, kind: ChannelKind) -> Option<&mut MainChannel> {
        match kind {
            ChannelKind::Presence => self.presence.as_mut(),
            ChannelKind::Notification => self.notifications.as_mut(),
            ChannelKind::IndividualChat | ChannelKind::GroupChat => None,
        }
    }

    fn take_all(&mut self) -> Vec<MainChannel> {
        [self.presence.take(), self.notifications.take()]
            .into_iter()
            .flatten()
            .collect()
    }
}

pub struct ChannelRegistry {
    backend: Arc<dyn RealtimeBackend>,
    presence: Arc<PresenceCoordinator>,
    events: Arc<EventBus>,
    supervisor: Arc<ReconnectionSupervisor>,
    status_updater: Arc<dyn UserStatusUpdater>,
    /// Serialises rebuilds and teardowns so only one subscription attempt per
    /// channel name is in flight.
    cycle: tokio::sync::Mutex<()>,
    state: Mutex<MainChannels>,
}

impl ChannelRegistry {
    pub fn new(
        backend: Arc<dyn RealtimeBackend>,
        presence: Arc<PresenceCoordinator>,
        events: Arc<EventBus>,
        supervisor: Arc<ReconnectionSupervisor>,
        status_updater: Arc<dyn UserStatusUpdater>,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            presence,
            events,
            supervisor,
            status_updater,
            cycle: tokio::sync::Mutex::new(()),
            state: Mutex::new(MainChannels::default()),
        })
    }

    pub fn current_user(&self) -> Option<UserId> {
        lock_unpoisoned(&self.state).user_id.clone()
    }

    pub fn is_connected(&self) -> bool {
        lock_unpoisoned(&self.state)
            .presence
            .as_ref()
            .is_some_and(|channel| channel.descriptor.status == ChannelStatus::Subscribed)
    }

    pub fn descriptors(&self) -> Vec<ChannelDescriptor> {
        let state = lock_unpoisoned(&self.state);
        [state.presence.as_ref(), state.notifications.as_ref()]
            .into_iter()
            .flatten()
            .map(|channel| channel.descriptor.clone())
            .collect()
    }

    /// Replaces the presence and notification channels for `user_id`, or tears
    /// everything down when there is no user.
    pub async fn ensure_main_channels(self: &Arc<Self>, user_id: Option<UserId>) {
        let Some(user_id) = user_id else {
            self.teardown_all().await;
            return;
        };

        let _cycle = self.cycle.lock().await;
        let notification_name = notification_channel_name(&user_id);
        let (epoch, stale) = {
            let mut state = lock_unpoisoned(&self.state);
            state.epoch += 1;
            state.user_id = Some(user_id.clone());
            (state.epoch, state.take_all())
        };

        self.supervisor.cancel_pending(PRESENCE_CHANNEL);
        self.supervisor.cancel_pending(&notification_name);
        for channel in stale {
            self.remove_quietly(channel.handle).await;
        }

        info!(user_id = %user_id, epoch, "building presence and notification channels");

        let presence = self.backend.channel(
            PRESENCE_CHANNEL,
            ChannelConfig::with_presence_key(user_id.as_str()),
        );
        self.bind_presence(&presence);

        let notifications = self
            .backend
            .channel(&notification_name, ChannelConfig::default());
        self.bind_notifications(&notifications, &user_id);

        {
            let mut state = lock_unpoisoned(&self.state);
            state.presence = Some(MainChannel {
                descriptor: ChannelDescriptor {
                    name: PRESENCE_CHANNEL.to_string(),
                    kind: ChannelKind::Presence,
                    status: ChannelStatus::Subscribing,
                },
                handle: Arc::clone(&presence),
            });
            state.notifications = Some(MainChannel {
                descriptor: ChannelDescriptor {
                    name: notification_name.clone(),
                    kind: ChannelKind::Notification,
                    status: ChannelStatus::Subscribing,
                },
                handle: Arc::clone(&notifications),
            });
        }

        let presence_status = self.status_callback(ChannelKind::Presence, epoch);
        let notification_status = self.status_callback(ChannelKind::Notification, epoch);
        let (presence_result, notification_result) = futures::join!(
            presence.subscribe(Arc::clone(&presence_status)),
            notifications.subscribe(Arc::clone(&notification_status)),
        );
        if let Err(err) = presence_result {
            error!(channel = PRESENCE_CHANNEL, error = %err, "presence subscribe failed");
            presence_status(SubscribeStatus::ChannelError);
        }
        if let Err(err) = notification_result {
            error!(channel = %notification_name, error = %err, "notification subscribe failed");
            notification_status(SubscribeStatus::ChannelError);
        }
    }

    /// Removes every owned channel and marks the user offline. Safe to call
    /// repeatedly; a failing removal is logged and the rest still proceed.
    pub async fn teardown_all(&self) {
        self.teardown(true).await;
    }

    /// Removes every owned channel ahead of an immediate rebuild. The user's
    /// persisted online flag is left alone.
    pub async fn teardown_for_rebuild(&self) {
        self.teardown(false).await;
    }

    async fn teardown(&self, report_offline: bool) {
        let _cycle = self.cycle.lock().await;
        let (channels, user_id) = {
            let mut state = lock_unpoisoned(&self.state);
            state.epoch += 1;
            (state.take_all(), state.user_id.take())
        };

        self.supervisor.cancel_pending(PRESENCE_CHANNEL);
        if let Some(user_id) = &user_id {
            self.supervisor
                .cancel_pending(&notification_channel_name(user_id));
        }

        if channels.is_empty() && user_id.is_none() {
            debug!("teardown requested with nothing to tear down");
            return;
        }

        info!(channels = channels.len(), "tearing down main channels");
        for channel in channels {
            self.remove_quietly(channel.handle).await;
        }

        if let Some(user_id) = user_id.filter(|_| report_offline) {
            report_user_status(self.status_updater.as_ref(), &user_id, false).await;
        }
    }

    /// Tracks arbitrary presence metadata for the current user.
    pub async fn track_status(&self, payload: Value) -> TrackStatus {
        let Some(handle) = self.subscribed_presence() else {
            warn!("cannot track status without a subscribed presence channel");
            return TrackStatus::Error;
        };
        match handle.track(payload).await {
            Ok(status) => status,
            Err(err) => {
                warn!(channel = PRESENCE_CHANNEL, error = %err, "failed to track status");
                TrackStatus::Error
            }
        }
    }

    pub async fn untrack_status(&self) -> TrackStatus {
        let Some(handle) = self.subscribed_presence() else {
            warn!("cannot untrack status without a subscribed presence channel");
            return TrackStatus::Error;
        };
        match handle.untrack().await {
            Ok(status) => status,
            Err(err) => {
                warn!(channel = PRESENCE_CHANNEL, error = %err, "failed to untrack status");
                TrackStatus::Error
            }
        }
    }

    fn subscribed_presence(&self) -> Option<Arc<dyn ChannelHandle>> {
        lock_unpoisoned(&self.state)
            .presence
            .as_ref()
            .filter(|channel| channel.descriptor.status == ChannelStatus::Subscribed)
            .map(|channel| Arc::clone(&channel.handle))
    }

    async fn remove_quietly(&self, handle: Arc<dyn ChannelHandle>) {
        let name = handle.name().to_string();
        if let Err(err) = self.backend.remove_channel(handle).await {
            warn!(channel = %name, error = %err, "failed to remove channel; continuing");
        }
    }

    fn status_callback(self: &Arc<Self>, kind: ChannelKind, epoch: u64) -> StatusCallback {
        let registry = Arc::downgrade(self);
        Arc::new(move |status| {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                registry.handle_main_status(kind, epoch, status).await;
            });
        })
    }

    async fn handle_main_status(self: Arc<Self>, kind: ChannelKind, epoch: u64, status: SubscribeStatus) {
        let (name, handle, user_id) = {
            let mut state = lock_unpoisoned(&self.state);
            if state.epoch != epoch {
                debug!(?kind, %status, "ignoring status from a replaced channel");
                return;
            }
            let user_id = state.user_id.clone();
            let Some(channel) = state.slot_mut(kind) else {
                return;
            };
            channel.descriptor.status = ChannelStatus::from_subscribe(status);
            (
                channel.descriptor.name.clone(),
                Arc::clone(&channel.handle),
                user_id,
            )
        };

        match status {
            SubscribeStatus::Subscribed => {
                info!(channel = %name, "channel subscribed");
                self.supervisor.reset(&name);
                if kind == ChannelKind::Presence {
                    if let Some(user_id) = user_id {
                        self.announce_online(&handle, &user_id).await;
                    }
                }
            }
            SubscribeStatus::ChannelError | SubscribeStatus::TimedOut => {
                error!(channel = %name, %status, "main channel failed");
                let retry = self.rebuild_action(epoch);
                self.supervisor.on_channel_error(handle, Some(retry)).await;
            }
            SubscribeStatus::Closed => {
                debug!(channel = %name, "channel closed");
            }
        }
    }

    async fn announce_online(&self, handle: &Arc<dyn ChannelHandle>, user_id: &UserId) {
        let initial = InitialPresence {
            user_id: user_id.clone(),
            online_at: Utc::now(),
        };
        let payload = match serde_json::to_value(&initial) {
            Ok(payload) => payload,
            Err(err) => {
                error!(error = %err, "failed to encode initial presence");
                return;
            }
        };
        match handle.track(payload).await {
            Ok(TrackStatus::Ok) => {
                info!(user_id = %user_id, "initial presence tracked");
                report_user_status(self.status_updater.as_ref(), user_id, true).await;
            }
            Ok(status) => {
                warn!(user_id = %user_id, ?status, "initial presence not acknowledged");
            }
            Err(err) => {
                error!(user_id = %user_id, error = %err, "failed to track initial presence");
            }
        }
    }

    /// Rebuild scheduled by the supervisor. Skipped if something else already
    /// rebuilt or tore down the channels since the failure.
    fn rebuild_action(self: &Arc<Self>, epoch: u64) -> RetryAction {
        let registry: Weak<Self> = Arc::downgrade(self);
        Box::new(move || {
            async move {
                let Some(registry) = registry.upgrade() else {
                    return;
                };
                let user_id = {
                    let state = lock_unpoisoned(&registry.state);
                    if state.epoch != epoch {
                        debug!(epoch, current = state.epoch, "skipping retry for a stale epoch");
                        return;
                    }
                    state.user_id.clone()
                };
                if let Some(user_id) = user_id {
                    registry.ensure_main_channels(Some(user_id)).await;
                }
            }
            .boxed()
        })
    }

    fn bind_presence(&self, handle: &Arc<dyn ChannelHandle>) {
        let presence = Arc::clone(&self.presence);
        let callback = Arc::new(move |event: ChannelEvent| match event {
            ChannelEvent::PresenceSync(state) => presence.on_sync(state),
            ChannelEvent::PresenceJoin { key, new_presences } => {
                presence.on_join(&key, &new_presences)
            }
            ChannelEvent::PresenceLeave {
                key,
                left_presences,
            } => presence.on_leave(&key, &left_presences),
            _ => {}
        });
        for kind in [
            PresenceEventKind::Sync,
            PresenceEventKind::Join,
            PresenceEventKind::Leave,
        ] {
            handle.on(ChannelBinding::Presence(kind), callback.clone());
        }
    }

    fn bind_notifications(&self, handle: &Arc<dyn ChannelHandle>, user_id: &UserId) {
        for (filter, event, relevant) in notification_rules(user_id) {
            let events = Arc::clone(&self.events);
            let user_id = user_id.clone();
            handle.on(
                ChannelBinding::RowChange(filter),
                Arc::new(move |channel_event| {
                    let ChannelEvent::RowChange(change) = channel_event else {
                        return;
                    };
                    if relevant(&change, &user_id) {
                        events.emit(event.as_str(), &change);
                    }
                }),
            );
        }
    }
}

type Relevance = fn(&RowChange, &UserId) -> bool;

fn addressed_to_me(change: &RowChange, me: &UserId) -> bool {
    change.new_field("receiver_id") == Some(me.as_str())
}

fn sent_by_someone_else(change: &RowChange, me: &UserId) -> bool {
    change.new_field("sender_id") != Some(me.as_str())
}

fn involves_me(change: &RowChange, me: &UserId) -> bool {
    change.new_field("sender_id") == Some(me.as_str()) || addressed_to_me(change, me)
}

fn always(_: &RowChange, _: &UserId) -> bool {
    true
}

/// Row-change bindings of the notification channel and the event each one
/// raises on the bus.
fn notification_rules(user_id: &UserId) -> Vec<(RowChangeFilter, NotificationEvent, Relevance)> {
    vec![
        (
            RowChangeFilter::new(RowEvent::Insert, "messages")
                .with_filter(format!("receiver_id=eq.{user_id}")),
            NotificationEvent::NewMessage,
            addressed_to_me as Relevance,
        ),
        (
            RowChangeFilter::new(RowEvent::Insert, "group_chat_messages"),
            NotificationEvent::NewGroupMessage,
            sent_by_someone_else as Relevance,
        ),
        (
            RowChangeFilter::new(RowEvent::Insert, "group_chat_participants")
                .with_filter(format!("user_id=eq.{user_id}")),
            NotificationEvent::AddedToGroup,
            always as Relevance,
        ),
        (
            RowChangeFilter::new(RowEvent::All, "message_status"),
            NotificationEvent::MessageStatusUpdated,
            involves_me as Relevance,
        ),
        (
            RowChangeFilter::new(RowEvent::All, "group_message_status"),
            NotificationEvent::GroupMessageStatusUpdated,
            always as Relevance,
        ),
    ]
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
