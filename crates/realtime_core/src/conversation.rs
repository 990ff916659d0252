//! Per-conversation channels for one-to-one and group chats.
//!
//! A conversation channel is created when a chat view opens it and removed
//! through the returned [`ConversationCleanup`]. Opening a conversation that
//! is already open shares the existing channel and hands back a no-op
//! cleanup. A channel that errors is released and forgotten; it is created
//! again the next time the view opens it.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use serde_json::Value;
use shared::{
    domain::{ChatType, GroupId, UserId},
    protocol::{
        BroadcastEnvelope, TypingPayload, GROUP_UPDATE_EVENT, MESSAGE_EVENT,
        MESSAGE_STATUS_EVENT, MESSAGE_UPDATE_EVENT, TYPING_EVENT,
    },
};
use tracing::{debug, error, info, warn};

use crate::{
    backend::{
        ChannelBinding, ChannelConfig, ChannelEvent, ChannelHandle, RealtimeBackend,
        StatusCallback, SubscribeStatus,
    },
    lock_unpoisoned,
    reconnect::ReconnectionSupervisor,
    registry::{ChannelDescriptor, ChannelKind, ChannelStatus},
    timers::TimerRegistry,
};

pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_millis(3000);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub chat_type: ChatType,
    pub id: String,
}

impl ConversationKey {
    /// Both participants derive the same key regardless of argument order.
    pub fn individual(a: &UserId, b: &UserId) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        Self {
            chat_type: ChatType::Individual,
            id: format!("{low}_{high}"),
        }
    }

    pub fn group(group_id: &GroupId) -> Self {
        Self {
            chat_type: ChatType::Group,
            id: group_id.to_string(),
        }
    }

    /// Key for a send addressed by chat type and target id, where the target
    /// of an individual chat is the peer's user id.
    pub fn for_target(self_id: &UserId, chat_type: ChatType, id: &str) -> Self {
        match chat_type {
            ChatType::Individual => Self::individual(self_id, &UserId::new(id)),
            ChatType::Group => Self::group(&GroupId::new(id)),
        }
    }

    pub fn channel_name(&self) -> String {
        match self.chat_type {
            ChatType::Individual => format!("chat_{}", self.id),
            ChatType::Group => format!("group_chat_{}", self.id),
        }
    }

    pub fn kind(&self) -> ChannelKind {
        match self.chat_type {
            ChatType::Individual => ChannelKind::IndividualChat,
            ChatType::Group => ChannelKind::GroupChat,
        }
    }
}

pub type PayloadCallback = Arc<dyn Fn(Value) + Send + Sync>;
pub type TypingCallback = Arc<dyn Fn(UserId) + Send + Sync>;

/// Handlers a chat view supplies. Only supplied handlers get a binding.
#[derive(Clone, Default)]
pub struct ConversationCallbacks {
    pub on_message: Option<PayloadCallback>,
    pub on_message_update: Option<PayloadCallback>,
    pub on_message_status: Option<PayloadCallback>,
    pub on_group_update: Option<PayloadCallback>,
    pub on_typing: Option<TypingCallback>,
    pub on_typing_stopped: Option<TypingCallback>,
}

impl ConversationCallbacks {
    pub fn with_message(mut self, callback: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(callback));
        self
    }

    pub fn with_message_update(mut self, callback: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.on_message_update = Some(Arc::new(callback));
        self
    }

    pub fn with_message_status(mut self, callback: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.on_message_status = Some(Arc::new(callback));
        self
    }

    pub fn with_group_update(mut self, callback: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.on_group_update = Some(Arc::new(callback));
        self
    }

    pub fn with_typing(mut self, callback: impl Fn(UserId) + Send + Sync + 'static) -> Self {
        self.on_typing = Some(Arc::new(callback));
        self
    }

    pub fn with_typing_stopped(mut self, callback: impl Fn(UserId) + Send + Sync + 'static) -> Self {
        self.on_typing_stopped = Some(Arc::new(callback));
        self
    }
}

struct OpenConversation {
    generation: u64,
    key: ConversationKey,
    handle: Arc<dyn ChannelHandle>,
    status: ChannelStatus,
}

#[derive(Default)]
struct ConversationMap {
    next_generation: u64,
    open: HashMap<String, OpenConversation>,
}

pub struct ConversationChannelFactory {
    backend: Arc<dyn RealtimeBackend>,
    supervisor: Arc<ReconnectionSupervisor>,
    typing_timeout: Duration,
    channels: Mutex<ConversationMap>,
    /// Remote typing expiry, keyed by channel name and sender.
    typing_timers: TimerRegistry<(String, UserId)>,
    /// Automatic `typing: false` after our own typing indicator, per channel.
    outgoing_typing: TimerRegistry<String>,
}

impl ConversationChannelFactory {
    pub fn new(
        backend: Arc<dyn RealtimeBackend>,
        supervisor: Arc<ReconnectionSupervisor>,
        typing_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            supervisor,
            typing_timeout,
            channels: Mutex::new(ConversationMap::default()),
            typing_timers: TimerRegistry::new(),
            outgoing_typing: TimerRegistry::new(),
        })
    }

    pub async fn open_individual(
        self: &Arc<Self>,
        self_id: &UserId,
        peer_id: &UserId,
        callbacks: ConversationCallbacks,
    ) -> ConversationCleanup {
        let key = ConversationKey::individual(self_id, peer_id);
        self.open(self_id, key, Some(peer_id.clone()), callbacks).await
    }

    pub async fn open_group(
        self: &Arc<Self>,
        self_id: &UserId,
        group_id: &GroupId,
        callbacks: ConversationCallbacks,
    ) -> ConversationCleanup {
        self.open(self_id, ConversationKey::group(group_id), None, callbacks)
            .await
    }

    async fn open(
        self: &Arc<Self>,
        self_id: &UserId,
        key: ConversationKey,
        peer: Option<UserId>,
        callbacks: ConversationCallbacks,
    ) -> ConversationCleanup {
        let name = key.channel_name();
        let (handle, generation) = {
            let mut channels = lock_unpoisoned(&self.channels);
            if channels.open.contains_key(&name) {
                info!(channel = %name, "reusing open conversation channel");
                return ConversationCleanup::noop();
            }
            let handle = self.backend.channel(&name, ChannelConfig::default());
            channels.next_generation += 1;
            let generation = channels.next_generation;
            channels.open.insert(
                name.clone(),
                OpenConversation {
                    generation,
                    key: key.clone(),
                    handle: Arc::clone(&handle),
                    status: ChannelStatus::Subscribing,
                },
            );
            (handle, generation)
        };

        info!(channel = %name, chat_type = %key.chat_type, "opening conversation channel");
        self.bind_payloads(&handle, &key, &callbacks);
        self.bind_typing(&handle, self_id, &name, generation, peer, &callbacks);

        let on_status = self.status_callback(name.clone(), generation);
        if let Err(err) = handle.subscribe(Arc::clone(&on_status)).await {
            error!(channel = %name, error = %err, "conversation subscribe failed");
            on_status(SubscribeStatus::ChannelError);
        }

        ConversationCleanup {
            inner: Some(Arc::new(CleanupInner {
                factory: Arc::downgrade(self),
                name,
                generation,
                done: AtomicBool::new(false),
            })),
        }
    }

    fn bind_payloads(
        &self,
        handle: &Arc<dyn ChannelHandle>,
        key: &ConversationKey,
        callbacks: &ConversationCallbacks,
    ) {
        let mut bindings = vec![
            (MESSAGE_EVENT, callbacks.on_message.clone()),
            (MESSAGE_UPDATE_EVENT, callbacks.on_message_update.clone()),
            (MESSAGE_STATUS_EVENT, callbacks.on_message_status.clone()),
        ];
        if key.chat_type == ChatType::Group {
            bindings.push((GROUP_UPDATE_EVENT, callbacks.on_group_update.clone()));
        }
        for (event, callback) in bindings {
            let Some(callback) = callback else {
                continue;
            };
            handle.on(
                ChannelBinding::Broadcast(event.to_string()),
                Arc::new(move |channel_event| {
                    if let ChannelEvent::Broadcast { payload, .. } = channel_event {
                        callback(payload);
                    }
                }),
            );
        }
    }

    fn bind_typing(
        self: &Arc<Self>,
        handle: &Arc<dyn ChannelHandle>,
        self_id: &UserId,
        name: &str,
        generation: u64,
        peer: Option<UserId>,
        callbacks: &ConversationCallbacks,
    ) {
        if callbacks.on_typing.is_none() && callbacks.on_typing_stopped.is_none() {
            return;
        }
        let factory = Arc::downgrade(self);
        let self_id = self_id.clone();
        let name = name.to_string();
        let on_typing = callbacks.on_typing.clone();
        let on_stopped = callbacks.on_typing_stopped.clone();
        handle.on(
            ChannelBinding::Broadcast(TYPING_EVENT.to_string()),
            Arc::new(move |event| {
                let ChannelEvent::Broadcast { payload, .. } = event else {
                    return;
                };
                let typing: TypingPayload = match serde_json::from_value(payload) {
                    Ok(typing) => typing,
                    Err(err) => {
                        debug!(channel = %name, error = %err, "ignoring malformed typing payload");
                        return;
                    }
                };
                // One-to-one typing may omit the sender: it can only be the peer.
                let Some(sender) = typing.sender_id.or_else(|| peer.clone()) else {
                    return;
                };
                if sender == self_id {
                    return;
                }
                let Some(factory) = factory.upgrade() else {
                    return;
                };
                factory.on_remote_typing(
                    &name,
                    generation,
                    sender,
                    typing.typing,
                    on_typing.as_ref(),
                    on_stopped.clone(),
                );
            }),
        );
    }

    fn on_remote_typing(
        self: &Arc<Self>,
        name: &str,
        generation: u64,
        sender: UserId,
        typing: bool,
        on_typing: Option<&TypingCallback>,
        on_stopped: Option<TypingCallback>,
    ) {
        let timer_key = (name.to_string(), sender.clone());
        if !typing {
            self.typing_timers.cancel(&timer_key);
            if let Some(stopped) = on_stopped {
                stopped(sender);
            }
            return;
        }

        if let Some(started) = on_typing {
            started(sender.clone());
        }
        let factory = Arc::downgrade(self);
        let name = name.to_string();
        self.typing_timers
            .schedule(timer_key, self.typing_timeout, async move {
                let Some(factory) = factory.upgrade() else {
                    return;
                };
                if !factory.is_current(&name, generation) {
                    debug!(channel = %name, "typing expiry for a closed conversation");
                    return;
                }
                if let Some(stopped) = on_stopped {
                    stopped(sender);
                }
            });
    }

    fn status_callback(self: &Arc<Self>, name: String, generation: u64) -> StatusCallback {
        let factory = Arc::downgrade(self);
        Arc::new(move |status| {
            let Some(factory) = factory.upgrade() else {
                return;
            };
            let name = name.clone();
            tokio::spawn(async move {
                factory.handle_status(name, generation, status).await;
            });
        })
    }

    async fn handle_status(self: Arc<Self>, name: String, generation: u64, status: SubscribeStatus) {
        let failed = {
            let mut channels = lock_unpoisoned(&self.channels);
            let Some(conversation) = channels
                .open
                .get_mut(&name)
                .filter(|conversation| conversation.generation == generation)
            else {
                debug!(channel = %name, %status, "status for a closed conversation");
                return;
            };
            conversation.status = ChannelStatus::from_subscribe(status);
            if status.is_failure() {
                channels.open.remove(&name).map(|conversation| conversation.handle)
            } else {
                None
            }
        };

        match status {
            SubscribeStatus::Subscribed => {
                info!(channel = %name, "conversation channel subscribed");
                self.supervisor.reset(&name);
            }
            SubscribeStatus::ChannelError | SubscribeStatus::TimedOut => {
                warn!(channel = %name, %status, "conversation channel failed; it will be recreated on next open");
                self.clear_timers(&name);
                if let Some(handle) = failed {
                    self.supervisor.on_channel_error(handle, None).await;
                }
            }
            SubscribeStatus::Closed => {
                debug!(channel = %name, "conversation channel closed");
            }
        }
    }

    fn is_current(&self, name: &str, generation: u64) -> bool {
        lock_unpoisoned(&self.channels)
            .open
            .get(name)
            .is_some_and(|conversation| conversation.generation == generation)
    }

    fn lookup(&self, name: &str) -> Option<(u64, Arc<dyn ChannelHandle>)> {
        lock_unpoisoned(&self.channels)
            .open
            .get(name)
            .map(|conversation| (conversation.generation, Arc::clone(&conversation.handle)))
    }

    fn clear_timers(&self, name: &str) {
        self.typing_timers.cancel_where(|(channel, _)| channel == name);
        self.outgoing_typing.cancel(&name.to_string());
    }

    async fn close_generation(&self, name: &str, generation: u64) {
        let removed = {
            let mut channels = lock_unpoisoned(&self.channels);
            match channels.open.get(name) {
                Some(conversation) if conversation.generation == generation => {
                    channels.open.remove(name)
                }
                Some(_) => {
                    debug!(channel = %name, "conversation was reopened; leaving it alone");
                    return;
                }
                None => None,
            }
        };

        self.clear_timers(name);
        self.supervisor.reset(name);
        if let Some(conversation) = removed {
            info!(channel = %name, "closing conversation channel");
            if let Err(err) = self.backend.remove_channel(conversation.handle).await {
                warn!(channel = %name, error = %err, "failed to remove conversation channel");
            }
        }
    }

    /// Closes every open conversation and cancels all typing timers.
    pub async fn close_all(&self) {
        let closed: Vec<(String, OpenConversation)> =
            lock_unpoisoned(&self.channels).open.drain().collect();
        self.typing_timers.cancel_all();
        self.outgoing_typing.cancel_all();
        for (name, conversation) in closed {
            self.supervisor.reset(&name);
            if let Err(err) = self.backend.remove_channel(conversation.handle).await {
                warn!(channel = %name, error = %err, "failed to remove conversation channel");
            }
        }
    }

    /// Sends a broadcast on an open conversation. Dropped with a warning when
    /// the conversation is not open.
    pub async fn send_broadcast(
        &self,
        self_id: &UserId,
        chat_type: ChatType,
        id: &str,
        event: &str,
        payload: Value,
    ) -> bool {
        let name = ConversationKey::for_target(self_id, chat_type, id).channel_name();
        let Some((_, handle)) = self.lookup(&name) else {
            warn!(channel = %name, event, "no open conversation channel; dropping broadcast");
            return false;
        };
        send_on(&handle, BroadcastEnvelope::new(event, payload)).await
    }

    /// Broadcasts our typing state. Starting to type also schedules an
    /// automatic stop after the typing timeout, replacing an earlier one.
    pub async fn send_typing_indicator(
        self: &Arc<Self>,
        self_id: &UserId,
        chat_type: ChatType,
        id: &str,
        is_typing: bool,
    ) -> bool {
        let name = ConversationKey::for_target(self_id, chat_type, id).channel_name();
        let Some((generation, handle)) = self.lookup(&name) else {
            warn!(channel = %name, "no open conversation channel for typing indicator");
            return false;
        };
        self.outgoing_typing.cancel(&name);

        let payload = TypingPayload {
            sender_id: Some(self_id.clone()),
            chat_id: id.to_string(),
            chat_type: Some(chat_type),
            typing: is_typing,
        };
        let sent = match typing_envelope(&payload) {
            Some(envelope) => send_on(&handle, envelope).await,
            None => false,
        };

        if is_typing {
            let stop = TypingPayload {
                typing: false,
                ..payload
            };
            let factory = Arc::downgrade(self);
            let channel = name.clone();
            self.outgoing_typing
                .schedule(name, self.typing_timeout, async move {
                    let Some(factory) = factory.upgrade() else {
                        return;
                    };
                    let Some((current, handle)) = factory.lookup(&channel) else {
                        return;
                    };
                    if current != generation {
                        return;
                    }
                    if let Some(envelope) = typing_envelope(&stop) {
                        send_on(&handle, envelope).await;
                    }
                });
        }
        sent
    }

    pub fn is_open(&self, name: &str) -> bool {
        lock_unpoisoned(&self.channels).open.contains_key(name)
    }

    pub fn status(&self, name: &str) -> Option<ChannelStatus> {
        lock_unpoisoned(&self.channels)
            .open
            .get(name)
            .map(|conversation| conversation.status)
    }

    pub fn open_conversations(&self) -> Vec<ConversationKey> {
        lock_unpoisoned(&self.channels)
            .open
            .values()
            .map(|conversation| conversation.key.clone())
            .collect()
    }

    /// Descriptors of the open conversation channels, sorted by name.
    pub fn descriptors(&self) -> Vec<ChannelDescriptor> {
        let mut descriptors: Vec<ChannelDescriptor> = lock_unpoisoned(&self.channels)
            .open
            .iter()
            .map(|(name, conversation)| ChannelDescriptor {
                name: name.clone(),
                kind: conversation.key.kind(),
                status: conversation.status,
            })
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    pub fn open_channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock_unpoisoned(&self.channels).open.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn pending_typing_timers(&self) -> usize {
        self.typing_timers.pending_count() + self.outgoing_typing.pending_count()
    }
}

fn typing_envelope(payload: &TypingPayload) -> Option<BroadcastEnvelope> {
    match serde_json::to_value(payload) {
        Ok(value) => Some(BroadcastEnvelope::new(TYPING_EVENT, value)),
        Err(err) => {
            error!(error = %err, "failed to encode typing payload");
            None
        }
    }
}

async fn send_on(handle: &Arc<dyn ChannelHandle>, envelope: BroadcastEnvelope) -> bool {
    let event = envelope.event.clone();
    match handle.send(envelope).await {
        Ok(()) => true,
        Err(err) => {
            warn!(channel = %handle.name(), event = %event, error = %err, "broadcast failed");
            false
        }
    }
}

struct CleanupInner {
    factory: Weak<ConversationChannelFactory>,
    name: String,
    generation: u64,
    done: AtomicBool,
}

/// Closes the conversation opened by the call that returned it. Idempotent,
/// and safe to run while the channel is still subscribing.
#[derive(Clone)]
pub struct ConversationCleanup {
    inner: Option<Arc<CleanupInner>>,
}

impl ConversationCleanup {
    pub fn noop() -> Self {
        Self { inner: None }
    }

    pub fn is_noop(&self) -> bool {
        self.inner.is_none()
    }

    pub fn channel_name(&self) -> Option<&str> {
        self.inner.as_deref().map(|inner| inner.name.as_str())
    }

    pub async fn cleanup(&self) {
        let Some(inner) = &self.inner else {
            return;
        };
        if inner.done.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(factory) = inner.factory.upgrade() else {
            return;
        };
        factory.close_generation(&inner.name, inner.generation).await;
    }
}

#[cfg(test)]
#[path = "tests/conversation_tests.rs"]
mod tests;
