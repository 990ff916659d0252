//! In-memory realtime backend.
//!
//! A [`LoopbackHub`] plays the role of the hosted service; every
//! [`LoopbackBackend`] connected to it behaves like one client socket.
//! Presence, broadcast and row-change delivery follow the hosted service's
//! observable behavior, and the hub exposes fault injection plus counters so
//! lifecycle behavior can be exercised without a network.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use shared::{
    domain::UserId,
    protocol::{BroadcastEnvelope, PresenceMeta, PresenceState, RowChange},
};
use tracing::debug;

use crate::{
    backend::{
        BindingTable, ChannelBinding, ChannelConfig, ChannelEvent, ChannelHandle, EventCallback,
        RealtimeBackend, StatusCallback, SubscribeStatus, TrackStatus,
    },
    error::RealtimeError,
    lock_unpoisoned,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Joined,
    Removed,
}

#[derive(Default)]
struct HubState {
    subscribers: HashMap<String, Vec<Arc<LoopbackChannel>>>,
    presence: HashMap<String, PresenceState>,
    subscribe_failures: HashMap<String, u32>,
    removal_failures: HashSet<String>,
    created: HashMap<String, u32>,
    subscribed: HashMap<String, u32>,
    removed: HashMap<String, u32>,
}

#[derive(Default)]
pub struct LoopbackHub {
    state: Mutex<HubState>,
    next_id: AtomicU64,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connect(self: &Arc<Self>) -> Arc<LoopbackBackend> {
        Arc::new(LoopbackBackend {
            hub: Arc::clone(self),
            access_token: Mutex::new(None),
            open: Mutex::new(Vec::new()),
        })
    }

    /// The next `times` subscriptions to `name` report `CHANNEL_ERROR`.
    pub fn fail_subscribe(&self, name: &str, times: u32) {
        lock_unpoisoned(&self.state)
            .subscribe_failures
            .insert(name.to_string(), times);
    }

    pub fn fail_removal(&self, name: &str, enabled: bool) {
        let mut state = lock_unpoisoned(&self.state);
        if enabled {
            state.removal_failures.insert(name.to_string());
        } else {
            state.removal_failures.remove(name);
        }
    }

    /// Drops every live subscription to `name` with `CHANNEL_ERROR`, as a
    /// server-side channel crash would. Returns the number of affected handles.
    pub fn break_channel(&self, name: &str) -> usize {
        let (broken, remaining, left) = {
            let mut state = lock_unpoisoned(&self.state);
            let broken = state.subscribers.remove(name).unwrap_or_default();
            let mut left = Vec::new();
            if let Some(presence) = state.presence.get_mut(name) {
                for channel in &broken {
                    left.extend(remove_presence_refs(presence, &channel.presence_ref()));
                }
            }
            let remaining = state.presence.get(name).cloned().unwrap_or_default();
            (broken, remaining, left)
        };
        for channel in &broken {
            channel.set_phase(Phase::Idle);
            channel.report(SubscribeStatus::ChannelError);
        }
        debug!(channel = %name, broken = broken.len(), left = left.len(), remaining = remaining.len(), "loopback channel broken");
        broken.len()
    }

    /// Delivers a row change to every subscribed channel with a matching binding.
    pub fn emit_row_change(&self, change: RowChange) -> usize {
        let targets: Vec<Arc<LoopbackChannel>> = lock_unpoisoned(&self.state)
            .subscribers
            .values()
            .flatten()
            .cloned()
            .collect();
        let event = ChannelEvent::RowChange(change);
        targets
            .iter()
            .map(|channel| channel.bindings.dispatch(&event))
            .sum()
    }

    pub fn presence_state(&self, name: &str) -> PresenceState {
        lock_unpoisoned(&self.state)
            .presence
            .get(name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn created_count(&self, name: &str) -> u32 {
        count(&lock_unpoisoned(&self.state).created, name)
    }

    pub fn subscribe_count(&self, name: &str) -> u32 {
        count(&lock_unpoisoned(&self.state).subscribed, name)
    }

    pub fn removed_count(&self, name: &str) -> u32 {
        count(&lock_unpoisoned(&self.state).removed, name)
    }

    pub fn subscriber_count(&self, name: &str) -> usize {
        lock_unpoisoned(&self.state)
            .subscribers
            .get(name)
            .map(Vec::len)
            .unwrap_or(0)
    }

    pub fn live_channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock_unpoisoned(&self.state)
            .subscribers
            .iter()
            .filter(|(_, subscribers)| !subscribers.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    fn record_created(&self, name: &str) -> u64 {
        *lock_unpoisoned(&self.state)
            .created
            .entry(name.to_string())
            .or_insert(0) += 1;
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn join(&self, channel: &Arc<LoopbackChannel>) -> Option<PresenceState> {
        let mut state = lock_unpoisoned(&self.state);
        if let Some(remaining) = state.subscribe_failures.get_mut(&channel.name) {
            if *remaining > 0 {
                *remaining -= 1;
                return None;
            }
        }
        *state.subscribed.entry(channel.name.clone()).or_insert(0) += 1;
        let subscribers = state.subscribers.entry(channel.name.clone()).or_default();
        if !subscribers.iter().any(|existing| existing.id == channel.id) {
            subscribers.push(Arc::clone(channel));
        }
        Some(state.presence.get(&channel.name).cloned().unwrap_or_default())
    }

    fn leave(&self, channel: &LoopbackChannel) -> Result<()> {
        let (targets, left, snapshot) = {
            let mut state = lock_unpoisoned(&self.state);
            if state.removal_failures.contains(&channel.name) {
                return Err(RealtimeError::Injected(channel.name.clone()).into());
            }
            *state.removed.entry(channel.name.clone()).or_insert(0) += 1;
            if let Some(subscribers) = state.subscribers.get_mut(&channel.name) {
                subscribers.retain(|existing| existing.id != channel.id);
                if subscribers.is_empty() {
                    state.subscribers.remove(&channel.name);
                }
            }
            let left = match state.presence.get_mut(&channel.name) {
                Some(presence) => remove_presence_refs(presence, &channel.presence_ref()),
                None => Vec::new(),
            };
            let snapshot = state.presence.get(&channel.name).cloned().unwrap_or_default();
            let targets = state
                .subscribers
                .get(&channel.name)
                .cloned()
                .unwrap_or_default();
            (targets, left, snapshot)
        };

        if !left.is_empty() {
            fan_out_presence(&targets, left, Vec::new(), snapshot);
        }
        Ok(())
    }

    fn track(&self, channel: &LoopbackChannel, key: UserId, meta: PresenceMeta) {
        let (targets, snapshot) = {
            let mut state = lock_unpoisoned(&self.state);
            let presence = state.presence.entry(channel.name.clone()).or_default();
            remove_presence_refs(presence, &channel.presence_ref());
            presence.entry(key.clone()).or_default().push(meta.clone());
            let snapshot = presence.clone();
            let targets = state
                .subscribers
                .get(&channel.name)
                .cloned()
                .unwrap_or_default();
            (targets, snapshot)
        };
        fan_out_presence(&targets, Vec::new(), vec![(key, vec![meta])], snapshot);
    }

    fn untrack(&self, channel: &LoopbackChannel) {
        let (targets, left, snapshot) = {
            let mut state = lock_unpoisoned(&self.state);
            let left = match state.presence.get_mut(&channel.name) {
                Some(presence) => remove_presence_refs(presence, &channel.presence_ref()),
                None => Vec::new(),
            };
            let snapshot = state.presence.get(&channel.name).cloned().unwrap_or_default();
            let targets = state
                .subscribers
                .get(&channel.name)
                .cloned()
                .unwrap_or_default();
            (targets, left, snapshot)
        };
        if !left.is_empty() {
            fan_out_presence(&targets, left, Vec::new(), snapshot);
        }
    }

    fn broadcast(&self, sender: &LoopbackChannel, envelope: BroadcastEnvelope) -> usize {
        let targets: Vec<Arc<LoopbackChannel>> = lock_unpoisoned(&self.state)
            .subscribers
            .get(&sender.name)
            .map(|subscribers| {
                subscribers
                    .iter()
                    .filter(|target| target.id != sender.id || sender.config.broadcast_self)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let event = ChannelEvent::Broadcast {
            event: envelope.event,
            payload: envelope.payload,
        };
        for target in &targets {
            target.bindings.dispatch(&event);
        }
        targets.len()
    }
}

fn count(map: &HashMap<String, u32>, name: &str) -> u32 {
    map.get(name).copied().unwrap_or(0)
}

fn remove_presence_refs(
    presence: &mut PresenceState,
    presence_ref: &str,
) -> Vec<(UserId, Vec<PresenceMeta>)> {
    let mut left = Vec::new();
    for (key, metas) in presence.iter_mut() {
        let (gone, kept): (Vec<PresenceMeta>, Vec<PresenceMeta>) = metas
            .drain(..)
            .partition(|meta| meta.presence_ref.as_deref() == Some(presence_ref));
        *metas = kept;
        if !gone.is_empty() {
            left.push((key.clone(), gone));
        }
    }
    presence.retain(|_, metas| !metas.is_empty());
    left
}

fn fan_out_presence(
    targets: &[Arc<LoopbackChannel>],
    left: Vec<(UserId, Vec<PresenceMeta>)>,
    joined: Vec<(UserId, Vec<PresenceMeta>)>,
    snapshot: PresenceState,
) {
    let mut events: Vec<ChannelEvent> = Vec::new();
    for (key, new_presences) in joined {
        events.push(ChannelEvent::PresenceJoin { key, new_presences });
    }
    for (key, left_presences) in left {
        events.push(ChannelEvent::PresenceLeave { key, left_presences });
    }
    events.push(ChannelEvent::PresenceSync(snapshot));
    for target in targets {
        for event in &events {
            target.bindings.dispatch(event);
        }
    }
}

pub struct LoopbackBackend {
    hub: Arc<LoopbackHub>,
    access_token: Mutex<Option<String>>,
    open: Mutex<Vec<Arc<LoopbackChannel>>>,
}

impl LoopbackBackend {
    pub fn hub(&self) -> &Arc<LoopbackHub> {
        &self.hub
    }

    pub fn access_token(&self) -> Option<String> {
        lock_unpoisoned(&self.access_token).clone()
    }

    /// Handles created through this client that were not removed yet.
    pub fn open_channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock_unpoisoned(&self.open)
            .iter()
            .map(|channel| channel.name.clone())
            .collect();
        names.sort();
        names
    }
}

#[async_trait]
impl RealtimeBackend for LoopbackBackend {
    fn channel(&self, name: &str, config: ChannelConfig) -> Arc<dyn ChannelHandle> {
        let id = self.hub.record_created(name);
        let channel = Arc::new_cyclic(|me| LoopbackChannel {
            id,
            name: name.to_string(),
            config,
            hub: Arc::downgrade(&self.hub),
            me: me.clone(),
            bindings: BindingTable::default(),
            phase: Mutex::new(Phase::Idle),
            on_status: Mutex::new(None),
        });
        lock_unpoisoned(&self.open).push(Arc::clone(&channel));
        channel
    }

    async fn remove_channel(&self, handle: Arc<dyn ChannelHandle>) -> Result<()> {
        handle.unsubscribe().await?;
        lock_unpoisoned(&self.open).retain(|channel| !channel.is_removed());
        Ok(())
    }

    async fn set_auth(&self, access_token: &str) -> Result<()> {
        *lock_unpoisoned(&self.access_token) = Some(access_token.to_string());
        Ok(())
    }
}

pub struct LoopbackChannel {
    id: u64,
    name: String,
    config: ChannelConfig,
    hub: Weak<LoopbackHub>,
    me: Weak<LoopbackChannel>,
    bindings: BindingTable,
    phase: Mutex<Phase>,
    on_status: Mutex<Option<StatusCallback>>,
}

impl LoopbackChannel {
    fn presence_ref(&self) -> String {
        format!("loopback-{}", self.id)
    }

    fn phase(&self) -> Phase {
        *lock_unpoisoned(&self.phase)
    }

    fn set_phase(&self, phase: Phase) {
        *lock_unpoisoned(&self.phase) = phase;
    }

    fn is_removed(&self) -> bool {
        self.phase() == Phase::Removed
    }

    fn report(&self, status: SubscribeStatus) {
        let callback = lock_unpoisoned(&self.on_status).clone();
        if let Some(callback) = callback {
            callback(status);
        }
    }

    fn hub(&self) -> Result<Arc<LoopbackHub>> {
        self.hub
            .upgrade()
            .ok_or_else(|| RealtimeError::TransportClosed.into())
    }

    fn ensure_joined(&self) -> Result<()> {
        if self.phase() != Phase::Joined {
            return Err(RealtimeError::NotSubscribed(self.name.clone()).into());
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelHandle for LoopbackChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn on(&self, binding: ChannelBinding, callback: EventCallback) {
        self.bindings.add(binding, callback);
    }

    async fn subscribe(&self, on_status: StatusCallback) -> Result<()> {
        *lock_unpoisoned(&self.on_status) = Some(Arc::clone(&on_status));
        if self.is_removed() {
            on_status(SubscribeStatus::Closed);
            return Err(RealtimeError::ChannelRemoved {
                name: self.name.clone(),
            }
            .into());
        }

        let hub = self.hub()?;
        let me = self.me.upgrade().ok_or(RealtimeError::TransportClosed)?;
        match hub.join(&me) {
            Some(snapshot) => {
                self.set_phase(Phase::Joined);
                on_status(SubscribeStatus::Subscribed);
                if self.bindings.has_presence_bindings() {
                    self.bindings.dispatch(&ChannelEvent::PresenceSync(snapshot));
                }
            }
            None => {
                self.set_phase(Phase::Idle);
                on_status(SubscribeStatus::ChannelError);
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<()> {
        if self.is_removed() {
            return Ok(());
        }
        let hub = self.hub()?;
        hub.leave(self)?;
        self.set_phase(Phase::Removed);
        self.bindings.clear();
        lock_unpoisoned(&self.on_status).take();
        Ok(())
    }

    async fn track(&self, payload: Value) -> Result<TrackStatus> {
        self.ensure_joined()?;
        let key = match &self.config.presence_key {
            Some(key) => UserId::new(key.clone()),
            None => UserId::new(self.presence_ref()),
        };
        let mut meta: PresenceMeta = serde_json::from_value(payload).unwrap_or_default();
        meta.presence_ref = Some(self.presence_ref());
        self.hub()?.track(self, key, meta);
        Ok(TrackStatus::Ok)
    }

    async fn untrack(&self) -> Result<TrackStatus> {
        self.ensure_joined()?;
        self.hub()?.untrack(self);
        Ok(TrackStatus::Ok)
    }

    async fn send(&self, message: BroadcastEnvelope) -> Result<()> {
        self.ensure_joined()?;
        let delivered = self.hub()?.broadcast(self, message);
        debug!(channel = %self.name, delivered, "loopback broadcast");
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/loopback_tests.rs"]
mod tests;
