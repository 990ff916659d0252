//! Websocket backend speaking the Phoenix channel framing of hosted realtime
//! services.
//!
//! One socket is shared by every channel and opened lazily on the first
//! subscribe. A reader task routes frames to channels by topic, a writer task
//! drains the outgoing queue and a heartbeat task keeps the socket alive. When
//! the socket drops, every joined channel is told `CHANNEL_ERROR` and forgotten;
//! the next subscribe reconnects.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use shared::{
    domain::UserId,
    protocol::{BroadcastEnvelope, PresenceMeta, PresenceState, RowChange},
};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    backend::{
        BindingTable, ChannelBinding, ChannelConfig, ChannelEvent, ChannelHandle, EventCallback,
        RealtimeBackend, StatusCallback, SubscribeStatus, TrackStatus,
    },
    config::RealtimeSettings,
    error::RealtimeError,
    lock_unpoisoned,
};

pub const PROTOCOL_VSN: &str = "1.0.0";
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(10);
const PHOENIX_TOPIC: &str = "phoenix";

const PHX_JOIN: &str = "phx_join";
const PHX_LEAVE: &str = "phx_leave";
const PHX_REPLY: &str = "phx_reply";
const PHX_ERROR: &str = "phx_error";
const PHX_CLOSE: &str = "phx_close";
const HEARTBEAT: &str = "heartbeat";
const ACCESS_TOKEN: &str = "access_token";
const BROADCAST: &str = "broadcast";
const PRESENCE: &str = "presence";
const PRESENCE_STATE: &str = "presence_state";
const PRESENCE_DIFF: &str = "presence_diff";
const POSTGRES_CHANGES: &str = "postgres_changes";

/// One Phoenix frame in the JSON (v1) serializer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhoenixMessage {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub msg_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_ref: Option<String>,
}

pub fn channel_topic(name: &str) -> String {
    format!("realtime:{name}")
}

/// Websocket URL with the api key and protocol version attached. `http(s)`
/// base URLs are mapped to `ws(s)`.
pub fn socket_endpoint(realtime_url: &str, api_key: &str) -> Result<Url> {
    let mut url = Url::parse(realtime_url)
        .with_context(|| format!("invalid realtime url: {realtime_url}"))?;
    let scheme = match url.scheme() {
        "http" => Some("ws"),
        "https" => Some("wss"),
        "ws" | "wss" => None,
        other => return Err(anyhow!("unsupported realtime url scheme: {other}")),
    };
    if let Some(scheme) = scheme {
        url.set_scheme(scheme)
            .map_err(|()| anyhow!("cannot switch {realtime_url} to {scheme}"))?;
    }
    url.query_pairs_mut()
        .append_pair("apikey", api_key)
        .append_pair("vsn", PROTOCOL_VSN);
    Ok(url)
}

/// `phx_join` payload describing the bindings registered before subscribe.
fn join_payload(config: &ChannelConfig, bindings: &BindingTable, access_token: Option<&str>) -> Value {
    let postgres_changes: Vec<Value> = bindings
        .row_change_filters()
        .into_iter()
        .map(|filter| {
            let mut entry = json!({
                "event": filter.event.as_str(),
                "schema": filter.schema,
                "table": filter.table,
            });
            if let Some(expr) = filter.filter {
                entry["filter"] = Value::String(expr);
            }
            entry
        })
        .collect();
    let mut payload = json!({
        "config": {
            "broadcast": { "self": config.broadcast_self, "ack": config.broadcast_ack },
            "presence": { "key": config.presence_key.clone().unwrap_or_default() },
            "postgres_changes": postgres_changes,
        }
    });
    if let Some(token) = access_token {
        payload[ACCESS_TOKEN] = Value::String(token.to_string());
    }
    payload
}

/// Converts a wire presence entry (`{"metas": [...]}`) into metas, moving
/// `phx_ref` into `presence_ref`.
fn decode_metas(entry: &Value) -> Vec<PresenceMeta> {
    let Some(metas) = entry.get("metas").and_then(Value::as_array) else {
        return Vec::new();
    };
    metas
        .iter()
        .filter_map(|raw| {
            let mut object: Map<String, Value> = raw.as_object()?.clone();
            let phx_ref = object
                .remove("phx_ref")
                .and_then(|value| value.as_str().map(str::to_string));
            object.remove("phx_ref_prev");
            let mut meta: PresenceMeta = serde_json::from_value(Value::Object(object)).ok()?;
            if meta.presence_ref.is_none() {
                meta.presence_ref = phx_ref;
            }
            Some(meta)
        })
        .collect()
}

fn decode_presence_map(payload: &Value) -> PresenceState {
    payload
        .as_object()
        .map(|entries| {
            entries
                .iter()
                .map(|(key, entry)| (UserId::new(key.clone()), decode_metas(entry)))
                .filter(|(_, metas)| !metas.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Replaces the local map with a full `presence_state` snapshot and returns
/// the join/leave/sync events it implies.
pub fn apply_presence_state(state: &mut PresenceState, payload: &Value) -> Vec<ChannelEvent> {
    let incoming = decode_presence_map(payload);
    let mut events = Vec::new();
    for (key, metas) in &incoming {
        let known: Vec<&str> = state
            .get(key)
            .map(|existing| existing.iter().filter_map(|m| m.presence_ref.as_deref()).collect())
            .unwrap_or_default();
        let new_presences: Vec<PresenceMeta> = metas
            .iter()
            .filter(|meta| meta.presence_ref.as_deref().map_or(true, |r| !known.contains(&r)))
            .cloned()
            .collect();
        if !new_presences.is_empty() {
            events.push(ChannelEvent::PresenceJoin {
                key: key.clone(),
                new_presences,
            });
        }
    }
    for (key, metas) in state.iter() {
        if !incoming.contains_key(key) {
            events.push(ChannelEvent::PresenceLeave {
                key: key.clone(),
                left_presences: metas.clone(),
            });
        }
    }
    *state = incoming;
    events.push(ChannelEvent::PresenceSync(state.clone()));
    events
}

/// Applies a `presence_diff` (`{"joins": {...}, "leaves": {...}}`).
pub fn apply_presence_diff(state: &mut PresenceState, payload: &Value) -> Vec<ChannelEvent> {
    let joins = decode_presence_map(payload.get("joins").unwrap_or(&Value::Null));
    let leaves = decode_presence_map(payload.get("leaves").unwrap_or(&Value::Null));
    let mut events = Vec::new();

    for (key, new_presences) in joins {
        let entry = state.entry(key.clone()).or_default();
        for meta in &new_presences {
            entry.retain(|existing| existing.presence_ref != meta.presence_ref || meta.presence_ref.is_none());
            entry.push(meta.clone());
        }
        events.push(ChannelEvent::PresenceJoin { key, new_presences });
    }

    for (key, left_presences) in leaves {
        if let Some(entry) = state.get_mut(&key) {
            entry.retain(|existing| {
                !left_presences
                    .iter()
                    .any(|gone| gone.presence_ref.is_some() && gone.presence_ref == existing.presence_ref)
            });
            if entry.is_empty() {
                state.remove(&key);
            }
        }
        events.push(ChannelEvent::PresenceLeave { key, left_presences });
    }

    events.push(ChannelEvent::PresenceSync(state.clone()));
    events
}

fn reply_is_ok(reply: &Value) -> bool {
    reply.get("status").and_then(Value::as_str) == Some("ok")
}

fn reply_reason(reply: &Value) -> String {
    reply
        .get("response")
        .and_then(|response| response.get("reason").or_else(|| response.get("message")))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string()
}

struct Connection {
    id: u64,
    outgoing: mpsc::UnboundedSender<Message>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

struct SocketInner {
    endpoint: Url,
    heartbeat_interval: Duration,
    reply_timeout: Duration,
    access_token: Mutex<Option<String>>,
    next_ref: AtomicU64,
    connect_lock: tokio::sync::Mutex<()>,
    connection: Mutex<Option<Connection>>,
    channels: Mutex<HashMap<String, Arc<SocketChannel>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Value>>>,
}

impl SocketInner {
    fn make_ref(&self) -> String {
        (self.next_ref.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn is_connected(&self) -> bool {
        lock_unpoisoned(&self.connection).is_some()
    }

    async fn ensure_connected(self: &Arc<Self>) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }

        info!(endpoint = %self.endpoint.host_str().unwrap_or_default(), "opening realtime socket");
        let (ws_stream, _) = connect_async(self.endpoint.as_str())
            .await
            .context("failed to connect realtime websocket")?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();
        let (outgoing, mut queue) = mpsc::unbounded_channel::<Message>();
        let id = self.next_ref.fetch_add(1, Ordering::SeqCst);

        let writer = tokio::spawn(async move {
            while let Some(message) = queue.recv().await {
                if let Err(err) = ws_writer.send(message).await {
                    warn!(error = %err, "realtime socket write failed");
                    break;
                }
            }
        });

        let inner = Arc::downgrade(self);
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                let Some(socket) = inner.upgrade() else {
                    return;
                };
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<PhoenixMessage>(&text) {
                        Ok(message) => socket.route(message),
                        Err(err) => warn!(error = %err, "invalid realtime frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(error = %err, "realtime socket receive failed");
                        break;
                    }
                }
            }
            if let Some(socket) = inner.upgrade() {
                socket.connection_lost(id);
            }
        });

        let heartbeat_tx = outgoing.clone();
        let interval = self.heartbeat_interval;
        let inner = Arc::downgrade(self);
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(socket) = inner.upgrade() else {
                    return;
                };
                let frame = PhoenixMessage {
                    topic: PHOENIX_TOPIC.to_string(),
                    event: HEARTBEAT.to_string(),
                    payload: json!({}),
                    msg_ref: Some(socket.make_ref()),
                    join_ref: None,
                };
                if send_frame(&heartbeat_tx, &frame).is_err() {
                    return;
                }
            }
        });

        *lock_unpoisoned(&self.connection) = Some(Connection {
            id,
            outgoing,
            tasks: vec![writer, reader, heartbeat],
        });
        Ok(())
    }

    fn push(&self, message: &PhoenixMessage) -> Result<()> {
        let outgoing = lock_unpoisoned(&self.connection)
            .as_ref()
            .map(|connection| connection.outgoing.clone())
            .ok_or(RealtimeError::TransportClosed)?;
        send_frame(&outgoing, message)
    }

    /// Pushes `message` and waits for its `phx_reply`. `None` on timeout.
    async fn request(&self, mut message: PhoenixMessage) -> Result<Option<Value>> {
        let msg_ref = self.make_ref();
        message.msg_ref = Some(msg_ref.clone());
        let (tx, rx) = oneshot::channel();
        lock_unpoisoned(&self.pending).insert(msg_ref.clone(), tx);
        if let Err(err) = self.push(&message) {
            lock_unpoisoned(&self.pending).remove(&msg_ref);
            return Err(err);
        }
        match tokio::time::timeout(self.reply_timeout, rx).await {
            Ok(Ok(reply)) => Ok(Some(reply)),
            Ok(Err(_)) => Err(RealtimeError::TransportClosed.into()),
            Err(_) => {
                lock_unpoisoned(&self.pending).remove(&msg_ref);
                Ok(None)
            }
        }
    }

    fn channel_for(&self, topic: &str) -> Option<Arc<SocketChannel>> {
        lock_unpoisoned(&self.channels).get(topic).cloned()
    }

    fn forget_channel(&self, channel: &SocketChannel) {
        let mut channels = lock_unpoisoned(&self.channels);
        if channels
            .get(&channel.topic)
            .is_some_and(|current| current.id == channel.id)
        {
            channels.remove(&channel.topic);
        }
    }

    fn route(&self, message: PhoenixMessage) {
        if message.event == PHX_REPLY {
            let waiter = message
                .msg_ref
                .as_ref()
                .and_then(|msg_ref| lock_unpoisoned(&self.pending).remove(msg_ref));
            if let Some(waiter) = waiter {
                let _ = waiter.send(message.payload);
            }
            return;
        }
        if message.topic == PHOENIX_TOPIC {
            return;
        }

        let Some(channel) = self.channel_for(&message.topic) else {
            debug!(topic = %message.topic, event = %message.event, "frame for unknown topic");
            return;
        };
        match message.event.as_str() {
            PHX_ERROR => {
                error!(channel = %channel.name, "server reported channel error");
                self.forget_channel(&channel);
                channel.fail(SubscribeStatus::ChannelError);
            }
            PHX_CLOSE => {
                info!(channel = %channel.name, "server closed channel");
                self.forget_channel(&channel);
                channel.fail(SubscribeStatus::Closed);
            }
            PRESENCE_STATE => channel.on_presence_state(&message.payload),
            PRESENCE_DIFF => channel.on_presence_diff(&message.payload),
            BROADCAST => channel.on_broadcast(message.payload),
            POSTGRES_CHANGES => channel.on_row_change(&message.payload),
            other => debug!(channel = %channel.name, event = other, "ignoring realtime frame"),
        }
    }

    /// Fails every joined channel once the socket identified by `id` is gone.
    fn connection_lost(&self, id: u64) {
        let channels: Vec<Arc<SocketChannel>> = {
            let mut connection = lock_unpoisoned(&self.connection);
            if connection.as_ref().map(|current| current.id) != Some(id) {
                return;
            }
            lock_unpoisoned(&self.pending).clear();
            let channels = lock_unpoisoned(&self.channels).drain().map(|(_, c)| c).collect();
            let _stale = connection.take();
            channels
        };
        warn!(channels = channels.len(), "realtime socket lost");
        for channel in channels {
            channel.fail(SubscribeStatus::ChannelError);
        }
    }
}

fn send_frame(outgoing: &mpsc::UnboundedSender<Message>, message: &PhoenixMessage) -> Result<()> {
    let text = serde_json::to_string(message)?;
    outgoing
        .send(Message::Text(text))
        .map_err(|_| RealtimeError::TransportClosed)?;
    Ok(())
}

/// [`RealtimeBackend`] over a single Phoenix websocket.
pub struct SocketBackend {
    inner: Arc<SocketInner>,
    next_channel_id: AtomicU64,
}

impl SocketBackend {
    pub fn new(endpoint: Url, heartbeat_interval: Duration) -> Self {
        Self {
            inner: Arc::new(SocketInner {
                endpoint,
                heartbeat_interval,
                reply_timeout: DEFAULT_REPLY_TIMEOUT,
                access_token: Mutex::new(None),
                next_ref: AtomicU64::new(0),
                connect_lock: tokio::sync::Mutex::new(()),
                connection: Mutex::new(None),
                channels: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
            }),
            next_channel_id: AtomicU64::new(0),
        }
    }

    pub fn from_settings(settings: &RealtimeSettings) -> Result<Self> {
        let endpoint = socket_endpoint(&settings.realtime_url, &settings.api_key)?;
        Ok(Self::new(endpoint, settings.heartbeat_interval()))
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    pub fn joined_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = lock_unpoisoned(&self.inner.channels).keys().cloned().collect();
        topics.sort();
        topics
    }
}

impl Drop for SocketBackend {
    fn drop(&mut self) {
        lock_unpoisoned(&self.inner.connection).take();
    }
}

#[async_trait]
impl RealtimeBackend for SocketBackend {
    fn channel(&self, name: &str, config: ChannelConfig) -> Arc<dyn ChannelHandle> {
        Arc::new_cyclic(|me| SocketChannel {
            id: self.next_channel_id.fetch_add(1, Ordering::SeqCst),
            name: name.to_string(),
            topic: channel_topic(name),
            config,
            socket: Arc::downgrade(&self.inner),
            me: me.clone(),
            bindings: BindingTable::default(),
            phase: Mutex::new(Phase::Idle),
            join_ref: Mutex::new(None),
            on_status: Mutex::new(None),
            presence: Mutex::new(PresenceState::new()),
        })
    }

    async fn remove_channel(&self, handle: Arc<dyn ChannelHandle>) -> Result<()> {
        handle.unsubscribe().await
    }

    async fn set_auth(&self, access_token: &str) -> Result<()> {
        *lock_unpoisoned(&self.inner.access_token) = Some(access_token.to_string());
        let joined: Vec<Arc<SocketChannel>> =
            lock_unpoisoned(&self.inner.channels).values().cloned().collect();
        for channel in joined {
            let frame = channel.frame(ACCESS_TOKEN, json!({ "access_token": access_token }));
            if let Err(err) = self.inner.push(&frame) {
                warn!(channel = %channel.name, error = %err, "failed to push refreshed access token");
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Joining,
    Joined,
    Removed,
}

pub struct SocketChannel {
    id: u64,
    name: String,
    topic: String,
    config: ChannelConfig,
    socket: Weak<SocketInner>,
    me: Weak<SocketChannel>,
    bindings: BindingTable,
    phase: Mutex<Phase>,
    join_ref: Mutex<Option<String>>,
    on_status: Mutex<Option<StatusCallback>>,
    presence: Mutex<PresenceState>,
}

impl SocketChannel {
    fn phase(&self) -> Phase {
        *lock_unpoisoned(&self.phase)
    }

    fn set_phase(&self, phase: Phase) {
        *lock_unpoisoned(&self.phase) = phase;
    }

    fn socket(&self) -> Result<Arc<SocketInner>> {
        self.socket
            .upgrade()
            .ok_or_else(|| RealtimeError::TransportClosed.into())
    }

    fn frame(&self, event: &str, payload: Value) -> PhoenixMessage {
        PhoenixMessage {
            topic: self.topic.clone(),
            event: event.to_string(),
            payload,
            msg_ref: None,
            join_ref: lock_unpoisoned(&self.join_ref).clone(),
        }
    }

    fn report(&self, status: SubscribeStatus) {
        let callback = lock_unpoisoned(&self.on_status).clone();
        if let Some(callback) = callback {
            callback(status);
        }
    }

    fn fail(&self, status: SubscribeStatus) {
        if self.phase() == Phase::Removed {
            return;
        }
        self.set_phase(Phase::Idle);
        lock_unpoisoned(&self.presence).clear();
        self.report(status);
    }

    fn dispatch_all(&self, events: Vec<ChannelEvent>) {
        for event in &events {
            self.bindings.dispatch(event);
        }
    }

    fn on_presence_state(&self, payload: &Value) {
        let events = apply_presence_state(&mut lock_unpoisoned(&self.presence), payload);
        self.dispatch_all(events);
    }

    fn on_presence_diff(&self, payload: &Value) {
        let events = apply_presence_diff(&mut lock_unpoisoned(&self.presence), payload);
        self.dispatch_all(events);
    }

    fn on_broadcast(&self, payload: Value) {
        match serde_json::from_value::<BroadcastEnvelope>(payload) {
            Ok(envelope) => {
                self.bindings.dispatch(&ChannelEvent::Broadcast {
                    event: envelope.event,
                    payload: envelope.payload,
                });
            }
            Err(err) => warn!(channel = %self.name, error = %err, "malformed broadcast frame"),
        }
    }

    fn on_row_change(&self, payload: &Value) {
        let data = payload.get("data").cloned().unwrap_or(Value::Null);
        match serde_json::from_value::<RowChange>(data) {
            Ok(change) => {
                self.bindings.dispatch(&ChannelEvent::RowChange(change));
            }
            Err(err) => warn!(channel = %self.name, error = %err, "malformed postgres_changes frame"),
        }
    }

    async fn presence_request(&self, event: &str, payload: Value) -> Result<TrackStatus> {
        if self.phase() != Phase::Joined {
            return Err(RealtimeError::NotSubscribed(self.name.clone()).into());
        }
        let frame = self.frame(
            PRESENCE,
            json!({ "type": PRESENCE, "event": event, "payload": payload }),
        );
        match self.socket()?.request(frame).await? {
            Some(reply) if reply_is_ok(&reply) => Ok(TrackStatus::Ok),
            Some(reply) => {
                warn!(channel = %self.name, event, reason = %reply_reason(&reply), "presence request rejected");
                Ok(TrackStatus::Error)
            }
            None => Ok(TrackStatus::TimedOut),
        }
    }
}

#[async_trait]
impl ChannelHandle for SocketChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn on(&self, binding: ChannelBinding, callback: EventCallback) {
        self.bindings.add(binding, callback);
    }

    async fn subscribe(&self, on_status: StatusCallback) -> Result<()> {
        *lock_unpoisoned(&self.on_status) = Some(Arc::clone(&on_status));
        if self.phase() == Phase::Removed {
            on_status(SubscribeStatus::Closed);
            return Err(RealtimeError::ChannelRemoved {
                name: self.name.clone(),
            }
            .into());
        }

        let socket = self.socket()?;
        socket.ensure_connected().await?;
        let me = self.me.upgrade().ok_or(RealtimeError::TransportClosed)?;
        lock_unpoisoned(&socket.channels).insert(self.topic.clone(), me);

        let join_ref = socket.make_ref();
        *lock_unpoisoned(&self.join_ref) = Some(join_ref.clone());
        self.set_phase(Phase::Joining);
        let token = lock_unpoisoned(&socket.access_token).clone();
        let mut frame = self.frame(PHX_JOIN, join_payload(&self.config, &self.bindings, token.as_deref()));
        frame.join_ref = Some(join_ref);

        debug!(channel = %self.name, "joining channel");
        let reply = socket.request(frame).await;
        if self.phase() != Phase::Joining {
            // removed, or already failed by a lost socket, while the join was in flight
            return Ok(());
        }
        let reply = match reply {
            Ok(reply) => reply,
            Err(err) => {
                socket.forget_channel(self);
                self.set_phase(Phase::Idle);
                return Err(err);
            }
        };
        match reply {
            Some(reply) if reply_is_ok(&reply) => {
                self.set_phase(Phase::Joined);
                on_status(SubscribeStatus::Subscribed);
            }
            Some(reply) => {
                let rejection = RealtimeError::JoinRejected {
                    name: self.name.clone(),
                    reason: reply_reason(&reply),
                };
                warn!(channel = %self.name, error = %rejection, "channel join failed");
                socket.forget_channel(self);
                self.set_phase(Phase::Idle);
                on_status(SubscribeStatus::ChannelError);
            }
            None => {
                warn!(channel = %self.name, "join timed out");
                socket.forget_channel(self);
                self.set_phase(Phase::Idle);
                on_status(SubscribeStatus::TimedOut);
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *lock_unpoisoned(&self.phase), Phase::Removed);
        if previous == Phase::Removed {
            return Ok(());
        }
        lock_unpoisoned(&self.on_status).take();
        self.bindings.clear();
        let Some(socket) = self.socket.upgrade() else {
            return Ok(());
        };
        socket.forget_channel(self);
        if matches!(previous, Phase::Joined | Phase::Joining) {
            let mut frame = self.frame(PHX_LEAVE, json!({}));
            frame.msg_ref = Some(socket.make_ref());
            if let Err(err) = socket.push(&frame) {
                debug!(channel = %self.name, error = %err, "leave not sent; socket already gone");
            }
        }
        Ok(())
    }

    async fn track(&self, payload: Value) -> Result<TrackStatus> {
        self.presence_request("track", payload).await
    }

    async fn untrack(&self) -> Result<TrackStatus> {
        self.presence_request("untrack", json!({})).await
    }

    async fn send(&self, message: BroadcastEnvelope) -> Result<()> {
        if self.phase() != Phase::Joined {
            return Err(RealtimeError::NotSubscribed(self.name.clone()).into());
        }
        let mut frame = self.frame(BROADCAST, serde_json::to_value(&message)?);
        let socket = self.socket()?;
        frame.msg_ref = Some(socket.make_ref());
        socket.push(&frame)
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
