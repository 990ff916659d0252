//! Capability surface of the realtime pub/sub backend.
//!
//! The manager never talks to a wire protocol directly. It creates named
//! channels through [`RealtimeBackend`], registers bindings on the returned
//! [`ChannelHandle`], subscribes, and later hands the handle back for removal.

use std::{fmt, sync::Arc, sync::Mutex};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use shared::{
    domain::UserId,
    protocol::{BroadcastEnvelope, PresenceMeta, PresenceState, RowChange, RowEvent},
};

use crate::lock_unpoisoned;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscribeStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

impl SubscribeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubscribeStatus::Subscribed => "SUBSCRIBED",
            SubscribeStatus::ChannelError => "CHANNEL_ERROR",
            SubscribeStatus::TimedOut => "TIMED_OUT",
            SubscribeStatus::Closed => "CLOSED",
        }
    }

    /// Statuses that hand the channel over to the reconnection supervisor.
    pub fn is_failure(self) -> bool {
        matches!(self, SubscribeStatus::ChannelError | SubscribeStatus::TimedOut)
    }
}

impl fmt::Display for SubscribeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackStatus {
    Ok,
    TimedOut,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelConfig {
    pub presence_key: Option<String>,
    pub broadcast_self: bool,
    pub broadcast_ack: bool,
}

impl ChannelConfig {
    pub fn with_presence_key(key: impl Into<String>) -> Self {
        Self {
            presence_key: Some(key.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceEventKind {
    Sync,
    Join,
    Leave,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowChangeFilter {
    pub event: RowEvent,
    pub schema: String,
    pub table: String,
    pub filter: Option<String>,
}

impl RowChangeFilter {
    pub fn new(event: RowEvent, table: impl Into<String>) -> Self {
        Self {
            event,
            schema: "public".to_string(),
            table: table.into(),
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn matches(&self, change: &RowChange) -> bool {
        if !self.event.matches(change.event)
            || self.schema != change.schema
            || self.table != change.table
        {
            return false;
        }
        match &self.filter {
            Some(expr) => filter_matches(expr, &change.new),
            None => true,
        }
    }
}

/// Evaluates a `column=op.value` filter (`eq` / `neq`) against a record.
/// Unsupported operators never match.
pub fn filter_matches(expr: &str, record: &Value) -> bool {
    let Some((column, rest)) = expr.split_once('=') else {
        return false;
    };
    let Some((op, expected)) = rest.split_once('.') else {
        return false;
    };
    let actual = match record.get(column) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => return op == "neq",
        Some(other) => other.to_string(),
    };
    match op {
        "eq" => actual == expected,
        "neq" => actual != expected,
        _ => false,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelBinding {
    Presence(PresenceEventKind),
    /// Named broadcast event; `"*"` receives every broadcast.
    Broadcast(String),
    RowChange(RowChangeFilter),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    PresenceSync(PresenceState),
    PresenceJoin {
        key: UserId,
        new_presences: Vec<PresenceMeta>,
    },
    PresenceLeave {
        key: UserId,
        left_presences: Vec<PresenceMeta>,
    },
    Broadcast {
        event: String,
        payload: Value,
    },
    RowChange(RowChange),
}

impl ChannelEvent {
    pub fn matches(&self, binding: &ChannelBinding) -> bool {
        match (self, binding) {
            (ChannelEvent::PresenceSync(_), ChannelBinding::Presence(kind)) => {
                *kind == PresenceEventKind::Sync
            }
            (ChannelEvent::PresenceJoin { .. }, ChannelBinding::Presence(kind)) => {
                *kind == PresenceEventKind::Join
            }
            (ChannelEvent::PresenceLeave { .. }, ChannelBinding::Presence(kind)) => {
                *kind == PresenceEventKind::Leave
            }
            (ChannelEvent::Broadcast { event, .. }, ChannelBinding::Broadcast(bound)) => {
                bound == "*" || bound == event
            }
            (ChannelEvent::RowChange(change), ChannelBinding::RowChange(filter)) => {
                filter.matches(change)
            }
            _ => false,
        }
    }
}

pub type EventCallback = Arc<dyn Fn(ChannelEvent) + Send + Sync>;
pub type StatusCallback = Arc<dyn Fn(SubscribeStatus) + Send + Sync>;

#[async_trait]
pub trait ChannelHandle: Send + Sync {
    fn name(&self) -> &str;
    fn on(&self, binding: ChannelBinding, callback: EventCallback);
    async fn subscribe(&self, on_status: StatusCallback) -> Result<()>;
    async fn unsubscribe(&self) -> Result<()>;
    async fn track(&self, payload: Value) -> Result<TrackStatus>;
    async fn untrack(&self) -> Result<TrackStatus>;
    async fn send(&self, message: BroadcastEnvelope) -> Result<()>;
}

#[async_trait]
pub trait RealtimeBackend: Send + Sync {
    fn channel(&self, name: &str, config: ChannelConfig) -> Arc<dyn ChannelHandle>;
    /// Unsubscribes and forgets the handle. Removing an already removed
    /// handle succeeds; other failures are reported and must be tolerated.
    async fn remove_channel(&self, handle: Arc<dyn ChannelHandle>) -> Result<()>;
    async fn set_auth(&self, access_token: &str) -> Result<()>;
}

/// Binding table shared by backend implementations.
#[derive(Default)]
pub struct BindingTable {
    entries: Mutex<Vec<(ChannelBinding, EventCallback)>>,
}

impl BindingTable {
    pub fn add(&self, binding: ChannelBinding, callback: EventCallback) {
        lock_unpoisoned(&self.entries).push((binding, callback));
    }

    /// Invokes every matching callback outside the table lock.
    pub fn dispatch(&self, event: &ChannelEvent) -> usize {
        let matching: Vec<EventCallback> = lock_unpoisoned(&self.entries)
            .iter()
            .filter(|(binding, _)| event.matches(binding))
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in &matching {
            callback(event.clone());
        }
        matching.len()
    }

    pub fn has_presence_bindings(&self) -> bool {
        lock_unpoisoned(&self.entries)
            .iter()
            .any(|(binding, _)| matches!(binding, ChannelBinding::Presence(_)))
    }

    pub fn row_change_filters(&self) -> Vec<RowChangeFilter> {
        lock_unpoisoned(&self.entries)
            .iter()
            .filter_map(|(binding, _)| match binding {
                ChannelBinding::RowChange(filter) => Some(filter.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock_unpoisoned(&self.entries).clear();
    }
}
