use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use shared::protocol::RowChange;
use tracing::debug;

use crate::lock_unpoisoned;

pub type Listener = Arc<dyn Fn(&RowChange) + Send + Sync>;

/// In-process registry for notification events raised by the notification
/// channel. Listeners run in registration order; removal is by `Arc` identity.
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<HashMap<String, Vec<Listener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, event: &str, listener: Listener) {
        lock_unpoisoned(&self.listeners)
            .entry(event.to_string())
            .or_default()
            .push(listener);
    }

    /// Removes every registration of `listener` for `event`. Returns whether
    /// anything was removed; unknown listeners are ignored.
    pub fn unsubscribe(&self, event: &str, listener: &Listener) -> bool {
        let mut listeners = lock_unpoisoned(&self.listeners);
        let Some(registered) = listeners.get_mut(event) else {
            return false;
        };
        let before = registered.len();
        registered.retain(|existing| !Arc::ptr_eq(existing, listener));
        let removed = registered.len() != before;
        if registered.is_empty() {
            listeners.remove(event);
        }
        removed
    }

    /// Invokes the listeners registered for `event` and returns how many ran.
    /// Listeners may subscribe or unsubscribe from inside the callback; the
    /// change applies to the next emit.
    pub fn emit(&self, event: &str, change: &RowChange) -> usize {
        let snapshot: Vec<Listener> = lock_unpoisoned(&self.listeners)
            .get(event)
            .cloned()
            .unwrap_or_default();
        if snapshot.is_empty() {
            debug!(event, table = %change.table, "notification without listeners");
            return 0;
        }
        for listener in &snapshot {
            listener(change);
        }
        snapshot.len()
    }

    pub fn listener_count(&self, event: &str) -> usize {
        lock_unpoisoned(&self.listeners)
            .get(event)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
#[path = "tests/event_bus_tests.rs"]
mod tests;
