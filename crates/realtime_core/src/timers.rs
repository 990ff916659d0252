use std::{
    collections::HashMap,
    future::Future,
    hash::Hash,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::task::JoinHandle;

use crate::lock_unpoisoned;

struct TimerEntry {
    generation: u64,
    task: JoinHandle<()>,
}

struct TimerSlots<K> {
    next_generation: u64,
    entries: HashMap<K, TimerEntry>,
}

/// Keyed one-shot timers. At most one timer is pending per key; scheduling a
/// key again aborts the previous timer. A timer only runs its task if it is
/// still the current entry for its key when the delay elapses.
pub struct TimerRegistry<K> {
    slots: Arc<Mutex<TimerSlots<K>>>,
}

impl<K> Default for TimerRegistry<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> TimerRegistry<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(TimerSlots {
                next_generation: 0,
                entries: HashMap::new(),
            })),
        }
    }

    /// Schedules `task` to run after `delay`, replacing any pending timer for `key`.
    /// The entry is removed before `task` is polled, so a running task no longer
    /// counts as pending and cannot be aborted by `cancel`.
    pub fn schedule<F>(&self, key: K, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let slots = Arc::clone(&self.slots);
        let mut guard = lock_unpoisoned(&self.slots);
        guard.next_generation += 1;
        let generation = guard.next_generation;
        let task_key = key.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let still_current = {
                let mut guard = lock_unpoisoned(&slots);
                match guard.entries.get(&task_key) {
                    Some(entry) if entry.generation == generation => {
                        guard.entries.remove(&task_key);
                        true
                    }
                    _ => false,
                }
            };
            if still_current {
                task.await;
            }
        });

        if let Some(previous) = guard.entries.insert(key, TimerEntry { generation, task: handle }) {
            previous.task.abort();
        }
    }

    pub fn cancel(&self, key: &K) -> bool {
        match lock_unpoisoned(&self.slots).entries.remove(key) {
            Some(entry) => {
                entry.task.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_where(&self, mut predicate: impl FnMut(&K) -> bool) -> usize {
        let mut guard = lock_unpoisoned(&self.slots);
        let doomed: Vec<K> = guard
            .entries
            .keys()
            .filter(|key| predicate(key))
            .cloned()
            .collect();
        for key in &doomed {
            if let Some(entry) = guard.entries.remove(key) {
                entry.task.abort();
            }
        }
        doomed.len()
    }

    pub fn cancel_all(&self) -> usize {
        let mut guard = lock_unpoisoned(&self.slots);
        let count = guard.entries.len();
        for (_, entry) in guard.entries.drain() {
            entry.task.abort();
        }
        count
    }

    pub fn is_pending(&self, key: &K) -> bool {
        lock_unpoisoned(&self.slots).entries.contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        lock_unpoisoned(&self.slots).entries.len()
    }
}

impl<K> Drop for TimerRegistry<K> {
    fn drop(&mut self) {
        let mut guard = lock_unpoisoned(&self.slots);
        for (_, entry) in guard.entries.drain() {
            entry.task.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/timers_tests.rs"]
mod tests;
