//! Per-channel reconnection backoff.
//!
//! Each channel name walks `Healthy -> Backoff(n) -> Reconnecting(n) ->
//! Healthy | Backoff(n + 1)` and parks in `GivenUp` once `max_attempts`
//! retries were spent. Only [`ReconnectionSupervisor::reset`] (successful
//! subscription) or an explicit rebuild trigger leaves `GivenUp`.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::{
    backend::{ChannelHandle, RealtimeBackend},
    lock_unpoisoned,
    timers::TimerRegistry,
};

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(2000);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectPhase {
    #[default]
    Healthy,
    Backoff(u32),
    Reconnecting(u32),
    GivenUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Scheduled { attempt: u32, delay: Duration },
    DeferredOffline,
    GivenUp,
}

#[derive(Debug, Clone, Copy, Default)]
struct ReconnectState {
    attempts: u32,
    phase: ReconnectPhase,
}

/// Work to run when a retry timer fires. `None` means log only.
pub type RetryAction = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(2u32.saturating_pow(attempt))
}

pub struct ReconnectionSupervisor {
    backend: Arc<dyn RealtimeBackend>,
    base_delay: Duration,
    max_attempts: u32,
    network_online: AtomicBool,
    states: Arc<Mutex<HashMap<String, ReconnectState>>>,
    timers: TimerRegistry<String>,
}

impl ReconnectionSupervisor {
    pub fn new(backend: Arc<dyn RealtimeBackend>, base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            backend,
            base_delay,
            max_attempts,
            network_online: AtomicBool::new(true),
            states: Arc::new(Mutex::new(HashMap::new())),
            timers: TimerRegistry::new(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn set_network_online(&self, online: bool) {
        self.network_online.store(online, Ordering::SeqCst);
    }

    pub fn is_network_online(&self) -> bool {
        self.network_online.load(Ordering::SeqCst)
    }

    /// Handles a failed subscription on `handle`.
    ///
    /// The failed handle is always released from the backend. While the
    /// network is known to be down nothing is scheduled and the attempt
    /// counter is left untouched until connectivity returns.
    pub async fn on_channel_error(
        &self,
        handle: Arc<dyn ChannelHandle>,
        retry: Option<RetryAction>,
    ) -> ReconnectDecision {
        let name = handle.name().to_string();

        if !self.is_network_online() {
            {
                let mut states = lock_unpoisoned(&self.states);
                let state = states.entry(name.clone()).or_default();
                if state.phase != ReconnectPhase::GivenUp {
                    state.phase = ReconnectPhase::Backoff(state.attempts);
                }
            }
            self.timers.cancel(&name);
            self.release(handle).await;
            info!(channel = %name, "channel error while offline; waiting for network restore");
            return ReconnectDecision::DeferredOffline;
        }

        let attempt = {
            let mut states = lock_unpoisoned(&self.states);
            let state = states.entry(name.clone()).or_default();
            if state.attempts >= self.max_attempts {
                state.phase = ReconnectPhase::GivenUp;
                None
            } else {
                let attempt = state.attempts;
                state.attempts += 1;
                state.phase = ReconnectPhase::Backoff(state.attempts);
                Some(attempt)
            }
        };

        self.release(handle).await;

        let Some(attempt) = attempt else {
            self.timers.cancel(&name);
            warn!(
                channel = %name,
                max_attempts = self.max_attempts,
                "reconnection attempts exhausted; channel stays down until the next rebuild"
            );
            return ReconnectDecision::GivenUp;
        };

        let delay = backoff_delay(self.base_delay, attempt);
        info!(
            channel = %name,
            attempt = attempt + 1,
            max_attempts = self.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling channel reconnect"
        );

        let states = Arc::clone(&self.states);
        let task_name = name.clone();
        self.timers.schedule(name, delay, async move {
            {
                let mut states = lock_unpoisoned(&states);
                match states.get_mut(&task_name) {
                    Some(state) if matches!(state.phase, ReconnectPhase::Backoff(_)) => {
                        state.phase = ReconnectPhase::Reconnecting(state.attempts);
                    }
                    _ => {
                        debug!(channel = %task_name, "retry timer fired for a reset channel; skipping");
                        return;
                    }
                }
            }
            match retry {
                Some(action) => {
                    info!(channel = %task_name, "reconnecting channel");
                    action().await;
                }
                None => {
                    info!(
                        channel = %task_name,
                        "conversation channel will be recreated when its view is opened again"
                    );
                }
            }
        });

        ReconnectDecision::Scheduled { attempt, delay }
    }

    /// Clears the attempt counter and any pending retry for `name`.
    pub fn reset(&self, name: &str) {
        self.timers.cancel(&name.to_string());
        if lock_unpoisoned(&self.states).remove(name).is_some() {
            debug!(channel = %name, "reconnection state reset");
        }
    }

    pub fn reset_all(&self) {
        self.timers.cancel_all();
        lock_unpoisoned(&self.states).clear();
    }

    /// Drops the pending retry for `name` but keeps its attempt counter.
    pub fn cancel_pending(&self, name: &str) -> bool {
        self.timers.cancel(&name.to_string())
    }

    pub fn cancel_all_pending(&self) -> usize {
        self.timers.cancel_all()
    }

    pub fn attempts(&self, name: &str) -> u32 {
        lock_unpoisoned(&self.states)
            .get(name)
            .map(|state| state.attempts)
            .unwrap_or(0)
    }

    pub fn phase(&self, name: &str) -> ReconnectPhase {
        lock_unpoisoned(&self.states)
            .get(name)
            .map(|state| state.phase)
            .unwrap_or_default()
    }

    pub fn has_pending_retry(&self, name: &str) -> bool {
        self.timers.is_pending(&name.to_string())
    }

    pub fn pending_retry_count(&self) -> usize {
        self.timers.pending_count()
    }

    async fn release(&self, handle: Arc<dyn ChannelHandle>) {
        let name = handle.name().to_string();
        if let Err(err) = self.backend.remove_channel(handle).await {
            warn!(channel = %name, error = %err, "failed to remove errored channel");
        }
    }
}

#[cfg(test)]
#[path = "tests/reconnect_tests.rs"]
mod tests;
