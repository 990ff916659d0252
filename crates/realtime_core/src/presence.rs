use std::collections::HashMap;

use shared::{
    domain::UserId,
    protocol::{PresenceMeta, PresenceState},
};
use tokio::sync::watch;
use tracing::{debug, info};

/// Online/offline view derived from the presence channel.
///
/// Only [`PresenceCoordinator::on_sync`] writes: each sync replaces the whole
/// map. Join and leave notifications are logged and otherwise ignored because
/// the sync that follows them carries the authoritative state.
pub struct PresenceCoordinator {
    state: watch::Sender<PresenceState>,
}

impl Default for PresenceCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceCoordinator {
    pub fn new() -> Self {
        let (state, _) = watch::channel(PresenceState::new());
        Self { state }
    }

    pub fn on_sync(&self, state: PresenceState) {
        let online = state.values().filter(|metas| !metas.is_empty()).count();
        self.state.send_replace(state);
        debug!(online, "presence synced");
    }

    pub fn on_join(&self, key: &UserId, new_presences: &[PresenceMeta]) {
        info!(user_id = %key, sessions = new_presences.len(), "presence join");
    }

    pub fn on_leave(&self, key: &UserId, left_presences: &[PresenceMeta]) {
        info!(user_id = %key, sessions = left_presences.len(), "presence leave");
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.state
            .borrow()
            .get(user_id)
            .is_some_and(|metas| !metas.is_empty())
    }

    pub fn bulk_online_status(&self, user_ids: &[UserId]) -> HashMap<UserId, bool> {
        let state = self.state.borrow();
        user_ids
            .iter()
            .map(|id| {
                let online = state.get(id).is_some_and(|metas| !metas.is_empty());
                (id.clone(), online)
            })
            .collect()
    }

    pub fn snapshot(&self) -> PresenceState {
        self.state.borrow().clone()
    }

    pub fn online_users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .state
            .borrow()
            .iter()
            .filter(|(_, metas)| !metas.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        users.sort();
        users
    }

    /// Receiver that observes every authoritative sync.
    pub fn watch(&self) -> watch::Receiver<PresenceState> {
        self.state.subscribe()
    }

    pub fn clear(&self) {
        self.state.send_replace(PresenceState::new());
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
