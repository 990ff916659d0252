use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use shared::domain::UserId;
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::{
    backend::RealtimeBackend,
    conversation::ConversationChannelFactory,
    lock_unpoisoned,
    presence::PresenceCoordinator,
    reconnect::ReconnectionSupervisor,
    registry::ChannelRegistry,
    signals::{AppState, AuthEvent, AuthSession, NetworkStatus, SignalSources},
    status::{report_user_status, UserStatusUpdater},
    timers::TimerRegistry,
};

pub const DEFAULT_REBUILD_DELAY: Duration = Duration::from_millis(250);

struct LifecycleState {
    session: Option<AuthSession>,
    network_online: bool,
    app_state: AppState,
}

/// Reacts to auth, network and foreground changes by tearing down and
/// rebuilding the main channels.
///
/// Network and foreground signals are edge-triggered. Rebuilds go through a
/// single delayed timer, so overlapping triggers collapse into one cycle.
pub struct LifecycleOrchestrator {
    backend: Arc<dyn RealtimeBackend>,
    registry: Arc<ChannelRegistry>,
    conversations: Arc<ConversationChannelFactory>,
    supervisor: Arc<ReconnectionSupervisor>,
    presence: Arc<PresenceCoordinator>,
    status_updater: Arc<dyn UserStatusUpdater>,
    rebuild_delay: Duration,
    state: Mutex<LifecycleState>,
    rebuild_timer: TimerRegistry<()>,
    rebuilds: AtomicU64,
}

impl LifecycleOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        backend: Arc<dyn RealtimeBackend>,
        registry: Arc<ChannelRegistry>,
        conversations: Arc<ConversationChannelFactory>,
        supervisor: Arc<ReconnectionSupervisor>,
        presence: Arc<PresenceCoordinator>,
        status_updater: Arc<dyn UserStatusUpdater>,
        rebuild_delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            registry,
            conversations,
            supervisor,
            presence,
            status_updater,
            rebuild_delay,
            state: Mutex::new(LifecycleState {
                session: None,
                network_online: true,
                app_state: AppState::Active,
            }),
            rebuild_timer: TimerRegistry::new(),
            rebuilds: AtomicU64::new(0),
        })
    }

    pub fn current_user(&self) -> Option<UserId> {
        lock_unpoisoned(&self.state)
            .session
            .as_ref()
            .map(|session| session.user_id.clone())
    }

    pub fn is_network_online(&self) -> bool {
        lock_unpoisoned(&self.state).network_online
    }

    pub fn app_state(&self) -> AppState {
        lock_unpoisoned(&self.state).app_state
    }

    /// Main-channel builds started by this orchestrator, including the one
    /// done on sign-in.
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds.load(Ordering::SeqCst)
    }

    pub fn has_pending_rebuild(&self) -> bool {
        self.rebuild_timer.is_pending(&())
    }

    pub async fn on_auth_event(self: &Arc<Self>, event: AuthEvent) {
        match event {
            AuthEvent::SignedIn(session) => {
                let previous = {
                    let mut state = lock_unpoisoned(&self.state);
                    state.session.replace(session.clone())
                };
                self.apply_token(&session.access_token).await;
                let same_user = previous
                    .as_ref()
                    .is_some_and(|previous| previous.user_id == session.user_id);
                if same_user {
                    debug!(user_id = %session.user_id, "session re-announced; channels kept");
                    return;
                }
                if let Some(previous) = previous {
                    info!(from = %previous.user_id, to = %session.user_id, "switching user");
                    // same release as a sign-out, minus the token
                    self.rebuild_timer.cancel_all();
                    self.conversations.close_all().await;
                    self.registry.teardown_all().await;
                    self.supervisor.reset_all();
                    self.presence.clear();
                }
                info!(user_id = %session.user_id, "signed in");
                self.rebuild_timer.cancel(&());
                self.rebuild_now().await;
            }
            AuthEvent::TokenRefreshed(session) => {
                {
                    let mut state = lock_unpoisoned(&self.state);
                    if let Some(current) = state.session.as_mut() {
                        current.access_token = session.access_token.clone();
                    }
                }
                debug!(user_id = %session.user_id, "access token refreshed");
                self.apply_token(&session.access_token).await;
            }
            AuthEvent::SignedOut => {
                let had_session = lock_unpoisoned(&self.state).session.take().is_some();
                if !had_session {
                    debug!("sign-out without a session");
                }
                info!("signed out; releasing realtime channels");
                self.status_updater.set_access_token(None);
                self.release_everything().await;
            }
        }
    }

    pub async fn on_network_change(self: &Arc<Self>, status: NetworkStatus) {
        let online = status.is_online();
        let (was_online, has_session) = {
            let mut state = lock_unpoisoned(&self.state);
            let was_online = state.network_online;
            state.network_online = online;
            (was_online, state.session.is_some())
        };
        if was_online == online {
            return;
        }

        self.supervisor.set_network_online(online);
        if online {
            info!("network restored");
            self.supervisor.reset_all();
            if has_session {
                self.schedule_rebuild("network restored");
            }
        } else {
            let cancelled = self.supervisor.cancel_all_pending();
            self.rebuild_timer.cancel(&());
            info!(cancelled_retries = cancelled, "network lost; channels left to fail on their own");
        }
    }

    pub async fn on_app_state_change(self: &Arc<Self>, next: AppState) {
        let (previous, user_id, network_online) = {
            let mut state = lock_unpoisoned(&self.state);
            let previous = std::mem::replace(&mut state.app_state, next);
            (
                previous,
                state.session.as_ref().map(|session| session.user_id.clone()),
                state.network_online,
            )
        };
        if previous.is_active() == next.is_active() {
            return;
        }

        if !next.is_active() {
            info!(state = ?next, "app left the foreground");
            if let Some(user_id) = user_id {
                report_user_status(self.status_updater.as_ref(), &user_id, false).await;
            }
            return;
        }

        info!("app returned to the foreground; cycling channels");
        self.supervisor.reset_all();
        self.registry.teardown_for_rebuild().await;
        let Some(user_id) = user_id else {
            return;
        };
        report_user_status(self.status_updater.as_ref(), &user_id, true).await;
        if network_online {
            self.schedule_rebuild("foreground");
        }
    }

    /// Feeds the signal sources into the orchestrator until the auth source
    /// closes.
    pub fn spawn(self: &Arc<Self>, signals: SignalSources) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut network = signals.network.subscribe();
            let mut app_state = signals.app_state.subscribe();
            let mut auth = signals.auth.subscribe();

            let status = *network.borrow_and_update();
            orchestrator.on_network_change(status).await;
            let state = *app_state.borrow_and_update();
            orchestrator.on_app_state_change(state).await;
            if let Some(session) = signals.auth.current() {
                orchestrator.on_auth_event(AuthEvent::SignedIn(session)).await;
            }

            let mut network_open = true;
            let mut app_state_open = true;
            loop {
                tokio::select! {
                    changed = network.changed(), if network_open => {
                        if changed.is_err() {
                            network_open = false;
                            continue;
                        }
                        let status = *network.borrow_and_update();
                        orchestrator.on_network_change(status).await;
                    }
                    changed = app_state.changed(), if app_state_open => {
                        if changed.is_err() {
                            app_state_open = false;
                            continue;
                        }
                        let state = *app_state.borrow_and_update();
                        orchestrator.on_app_state_change(state).await;
                    }
                    event = auth.recv() => match event {
                        Ok(event) => orchestrator.on_auth_event(event).await,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "auth events lagged; resynchronising from the current session");
                            let event = match signals.auth.current() {
                                Some(session) => AuthEvent::SignedIn(session),
                                None => AuthEvent::SignedOut,
                            };
                            orchestrator.on_auth_event(event).await;
                        }
                        Err(RecvError::Closed) => {
                            info!("auth source closed; lifecycle loop stopping");
                            break;
                        }
                    },
                }
            }
        })
    }

    /// Releases every channel and timer, as on sign-out.
    pub async fn shutdown(&self) {
        self.release_everything().await;
    }

    async fn release_everything(&self) {
        self.rebuild_timer.cancel_all();
        self.conversations.close_all().await;
        self.registry.teardown_all().await;
        self.supervisor.reset_all();
        self.presence.clear();
    }

    async fn apply_token(&self, token: &str) {
        self.status_updater.set_access_token(Some(token));
        if let Err(err) = self.backend.set_auth(token).await {
            error!(error = %err, "failed to pass the access token to the realtime backend");
        }
    }

    fn schedule_rebuild(self: &Arc<Self>, reason: &'static str) {
        debug!(reason, delay_ms = self.rebuild_delay.as_millis() as u64, "scheduling main channel rebuild");
        let orchestrator = Arc::downgrade(self);
        self.rebuild_timer.schedule((), self.rebuild_delay, async move {
            if let Some(orchestrator) = orchestrator.upgrade() {
                info!(reason, "rebuilding main channels");
                orchestrator.rebuild_now().await;
            }
        });
    }

    async fn rebuild_now(&self) {
        let Some(user_id) = self.current_user() else {
            debug!("no session; skipping rebuild");
            return;
        };
        self.rebuilds.fetch_add(1, Ordering::SeqCst);
        self.registry.ensure_main_channels(Some(user_id)).await;
    }
}

#[cfg(test)]
#[path = "tests/lifecycle_tests.rs"]
mod tests;
