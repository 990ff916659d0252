//! Host signal sources driving the lifecycle: network reachability,
//! foreground/background state and the auth session.
//!
//! Each signal is a trait so the orchestrator reacts the same way whether the
//! host feeds it by hand, probes the network itself, or has no foreground
//! concept at all.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use shared::domain::UserId;
use tokio::{
    net::TcpStream,
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::{debug, info};

use crate::lock_unpoisoned;

const AUTH_EVENT_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkStatus {
    pub is_connected: bool,
    pub is_internet_reachable: bool,
}

impl NetworkStatus {
    pub const ONLINE: NetworkStatus = NetworkStatus {
        is_connected: true,
        is_internet_reachable: true,
    };
    pub const OFFLINE: NetworkStatus = NetworkStatus {
        is_connected: false,
        is_internet_reachable: false,
    };

    pub fn is_online(&self) -> bool {
        self.is_connected && self.is_internet_reachable
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Active,
    Inactive,
    Background,
}

impl AppState {
    pub fn is_active(self) -> bool {
        self == AppState::Active
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub user_id: UserId,
    pub access_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn(AuthSession),
    TokenRefreshed(AuthSession),
    SignedOut,
}

pub trait NetworkStatusProvider: Send + Sync {
    fn subscribe(&self) -> watch::Receiver<NetworkStatus>;
}

pub trait AppStateProvider: Send + Sync {
    fn subscribe(&self) -> watch::Receiver<AppState>;
}

pub trait AuthSessionProvider: Send + Sync {
    fn current(&self) -> Option<AuthSession>;
    fn subscribe(&self) -> broadcast::Receiver<AuthEvent>;
}

/// Network status pushed by the host (OS reachability callbacks, tests).
pub struct ManualNetworkStatus {
    tx: watch::Sender<NetworkStatus>,
}

impl ManualNetworkStatus {
    pub fn new(initial: NetworkStatus) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn set(&self, status: NetworkStatus) {
        self.tx.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
    }

    pub fn set_online(&self, online: bool) {
        self.set(if online {
            NetworkStatus::ONLINE
        } else {
            NetworkStatus::OFFLINE
        });
    }

    pub fn current(&self) -> NetworkStatus {
        *self.tx.borrow()
    }
}

impl Default for ManualNetworkStatus {
    fn default() -> Self {
        Self::new(NetworkStatus::ONLINE)
    }
}

impl NetworkStatusProvider for ManualNetworkStatus {
    fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.tx.subscribe()
    }
}

/// Treats the network as reachable while a TCP connect to `addr` succeeds.
pub struct TcpProbeNetworkStatus {
    addr: SocketAddr,
    interval: Duration,
    tx: watch::Sender<NetworkStatus>,
}

impl TcpProbeNetworkStatus {
    pub fn new(addr: SocketAddr, interval: Duration) -> Arc<Self> {
        let (tx, _) = watch::channel(NetworkStatus::ONLINE);
        Arc::new(Self { addr, interval, tx })
    }

    /// Runs one probe and publishes the result.
    pub async fn probe_once(&self) -> NetworkStatus {
        let reachable = matches!(
            tokio::time::timeout(self.interval, TcpStream::connect(self.addr)).await,
            Ok(Ok(_))
        );
        let status = NetworkStatus {
            is_connected: reachable,
            is_internet_reachable: reachable,
        };
        let changed = self.tx.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
        if changed {
            info!(addr = %self.addr, online = reachable, "network probe state changed");
        } else {
            debug!(addr = %self.addr, online = reachable, "network probe");
        }
        status
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let probe = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                probe.probe_once().await;
                tokio::time::sleep(probe.interval).await;
            }
        })
    }
}

impl NetworkStatusProvider for TcpProbeNetworkStatus {
    fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.tx.subscribe()
    }
}

/// Foreground/background state pushed by the host.
pub struct ManualAppState {
    tx: watch::Sender<AppState>,
}

impl ManualAppState {
    pub fn new(initial: AppState) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn set(&self, state: AppState) {
        self.tx.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    pub fn current(&self) -> AppState {
        *self.tx.borrow()
    }
}

impl Default for ManualAppState {
    fn default() -> Self {
        Self::new(AppState::Active)
    }
}

impl AppStateProvider for ManualAppState {
    fn subscribe(&self) -> watch::Receiver<AppState> {
        self.tx.subscribe()
    }
}

/// For headless hosts: permanently in the foreground.
pub struct AlwaysActive {
    tx: watch::Sender<AppState>,
}

impl Default for AlwaysActive {
    fn default() -> Self {
        let (tx, _) = watch::channel(AppState::Active);
        Self { tx }
    }
}

impl AppStateProvider for AlwaysActive {
    fn subscribe(&self) -> watch::Receiver<AppState> {
        self.tx.subscribe()
    }
}

/// Auth session pushed by the host's auth client.
pub struct ManualAuthSession {
    current: Mutex<Option<AuthSession>>,
    tx: broadcast::Sender<AuthEvent>,
}

impl Default for ManualAuthSession {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(AUTH_EVENT_CAPACITY);
        Self {
            current: Mutex::new(None),
            tx,
        }
    }
}

impl ManualAuthSession {
    pub fn sign_in(&self, user_id: UserId, access_token: impl Into<String>) {
        let session = AuthSession {
            user_id,
            access_token: access_token.into(),
        };
        *lock_unpoisoned(&self.current) = Some(session.clone());
        let _ = self.tx.send(AuthEvent::SignedIn(session));
    }

    /// Publishes a refreshed token for the current session. Ignored when
    /// nobody is signed in.
    pub fn refresh_token(&self, access_token: impl Into<String>) -> bool {
        let session = {
            let mut current = lock_unpoisoned(&self.current);
            let Some(session) = current.as_mut() else {
                return false;
            };
            session.access_token = access_token.into();
            session.clone()
        };
        let _ = self.tx.send(AuthEvent::TokenRefreshed(session));
        true
    }

    pub fn sign_out(&self) {
        lock_unpoisoned(&self.current).take();
        let _ = self.tx.send(AuthEvent::SignedOut);
    }
}

impl AuthSessionProvider for ManualAuthSession {
    fn current(&self) -> Option<AuthSession> {
        lock_unpoisoned(&self.current).clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.tx.subscribe()
    }
}

/// The three providers selected at startup.
#[derive(Clone)]
pub struct SignalSources {
    pub network: Arc<dyn NetworkStatusProvider>,
    pub app_state: Arc<dyn AppStateProvider>,
    pub auth: Arc<dyn AuthSessionProvider>,
}

#[cfg(test)]
#[path = "tests/signals_tests.rs"]
mod tests;
