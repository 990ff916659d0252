use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use realtime_core::{
    config::{load_settings, load_settings_from, RealtimeSettings},
    conversation::ConversationCallbacks,
    event_bus::Listener,
    loopback::LoopbackHub,
    signals::{
        AlwaysActive, AuthEvent, AuthSession, ManualAuthSession, ManualNetworkStatus,
        NetworkStatusProvider, SignalSources, TcpProbeNetworkStatus,
    },
    status::NoopStatusUpdater,
    transport::SocketBackend,
    RealtimeClient,
};
use serde_json::json;
use shared::{
    domain::{ChatType, UserId},
    protocol::{NotificationEvent, RowChange, RowEvent, MESSAGE_EVENT},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendKind {
    /// In-process hub with a simulated peer.
    Loopback,
    /// Phoenix websocket to the configured realtime service.
    Socket,
}

#[derive(Parser, Debug)]
struct Args {
    /// Settings file; defaults to ./realtime.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    user_id: String,
    #[arg(long, default_value = "")]
    access_token: String,
    #[arg(long, value_enum, default_value = "loopback")]
    backend: BackendKind,
    /// Open a one-to-one conversation with this user.
    #[arg(long)]
    peer: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let settings = match &args.config {
        Some(path) => load_settings_from(path)?,
        None => load_settings(),
    };
    let user_id = UserId::new(args.user_id.trim());
    user_id.validate().context("--user-id must be a UUID")?;
    let peer = args
        .peer
        .as_deref()
        .map(|raw| {
            let peer = UserId::new(raw.trim());
            peer.validate().map(|_| peer)
        })
        .transpose()
        .context("--peer must be a UUID")?;

    match args.backend {
        BackendKind::Loopback => run_loopback(&settings, user_id, peer).await,
        BackendKind::Socket => run_socket(&settings, user_id, args.access_token, peer).await,
    }
}

fn print_notifications(client: &RealtimeClient) {
    for event in NotificationEvent::ALL {
        let name = event.as_str();
        let listener: Listener = Arc::new(move |change: &RowChange| {
            println!("[{name}] {}.{} {}", change.schema, change.table, change.new);
        });
        client.subscribe_to_event(name, listener);
    }
}

fn printing_callbacks(label: &'static str) -> ConversationCallbacks {
    ConversationCallbacks::default()
        .with_message(move |payload| println!("[{label}] message {payload}"))
        .with_typing(move |sender| println!("[{label}] {sender} is typing"))
        .with_typing_stopped(move |sender| println!("[{label}] {sender} stopped typing"))
}

async fn sign_in(client: &RealtimeClient, user_id: &UserId) {
    client
        .orchestrator()
        .on_auth_event(AuthEvent::SignedIn(AuthSession {
            user_id: user_id.clone(),
            access_token: format!("loopback-{user_id}"),
        }))
        .await;
}

async fn run_loopback(settings: &RealtimeSettings, user_id: UserId, peer: Option<UserId>) -> Result<()> {
    let hub = LoopbackHub::new();
    let me = RealtimeClient::new_with_status_updater(hub.connect(), Arc::new(NoopStatusUpdater), settings);
    sign_in(&me, &user_id).await;
    print_notifications(&me);

    let Some(peer_id) = peer else {
        tokio::time::sleep(Duration::from_millis(50)).await;
        println!("online: {:?}", me.online_users());
        me.shutdown().await;
        return Ok(());
    };

    let other = RealtimeClient::new_with_status_updater(hub.connect(), Arc::new(NoopStatusUpdater), settings);
    sign_in(&other, &peer_id).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("online: {:?}", me.online_users());

    let peer_view = other.open_individual_chat(&user_id, printing_callbacks("peer")).await;
    let my_view = me.open_individual_chat(&peer_id, printing_callbacks("me")).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    me.send_typing_indicator(ChatType::Individual, peer_id.as_str(), true)
        .await;
    me.send_broadcast(
        ChatType::Individual,
        peer_id.as_str(),
        MESSAGE_EVENT,
        json!({ "sender_id": user_id, "content": "hello from the loopback hub" }),
    )
    .await;
    hub.emit_row_change(RowChange::new(
        RowEvent::Insert,
        "messages",
        json!({ "sender_id": peer_id, "receiver_id": user_id, "content": "persisted reply" }),
    ));
    tokio::time::sleep(settings.typing_timeout() + Duration::from_millis(100)).await;

    my_view.cleanup().await;
    peer_view.cleanup().await;
    other.shutdown().await;
    me.shutdown().await;
    Ok(())
}

async fn run_socket(
    settings: &RealtimeSettings,
    user_id: UserId,
    access_token: String,
    peer: Option<UserId>,
) -> Result<()> {
    let backend = Arc::new(SocketBackend::from_settings(settings)?);
    let client = RealtimeClient::new(backend, settings);
    print_notifications(&client);

    let network: Arc<dyn NetworkStatusProvider> = match &settings.network_probe_addr {
        Some(raw) => {
            let addr: SocketAddr = raw
                .parse()
                .with_context(|| format!("invalid network probe address: {raw}"))?;
            let probe = TcpProbeNetworkStatus::new(addr, settings.network_probe_interval());
            probe.spawn();
            probe
        }
        None => Arc::new(ManualNetworkStatus::default()),
    };
    let auth = Arc::new(ManualAuthSession::default());
    let token = if access_token.is_empty() {
        settings.api_key.clone()
    } else {
        access_token
    };
    auth.sign_in(user_id.clone(), token);

    let lifecycle = client.start(SignalSources {
        network,
        app_state: Arc::new(AlwaysActive::default()),
        auth: auth.clone(),
    });

    let view = match &peer {
        Some(peer_id) => {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Some(client.open_individual_chat(peer_id, printing_callbacks("chat")).await)
        }
        None => None,
    };

    info!(user_id = %user_id, "listening; press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    if let Some(view) = view {
        view.cleanup().await;
    }
    auth.sign_out();
    tokio::time::sleep(Duration::from_millis(100)).await;
    lifecycle.abort();
    client.shutdown().await;
    Ok(())
}
