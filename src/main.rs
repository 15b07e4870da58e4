use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use clap::Parser;
use log::{error, info};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, watch};

use karere_relay::config::Config;
use karere_relay::connection::{ConnectionManager, ConnectionState, SessionEvent};
use karere_relay::relay::{CommandContext, RelayHandle, RelayServer, ServerEvent};
use karere_relay::store::Store;
use karere_relay::supervisor::{HealthReport, Supervisor};
use karere_relay::sync::{SyncEngine, SyncRequest};
use karere_relay::upstream::{DetachedUpstream, UpstreamService};

const CLEANUP_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);
const INCREMENTAL_PERIOD: Duration = Duration::from_secs(5 * 60);

#[derive(Parser)]
#[command(name = "karere-relay", about = "Local WhatsApp relay and sync cache")]
struct Args {
    /// Address the relay WebSocket listens on.
    #[arg(long, default_value = "127.0.0.1:8765")]
    bind: String,
    /// SQLite cache location.
    #[arg(long, default_value = "karere.db")]
    database: String,
}

fn main() {
    let args = Args::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    let config = Config {
        bind_addr: args.bind,
        database_path: args.database,
    };

    rt.block_on(async {
        if let Err(e) = run(config).await {
            error!("Fatal: {e:#}");
            std::process::exit(1);
        }
    });
}

async fn run(config: Config) -> anyhow::Result<()> {
    // Storage failure at startup is fatal; everywhere else it degrades.
    let store = Arc::new(Store::new(&config.database_path).await?);
    info!("Cache ready at {}", config.database_path);

    // Integration point for the messaging-protocol backend.
    let upstream: Arc<dyn UpstreamService> = Arc::new(DetachedUpstream);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let relay = RelayHandle::new();
    let supervisor = Arc::new(Supervisor::new());

    let connection = Arc::new(ConnectionManager::new(upstream.clone()));
    let conn_state = connection.state();
    let conn_task = tokio::spawn(connection.clone().run(shutdown_rx.clone()));

    spawn_session_bridge(connection.subscribe(), relay.clone());

    let (sync_tx, sync_rx) = mpsc::channel::<SyncRequest>(16);
    let engine = SyncEngine::new(store.clone(), upstream.clone(), relay.clone(), conn_state.clone());
    let sync_task = tokio::spawn(engine.run(connection.subscribe(), sync_rx, shutdown_rx.clone()));

    let listener = TcpListener::bind(&config.bind_addr).await?;
    let ctx = Arc::new(CommandContext {
        store: store.clone(),
        upstream,
        supervisor: supervisor.clone(),
        sync_tx: sync_tx.clone(),
        relay: relay.clone(),
    });
    let relay_task = tokio::spawn(
        RelayServer::new(relay.clone(), ctx).run(listener, shutdown_rx.clone()),
    );

    register_health_checks(&supervisor, store.clone(), conn_state, relay.clone());
    register_jobs(&supervisor, store, sync_tx);
    supervisor.spawn_jobs(shutdown_rx);

    supervisor.register_service("connection", move || async move {
        let _ = conn_task.await;
    });
    supervisor.register_service("sync", move || async move {
        let _ = sync_task.await;
    });
    supervisor.register_service("relay", move || async move {
        let _ = relay_task.await;
    });

    wait_for_termination().await;
    info!("Termination signal received, shutting down");
    let _ = shutdown_tx.send(true);
    supervisor.shutdown().await;
    Ok(())
}

/// Forwards session-level happenings to the UI client and keeps the
/// relay's cached snapshot in step with the connection state.
fn spawn_session_bridge(mut events: broadcast::Receiver<SessionEvent>, relay: RelayHandle) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::StateChanged(state)) => {
                    relay.send(ServerEvent::ConnectionStatus {
                        status: state.as_str().to_string(),
                    });
                    match state {
                        ConnectionState::Open => relay.send(ServerEvent::BaileysReady {}),
                        ConnectionState::Closed | ConnectionState::LoggedOut => {
                            relay.clear_snapshot();
                        }
                        ConnectionState::Connecting => {}
                    }
                }
                Ok(SessionEvent::Qr { url }) => relay.send(ServerEvent::Qr { url }),
                Ok(SessionEvent::ConnectionFailed) => {
                    relay.send(ServerEvent::error(
                        "connection_failed",
                        "gave up reconnecting after repeated failures",
                    ));
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    });
}

fn register_health_checks(
    supervisor: &Supervisor,
    store: Arc<Store>,
    conn_state: watch::Receiver<ConnectionState>,
    relay: RelayHandle,
) {
    supervisor.register_health_check("database", move || {
        let store = store.clone();
        async move {
            match store.ping().await {
                Ok(()) => HealthReport::healthy(json!({})),
                Err(e) => HealthReport::unhealthy(json!({ "error": e.to_string() })),
            }
        }
    });
    supervisor.register_health_check("connection", move || {
        let state = *conn_state.borrow();
        async move {
            let report = json!({ "state": state.as_str() });
            if state == ConnectionState::Open {
                HealthReport::healthy(report)
            } else {
                HealthReport::unhealthy(report)
            }
        }
    });
    supervisor.register_health_check("websocket", move || {
        let attached = relay.has_client();
        async move { HealthReport::healthy(json!({ "client_connected": attached })) }
    });
}

fn register_jobs(supervisor: &Supervisor, store: Arc<Store>, sync_tx: mpsc::Sender<SyncRequest>) {
    supervisor.register_job("store-cleanup", CLEANUP_PERIOD, move || {
        let store = store.clone();
        async move {
            match store.cleanup().await {
                Ok(deleted) => info!(target: "Supervisor", "Cleanup removed {deleted} messages"),
                Err(e) => error!(target: "Supervisor", "Cleanup failed: {e}"),
            }
        }
    });
    supervisor.register_job("incremental-sync", INCREMENTAL_PERIOD, move || {
        let sync_tx = sync_tx.clone();
        async move {
            let _ = sync_tx.send(SyncRequest::Incremental).await;
        }
    });
}

async fn wait_for_termination() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
