use botfleet::db::enums::BotStatus;
use botfleet::db::{MemoryStore, Persistence, SeaOrmStore, sea_store};
use botfleet::server::bot_locks::BotLocks;
use botfleet::server::bot_placement::{BotPlacer, PlacementConfig};
use botfleet::server::config::ServerConfig;
use botfleet::server::container_orchestrator::WorkerAgentClient;
use botfleet::server::fleet_reconciler::{FleetReconciler, ReconcilerConfig};
use botfleet::server::subscription_manager::SubscriptionManager;
use botfleet::server::trade_ingest::IngestPipeline;
use botfleet::server::worker_ledger::WorkerLedger;
use botfleet::services::exchange_service::BinanceFuturesClient;
use botfleet::web::{AppState, create_axum_router};

use clap::Parser;
use sea_orm::{ConnectOptions, Database};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_appender::rolling;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,
}

fn init_logging(log_dir: &str) {
    // Log to a file: JSON format, daily rotation
    let file_appender = rolling::daily(log_dir, "server.log");
    let file_layer = fmt::layer().with_writer(file_appender).with_ansi(false).json();

    // Log to stdout: human-readable format
    let stdout_layer = fmt::layer().with_writer(std::io::stdout);

    // Default to `info,sea_orm=warn` level if RUST_LOG is not set.
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sea_orm=warn,sqlx::query=warn"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();
}

async fn open_store(config: &ServerConfig) -> Result<Arc<dyn Persistence>, Box<dyn std::error::Error + Send + Sync>> {
    if config.uses_memory_store() {
        warn!("Using the in-memory store. Nothing will survive a restart.");
        return Ok(Arc::new(MemoryStore::new()));
    }
    let mut opt = ConnectOptions::new(config.database_url.clone());
    opt.max_connections(10).sqlx_logging(false);
    let db = Database::connect(opt).await?;
    sea_store::ensure_schema(&db).await?;
    info!("Database connected and schema ensured.");
    Ok(Arc::new(SeaOrmStore::new(db)))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    // --- Server Config Setup ---
    let server_config = Arc::new(ServerConfig::load(args.config.as_deref())?);
    init_logging(&server_config.log_dir);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting botfleet server.");

    let store = open_store(&server_config).await?;

    // --- Fleet State ---
    let ledger = Arc::new(WorkerLedger::new());
    let workers = store.load_workers().await?;
    let mut active_bots = store.load_bots_by_status(BotStatus::Running).await?;
    active_bots.extend(store.load_bots_by_status(BotStatus::Pending).await?);
    ledger.rebuild(&workers, &active_bots);

    let hub = Arc::new(SubscriptionManager::new(server_config.subscriber_buffer));
    let locks = BotLocks::new();
    let orchestrator = Arc::new(WorkerAgentClient::new(
        server_config.worker_agent_port,
        server_config.orchestration_timeout(),
    ));

    let placer = Arc::new(BotPlacer::new(
        ledger.clone(),
        store.clone(),
        orchestrator.clone(),
        hub.clone(),
        locks.clone(),
        PlacementConfig {
            bot_image: server_config.bot_image.clone(),
            orchestration_timeout: server_config.orchestration_timeout(),
        },
    ));
    placer.recover_interrupted().await?;

    let reconciler = Arc::new(FleetReconciler::new(
        store.clone(),
        ledger.clone(),
        orchestrator,
        hub.clone(),
        locks,
        ReconcilerConfig {
            tick_interval: server_config.reconcile_interval(),
            poll_timeout: server_config.poll_timeout(),
            miss_threshold: server_config.miss_threshold,
            heartbeat_timeout: server_config.heartbeat_timeout(),
        },
    ));

    if server_config.binance_api_key.is_none() || server_config.binance_api_secret.is_none() {
        warn!("Binance credentials are not configured. SELL fills will be stored without realized PnL.");
    }
    let exchange = Arc::new(BinanceFuturesClient::new(
        server_config.binance_base_url.clone(),
        server_config.binance_api_key.clone(),
        server_config.binance_api_secret.clone(),
        server_config.pnl_lookup_timeout(),
    ));
    let ingest = Arc::new(IngestPipeline::new(
        store.clone(),
        exchange,
        hub.clone(),
        server_config.pnl_lookup_timeout(),
    ));

    // --- Shutdown Signal ---
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C.");
            return;
        }
        info!("Shutdown requested.");
        let _ = shutdown_tx.send(());
    });

    let reconciler_task = tokio::spawn(reconciler.clone().run(shutdown_rx.clone()));

    // --- Axum HTTP Server Setup ---
    let app_state = Arc::new(AppState {
        store,
        ledger,
        placer,
        reconciler,
        ingest,
        hub,
        config: server_config.clone(),
    });
    let app = create_axum_router(app_state);

    let addr: SocketAddr = server_config.listen_addr.parse()?;
    let socket = if addr.is_ipv4() {
        tokio::net::TcpSocket::new_v4()?
    } else {
        tokio::net::TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.set_keepalive(true)?;
    socket.bind(addr)?;
    let listener = socket.listen(1024)?;
    info!(address = %addr, "HTTP server listening with TCP Keepalive");

    let mut server_shutdown = shutdown_rx;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = server_shutdown.changed().await;
        })
        .await
        .map_err(Box::new)?;

    if let Err(e) = reconciler_task.await {
        error!(error = %e, "Reconciler task failed.");
    }
    info!("Server stopped.");
    Ok(())
}
