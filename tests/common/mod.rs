#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use botfleet::db::MemoryStore;
use botfleet::server::bot_locks::BotLocks;
use botfleet::server::bot_placement::{BotPlacer, PlacementConfig};
use botfleet::server::config::ServerConfig;
use botfleet::server::fleet_reconciler::{FleetReconciler, ReconcilerConfig};
use botfleet::server::subscription_manager::SubscriptionManager;
use botfleet::server::trade_ingest::IngestPipeline;
use botfleet::server::worker_ledger::WorkerLedger;
use botfleet::testing::{MockExchange, MockOrchestrator, online_worker};
use botfleet::web::AppState;

pub const JWT_SECRET: &str = "integration-secret";

pub struct Harness {
    pub state: Arc<AppState>,
    pub store: Arc<MemoryStore>,
    pub orchestrator: Arc<MockOrchestrator>,
    pub exchange: Arc<MockExchange>,
}

pub fn test_config() -> ServerConfig {
    ServerConfig {
        database_url: "memory".to_string(),
        jwt_secret: JWT_SECRET.to_string(),
        listen_addr: "127.0.0.1:0".to_string(),
        log_dir: "logs".to_string(),
        default_bot_memory_mb: 110,
        default_worker_memory_mb: 550,
        worker_agent_port: 8001,
        orchestration_timeout_secs: 1,
        reconcile_interval_secs: 1,
        poll_timeout_secs: 1,
        miss_threshold: 3,
        heartbeat_timeout_secs: 120,
        pnl_lookup_timeout_secs: 1,
        subscriber_buffer: 64,
        binance_base_url: "http://127.0.0.1:1".to_string(),
        binance_api_key: None,
        binance_api_secret: None,
        bot_image: "trading-bot:test".to_string(),
    }
}

pub fn harness(workers: &[(&str, i64)]) -> Harness {
    let config = Arc::new(test_config());
    let store = Arc::new(MemoryStore::new());
    let orchestrator = Arc::new(MockOrchestrator::new());
    let exchange = Arc::new(MockExchange::new());
    let ledger = Arc::new(WorkerLedger::new());
    for (id, total) in workers {
        ledger.register(&online_worker(id, *total));
    }
    let hub = Arc::new(SubscriptionManager::new(config.subscriber_buffer));
    let locks = BotLocks::new();

    let placer = Arc::new(BotPlacer::new(
        ledger.clone(),
        store.clone(),
        orchestrator.clone(),
        hub.clone(),
        locks.clone(),
        PlacementConfig {
            bot_image: config.bot_image.clone(),
            orchestration_timeout: Duration::from_millis(200),
        },
    ));
    let reconciler = Arc::new(FleetReconciler::new(
        store.clone(),
        ledger.clone(),
        orchestrator.clone(),
        hub.clone(),
        locks,
        ReconcilerConfig {
            tick_interval: Duration::from_millis(50),
            poll_timeout: Duration::from_millis(100),
            miss_threshold: config.miss_threshold,
            heartbeat_timeout: Duration::from_secs(120),
        },
    ));
    let ingest = Arc::new(IngestPipeline::new(
        store.clone(),
        exchange.clone(),
        hub.clone(),
        Duration::from_millis(100),
    ));

    let state = Arc::new(AppState {
        store: store.clone(),
        ledger,
        placer,
        reconciler,
        ingest,
        hub,
        config,
    });
    Harness {
        state,
        store,
        orchestrator,
        exchange,
    }
}
