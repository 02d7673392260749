pub mod bot_locks;
pub mod bot_placement;
pub mod config;
pub mod container_orchestrator;
pub mod fleet_reconciler;
pub mod subscription_manager;
pub mod trade_ingest;
pub mod worker_ledger;
