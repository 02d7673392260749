use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::db::enums::WorkerStatus;
use crate::db::models::{Bot, WorkerServer};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("Unknown worker: {0}")]
    UnknownWorker(String),
    #[error("Worker {worker_id} is offline")]
    WorkerOffline { worker_id: String },
    #[error("Worker {worker_id} has {available} MiB available, {requested} MiB requested")]
    InsufficientCapacity {
        worker_id: String,
        requested: i64,
        available: i64,
    },
}

/// Ledger view of one worker. Available memory is always derived from
/// `total_memory - reserved_memory`, so heartbeats can never desynchronise it.
#[derive(Debug, Clone)]
struct WorkerSlot {
    private_ip: String,
    total_memory: i64,
    reserved_memory: i64,
    status: WorkerStatus,
    updated_at: DateTime<Utc>,
}

impl WorkerSlot {
    fn available(&self) -> i64 {
        (self.total_memory - self.reserved_memory).clamp(0, self.total_memory.max(0))
    }

    fn to_record(&self, instance_id: &str) -> WorkerServer {
        WorkerServer {
            instance_id: instance_id.to_string(),
            private_ip: self.private_ip.clone(),
            total_memory: self.total_memory,
            available_memory: self.available(),
            status: self.status,
            updated_at: self.updated_at,
        }
    }
}

/// Tracks every worker's memory reservations and liveness.
///
/// Each mutation runs inside a single `DashMap` entry guard, which serialises
/// read-then-write sequences per worker without a global lock.
#[derive(Debug, Default)]
pub struct WorkerLedger {
    workers: DashMap<String, WorkerSlot>,
}

impl WorkerLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a worker, or refreshes its address, total memory and status if
    /// it is already known. Existing reservations are kept.
    pub fn register(&self, worker: &WorkerServer) -> WorkerServer {
        let total = worker.total_memory.max(0);
        let mut entry = self
            .workers
            .entry(worker.instance_id.clone())
            .or_insert_with(|| WorkerSlot {
                private_ip: worker.private_ip.clone(),
                total_memory: total,
                reserved_memory: 0,
                status: worker.status,
                updated_at: worker.updated_at,
            });
        let slot = entry.value_mut();
        slot.private_ip = worker.private_ip.clone();
        slot.total_memory = total;
        slot.status = worker.status;
        slot.updated_at = Utc::now();
        info!(worker_id = %worker.instance_id, total_memory = total, status = %worker.status, "Worker registered.");
        slot.to_record(&worker.instance_id)
    }

    /// Restores reservations at startup from bots that still hold capacity.
    pub fn rebuild(&self, workers: &[WorkerServer], active_bots: &[Bot]) {
        self.workers.clear();
        for worker in workers {
            self.register(worker);
        }
        for bot in active_bots.iter().filter(|b| b.status.holds_reservation()) {
            let Some(worker_id) = bot.worker_instance_id.as_deref() else {
                continue;
            };
            match self.workers.get_mut(worker_id) {
                Some(mut slot) => slot.reserved_memory += bot.memory_cost,
                None => warn!(bot_id = bot.id, worker_id, "Active bot references an unknown worker."),
            }
        }
        info!(workers = self.workers.len(), "Worker ledger rebuilt.");
    }

    pub fn reserve(&self, worker_id: &str, amount: i64) -> Result<WorkerServer, LedgerError> {
        let mut slot = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| LedgerError::UnknownWorker(worker_id.to_string()))?;
        if slot.status == WorkerStatus::Offline {
            return Err(LedgerError::WorkerOffline {
                worker_id: worker_id.to_string(),
            });
        }
        let available = slot.available();
        if amount > available {
            return Err(LedgerError::InsufficientCapacity {
                worker_id: worker_id.to_string(),
                requested: amount,
                available,
            });
        }
        slot.reserved_memory += amount.max(0);
        debug!(worker_id, amount, available = slot.available(), "Reserved worker memory.");
        Ok(slot.to_record(worker_id))
    }

    pub fn release(&self, worker_id: &str, amount: i64) -> Result<WorkerServer, LedgerError> {
        let mut slot = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| LedgerError::UnknownWorker(worker_id.to_string()))?;
        slot.reserved_memory = (slot.reserved_memory - amount.max(0)).max(0);
        debug!(worker_id, amount, available = slot.available(), "Released worker memory.");
        Ok(slot.to_record(worker_id))
    }

    /// Applies a heartbeat. Only `total_memory`, `status` and the timestamp
    /// change; reservations are untouched.
    pub fn update_heartbeat(
        &self,
        worker_id: &str,
        total_memory: i64,
        status: WorkerStatus,
    ) -> Result<WorkerServer, LedgerError> {
        let mut slot = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| LedgerError::UnknownWorker(worker_id.to_string()))?;
        if slot.status != status {
            info!(worker_id, from = %slot.status, to = %status, "Worker status changed.");
        }
        slot.total_memory = total_memory.max(0);
        slot.status = status;
        slot.updated_at = Utc::now();
        Ok(slot.to_record(worker_id))
    }

    /// Marks workers offline when their last heartbeat is older than `max_age`.
    pub fn expire_stale(&self, max_age: Duration) -> Vec<String> {
        let cutoff = Utc::now() - max_age;
        let mut expired = Vec::new();
        for mut entry in self.workers.iter_mut() {
            let slot = entry.value_mut();
            if slot.status != WorkerStatus::Offline && slot.updated_at < cutoff {
                slot.status = WorkerStatus::Offline;
                expired.push(entry.key().clone());
            }
        }
        for worker_id in &expired {
            warn!(worker_id = %worker_id, "Worker heartbeat timed out. Marked offline.");
        }
        expired
    }

    /// Returns a bot's reservation to its worker. Bots that were never placed,
    /// or whose worker is gone, are skipped with a warning.
    pub fn release_for(&self, bot: &Bot) {
        let Some(worker_id) = bot.worker_instance_id.as_deref() else {
            return;
        };
        if let Err(e) = self.release(worker_id, bot.memory_cost) {
            warn!(bot_id = bot.id, error = %e, "Could not release bot reservation.");
        }
    }

    pub fn get(&self, worker_id: &str) -> Option<WorkerServer> {
        self.workers.get(worker_id).map(|slot| slot.to_record(worker_id))
    }

    /// A copy of every worker, ordered by instance id.
    pub fn snapshot(&self) -> Vec<WorkerServer> {
        let mut workers: Vec<WorkerServer> = self
            .workers
            .iter()
            .map(|entry| entry.value().to_record(entry.key()))
            .collect();
        workers.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        workers
    }
}
