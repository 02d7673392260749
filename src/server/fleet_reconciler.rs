use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{self, MissedTickBehavior, timeout};
use tracing::{debug, error, info, warn};

use crate::db::Persistence;
use crate::db::enums::BotStatus;
use crate::db::models::{Bot, NewBotError};
use crate::server::bot_locks::BotLocks;
use crate::server::container_orchestrator::{ContainerOrchestrator, ContainerStateSnapshot, OrchestrationError};
use crate::server::subscription_manager::{HubEvent, SubscriptionManager};
use crate::server::worker_ledger::WorkerLedger;

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub tick_interval: Duration,
    pub poll_timeout: Duration,
    /// Consecutive failed polls before a running bot is declared errored.
    pub miss_threshold: u32,
    pub heartbeat_timeout: Duration,
}

/// What one reconciliation pass did to a bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Container seen running.
    Healthy,
    /// Container exited on its own; the bot was stopped.
    Exited,
    /// Container state could not be observed.
    Missed { misses: u32 },
    /// Miss threshold reached; the bot was moved to `error`.
    Errored,
    /// Container reported a state that is neither running nor exited.
    Transitional,
    /// The bot was no longer running when its turn came.
    Skipped,
    /// A store write failed; retried on the next tick.
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub checked: usize,
    pub healthy: usize,
    pub stopped: usize,
    pub missed: usize,
    pub errored: usize,
    pub expired_workers: Vec<String>,
}

impl TickReport {
    fn record(&mut self, outcome: ReconcileOutcome) {
        self.checked += 1;
        match outcome {
            ReconcileOutcome::Healthy => self.healthy += 1,
            ReconcileOutcome::Exited => self.stopped += 1,
            ReconcileOutcome::Missed { .. } => self.missed += 1,
            ReconcileOutcome::Errored => self.errored += 1,
            ReconcileOutcome::Transitional | ReconcileOutcome::Skipped | ReconcileOutcome::Failed => {}
        }
    }
}

/// Periodically compares what the store says is running with what the
/// workers report, and corrects the store and the ledger.
pub struct FleetReconciler {
    store: Arc<dyn Persistence>,
    ledger: Arc<WorkerLedger>,
    orchestrator: Arc<dyn ContainerOrchestrator>,
    hub: Arc<SubscriptionManager>,
    locks: BotLocks,
    config: ReconcilerConfig,
    misses: DashMap<i32, u32>,
    last_seen: DashMap<i32, DateTime<Utc>>,
}

impl FleetReconciler {
    pub fn new(
        store: Arc<dyn Persistence>,
        ledger: Arc<WorkerLedger>,
        orchestrator: Arc<dyn ContainerOrchestrator>,
        hub: Arc<SubscriptionManager>,
        locks: BotLocks,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            orchestrator,
            hub,
            locks,
            config,
            misses: DashMap::new(),
            last_seen: DashMap::new(),
        }
    }

    /// Ticks until `shutdown` fires or its sender is dropped.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<()>) {
        info!(
            interval_secs = self.config.tick_interval.as_secs(),
            miss_threshold = self.config.miss_threshold,
            "Fleet reconciler started."
        );
        let mut interval = time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    info!("Fleet reconciler shutting down.");
                    break;
                }
                _ = interval.tick() => {
                    let report = self.tick().await;
                    debug!(
                        checked = report.checked,
                        healthy = report.healthy,
                        stopped = report.stopped,
                        missed = report.missed,
                        errored = report.errored,
                        "Reconcile tick finished."
                    );
                }
            }
        }
    }

    /// One full pass: expire silent workers, then check every running bot
    /// concurrently.
    pub async fn tick(self: &Arc<Self>) -> TickReport {
        let mut report = TickReport {
            expired_workers: self
                .ledger
                .expire_stale(chrono::Duration::milliseconds(self.config.heartbeat_timeout.as_millis() as i64)),
            ..TickReport::default()
        };

        let running = match self.store.load_bots_by_status(BotStatus::Running).await {
            Ok(bots) => bots,
            Err(e) => {
                error!(error = %e, "Failed to load running bots. Skipping tick.");
                return report;
            }
        };

        let running_ids: HashSet<i32> = running.iter().map(|b| b.id).collect();
        self.misses.retain(|bot_id, _| running_ids.contains(bot_id));
        self.last_seen.retain(|bot_id, _| running_ids.contains(bot_id));

        let mut tasks = JoinSet::new();
        for bot in running {
            let reconciler = Arc::clone(self);
            tasks.spawn(async move { reconciler.reconcile_bot(bot).await });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => report.record(outcome),
                Err(e) => error!(error = %e, "Reconcile task panicked."),
            }
        }
        report
    }

    pub async fn reconcile_bot(&self, bot: Bot) -> ReconcileOutcome {
        let bot_id = bot.id;
        let _guard = self.locks.acquire(bot_id).await;

        // Re-read under the lock; a stop or retry may have won the race.
        let bot = match self.store.get_bot(bot_id).await {
            Ok(Some(current)) if current.status == BotStatus::Running => current,
            Ok(_) => {
                self.misses.remove(&bot_id);
                return ReconcileOutcome::Skipped;
            }
            Err(e) => {
                warn!(bot_id, error = %e, "Could not reload bot.");
                return ReconcileOutcome::Failed;
            }
        };

        match self.observe(&bot).await {
            Ok(snapshot) if snapshot.is_running() => {
                self.misses.remove(&bot_id);
                self.last_seen.insert(bot_id, Utc::now());
                ReconcileOutcome::Healthy
            }
            Ok(snapshot) if snapshot.is_exited() => {
                info!(bot_id, state = %snapshot.state, status = %snapshot.status, "Bot container exited. Marking stopped.");
                self.misses.remove(&bot_id);
                match self.store.update_bot_status(bot_id, BotStatus::Stopped).await {
                    Ok(stopped) => {
                        self.ledger.release_for(&bot);
                        self.publish_status(&stopped);
                        ReconcileOutcome::Exited
                    }
                    Err(e) => {
                        error!(bot_id, error = %e, "Failed to persist stopped bot.");
                        ReconcileOutcome::Failed
                    }
                }
            }
            Ok(snapshot) => {
                debug!(bot_id, state = %snapshot.state, "Bot container in transitional state.");
                ReconcileOutcome::Transitional
            }
            Err(reason) => self.record_miss(&bot, reason).await,
        }
    }

    /// Last time the bot's container was seen running.
    pub fn last_seen(&self, bot_id: i32) -> Option<DateTime<Utc>> {
        self.last_seen.get(&bot_id).map(|seen| *seen)
    }

    pub fn consecutive_misses(&self, bot_id: i32) -> u32 {
        self.misses.get(&bot_id).map(|m| *m).unwrap_or(0)
    }

    async fn observe(&self, bot: &Bot) -> Result<ContainerStateSnapshot, OrchestrationError> {
        let (Some(worker_id), Some(container_id)) = (bot.worker_instance_id.as_deref(), bot.container_id.as_deref())
        else {
            return Err(OrchestrationError::InvalidResponse(
                "running bot has no worker or container".to_string(),
            ));
        };
        let worker = self
            .ledger
            .get(worker_id)
            .ok_or_else(|| OrchestrationError::Unreachable(worker_id.to_string(), "worker not registered".to_string()))?;
        timeout(self.config.poll_timeout, self.orchestrator.poll_state(&worker, container_id))
            .await
            .map_err(|_| OrchestrationError::Timeout(self.config.poll_timeout))?
    }

    async fn record_miss(&self, bot: &Bot, reason: OrchestrationError) -> ReconcileOutcome {
        let misses = {
            let mut entry = self.misses.entry(bot.id).or_insert(0);
            *entry += 1;
            *entry
        };
        if misses < self.config.miss_threshold {
            warn!(bot_id = bot.id, misses, error = %reason, "Bot container state unavailable.");
            return ReconcileOutcome::Missed { misses };
        }

        let errored = match self.store.update_bot_status(bot.id, BotStatus::Error).await {
            Ok(errored) => errored,
            Err(e) => {
                error!(bot_id = bot.id, error = %e, "Failed to persist errored bot.");
                return ReconcileOutcome::Failed;
            }
        };
        self.misses.remove(&bot.id);
        self.ledger.release_for(bot);

        let message = format!("Container unreachable for {misses} consecutive checks: {reason}");
        error!(bot_id = bot.id, misses, error = %reason, "Bot declared errored.");
        let record = NewBotError {
            bot_id: bot.id,
            container_name: bot.container_name.clone(),
            error: message.clone(),
        };
        if let Err(e) = self.store.save_bot_error(record).await {
            warn!(bot_id = bot.id, error = %e, "Failed to record reconcile error.");
        }
        self.publish_status(&errored);
        self.hub.publish(
            bot.owner_id,
            HubEvent::Alert {
                bot_id: bot.id,
                message,
            },
        );
        ReconcileOutcome::Errored
    }

    fn publish_status(&self, bot: &Bot) {
        self.hub.publish(
            bot.owner_id,
            HubEvent::BotStatusChanged {
                bot_id: bot.id,
                status: bot.status,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::server::bot_placement::{BotPlacer, PlacementConfig};
    use crate::testing::{MockOrchestrator, bot_spec, online_worker};

    struct Fixture {
        ledger: Arc<WorkerLedger>,
        store: Arc<MemoryStore>,
        orchestrator: Arc<MockOrchestrator>,
        hub: Arc<SubscriptionManager>,
        placer: BotPlacer,
        reconciler: Arc<FleetReconciler>,
    }

    fn fixture(workers: &[(&str, i64)], poll_timeout: Duration) -> Fixture {
        let ledger = Arc::new(WorkerLedger::new());
        for (id, total) in workers {
            ledger.register(&online_worker(id, *total));
        }
        let store = Arc::new(MemoryStore::new());
        let orchestrator = Arc::new(MockOrchestrator::new());
        let hub = Arc::new(SubscriptionManager::new(64));
        let locks = BotLocks::new();
        let placer = BotPlacer::new(
            ledger.clone(),
            store.clone(),
            orchestrator.clone(),
            hub.clone(),
            locks.clone(),
            PlacementConfig {
                bot_image: "bot:test".to_string(),
                orchestration_timeout: Duration::from_millis(200),
            },
        );
        let reconciler = Arc::new(FleetReconciler::new(
            store.clone(),
            ledger.clone(),
            orchestrator.clone(),
            hub.clone(),
            locks,
            ReconcilerConfig {
                tick_interval: Duration::from_millis(20),
                poll_timeout,
                miss_threshold: 3,
                heartbeat_timeout: Duration::from_secs(120),
            },
        ));
        Fixture {
            ledger,
            store,
            orchestrator,
            hub,
            placer,
            reconciler,
        }
    }

    #[tokio::test]
    async fn test_exited_container_stops_bot_and_frees_capacity() {
        let f = fixture(&[("w-1", 550)], Duration::from_millis(100));
        let bot = f.placer.place_bot(bot_spec("cool_bot", 110)).await.unwrap();
        assert_eq!(bot.status, BotStatus::Running);
        assert_eq!(f.ledger.get("w-1").unwrap().available_memory, 440);

        let report = f.reconciler.tick().await;
        assert_eq!(report.healthy, 1);
        assert!(f.reconciler.last_seen(bot.id).is_some());

        f.orchestrator
            .set_container_state(bot.container_id.as_deref().unwrap(), "exited");
        let report = f.reconciler.tick().await;
        assert_eq!(report.stopped, 1);

        let stored = f.store.get_bot(bot.id).await.unwrap().unwrap();
        assert_eq!(stored.status, BotStatus::Stopped);
        assert_eq!(f.ledger.get("w-1").unwrap().available_memory, 550);

        // Stopped bots are no longer reconciled, and their tracking is dropped.
        assert_eq!(f.reconciler.tick().await.checked, 0);
        assert!(f.reconciler.last_seen(bot.id).is_none());
        assert_eq!(f.reconciler.consecutive_misses(bot.id), 0);
    }

    #[tokio::test]
    async fn test_threshold_misses_error_bot_with_single_alert() {
        let f = fixture(&[("w-1", 550)], Duration::from_millis(100));
        let bot = f.placer.place_bot(bot_spec("cool_bot", 110)).await.unwrap();
        let mut sub = f.hub.subscribe(bot.owner_id);
        f.orchestrator.set_unreachable("w-1", true);

        assert_eq!(f.reconciler.tick().await.missed, 1);
        assert_eq!(f.reconciler.tick().await.missed, 1);
        assert_eq!(f.reconciler.consecutive_misses(bot.id), 2);
        assert_eq!(f.store.get_bot(bot.id).await.unwrap().unwrap().status, BotStatus::Running);

        assert_eq!(f.reconciler.tick().await.errored, 1);
        assert_eq!(f.store.get_bot(bot.id).await.unwrap().unwrap().status, BotStatus::Error);
        assert_eq!(f.ledger.get("w-1").unwrap().available_memory, 550);
        assert_eq!(f.store.bot_errors().await.len(), 1);

        // Further ticks leave the errored bot alone.
        assert_eq!(f.reconciler.tick().await.checked, 0);

        let mut alerts = 0;
        while let Ok(event) = sub.receiver.try_recv() {
            if matches!(*event, HubEvent::Alert { bot_id, .. } if bot_id == bot.id) {
                alerts += 1;
            }
        }
        assert_eq!(alerts, 1);
    }

    #[tokio::test]
    async fn test_successful_poll_resets_misses() {
        let f = fixture(&[("w-1", 550)], Duration::from_millis(100));
        let bot = f.placer.place_bot(bot_spec("cool_bot", 110)).await.unwrap();

        f.orchestrator.set_unreachable("w-1", true);
        f.reconciler.tick().await;
        f.reconciler.tick().await;
        f.orchestrator.set_unreachable("w-1", false);
        assert_eq!(f.reconciler.tick().await.healthy, 1);
        assert_eq!(f.reconciler.consecutive_misses(bot.id), 0);

        f.orchestrator.set_unreachable("w-1", true);
        f.reconciler.tick().await;
        f.reconciler.tick().await;
        assert_eq!(f.store.get_bot(bot.id).await.unwrap().unwrap().status, BotStatus::Running);
    }

    #[tokio::test]
    async fn test_slow_worker_counts_as_miss_without_blocking_others() {
        let f = fixture(&[("w-1", 550), ("w-2", 500)], Duration::from_millis(50));
        let fast = f.placer.place_bot(bot_spec("fast", 110)).await.unwrap();
        let slow = f.placer.place_bot(bot_spec("slow", 110)).await.unwrap();
        assert_eq!(fast.worker_instance_id.as_deref(), Some("w-1"));
        assert_eq!(slow.worker_instance_id.as_deref(), Some("w-2"));
        f.orchestrator.set_delay("w-2", Duration::from_secs(5));

        let started = std::time::Instant::now();
        let report = f.reconciler.tick().await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(report.healthy, 1);
        assert_eq!(report.missed, 1);
        assert_eq!(f.reconciler.consecutive_misses(slow.id), 1);
    }

    #[tokio::test]
    async fn test_missing_container_counts_as_miss() {
        let f = fixture(&[("w-1", 550)], Duration::from_millis(100));
        let bot = f.placer.place_bot(bot_spec("cool_bot", 110)).await.unwrap();
        f.orchestrator.remove_container(bot.container_id.as_deref().unwrap());

        let outcome = f.reconciler.reconcile_bot(bot.clone()).await;
        assert_eq!(outcome, ReconcileOutcome::Missed { misses: 1 });
    }

    #[tokio::test]
    async fn test_tick_expires_silent_workers() {
        let f = fixture(&[("w-1", 550)], Duration::from_millis(100));
        let reconciler = Arc::new(FleetReconciler::new(
            f.store.clone(),
            f.ledger.clone(),
            f.orchestrator.clone(),
            f.hub.clone(),
            BotLocks::new(),
            ReconcilerConfig {
                tick_interval: Duration::from_millis(20),
                poll_timeout: Duration::from_millis(100),
                miss_threshold: 3,
                heartbeat_timeout: Duration::ZERO,
            },
        ));
        tokio::time::sleep(Duration::from_millis(5)).await;

        let report = reconciler.tick().await;
        assert_eq!(report.expired_workers, vec!["w-1".to_string()]);
        assert!(f.placer.place_bot(bot_spec("late", 110)).await.is_err());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = fixture(&[("w-1", 550)], Duration::from_millis(100));
        f.placer.place_bot(bot_spec("cool_bot", 110)).await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(());

        let handle = tokio::spawn(f.reconciler.clone().run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(f.orchestrator.poll_calls() >= 1);

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("reconciler did not stop")
            .unwrap();
    }
}
