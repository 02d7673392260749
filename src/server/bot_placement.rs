use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::db::enums::{BotStatus, WorkerStatus};
use crate::db::models::{Bot, BotSpec, NewBot, NewBotError, WorkerServer};
use crate::db::{Persistence, StoreError};
use crate::server::bot_locks::BotLocks;
use crate::server::container_orchestrator::{ContainerOrchestrator, ContainerSpec, OrchestrationError};
use crate::server::subscription_manager::{HubEvent, SubscriptionManager};
use crate::server::worker_ledger::WorkerLedger;

/// Attempts per orchestration call: the first try plus one retry.
const ORCHESTRATION_ATTEMPTS: u32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum PlacementError {
    #[error("No online worker has {requested} MiB available")]
    NoCapacityAvailable { requested: i64 },
    #[error("Unknown bot: {0}")]
    UnknownBot(i32),
    #[error("Invalid bot spec: {0}")]
    InvalidSpec(String),
    #[error("Bot {bot_id} is {status}, cannot {action}")]
    InvalidTransition {
        bot_id: i32,
        status: BotStatus,
        action: &'static str,
    },
    #[error("Orchestration failed for bot {bot_id}: {source}")]
    Orchestration {
        bot_id: i32,
        #[source]
        source: OrchestrationError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct PlacementConfig {
    pub bot_image: String,
    pub orchestration_timeout: Duration,
}

/// Places bots on workers and drives their container lifecycle.
pub struct BotPlacer {
    ledger: Arc<WorkerLedger>,
    store: Arc<dyn Persistence>,
    orchestrator: Arc<dyn ContainerOrchestrator>,
    hub: Arc<SubscriptionManager>,
    locks: BotLocks,
    config: PlacementConfig,
}

impl BotPlacer {
    pub fn new(
        ledger: Arc<WorkerLedger>,
        store: Arc<dyn Persistence>,
        orchestrator: Arc<dyn ContainerOrchestrator>,
        hub: Arc<SubscriptionManager>,
        locks: BotLocks,
        config: PlacementConfig,
    ) -> Self {
        Self {
            ledger,
            store,
            orchestrator,
            hub,
            locks,
            config,
        }
    }

    /// Picks the online worker with the most free memory (ties go to the
    /// lowest instance id) and reserves `cost` on it. A candidate that lost a
    /// concurrent race is skipped in favour of the next one.
    fn reserve_best_fit(&self, cost: i64) -> Result<WorkerServer, PlacementError> {
        let mut candidates: Vec<WorkerServer> = self
            .ledger
            .snapshot()
            .into_iter()
            .filter(|w| w.status == WorkerStatus::Online && w.available_memory >= cost)
            .collect();
        candidates.sort_by(|a, b| {
            b.available_memory
                .cmp(&a.available_memory)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });

        for candidate in candidates {
            match self.ledger.reserve(&candidate.instance_id, cost) {
                Ok(worker) => return Ok(worker),
                Err(e) => debug!(worker_id = %candidate.instance_id, error = %e, "Candidate worker rejected reservation."),
            }
        }
        Err(PlacementError::NoCapacityAvailable { requested: cost })
    }

    pub async fn place_bot(&self, spec: BotSpec) -> Result<Bot, PlacementError> {
        validate_spec(&spec)?;
        let cost = spec.memory_cost;
        let worker = self.reserve_best_fit(cost)?;

        let new_bot = NewBot {
            container_name: spec.container_name(),
            spec,
            worker_instance_id: Some(worker.instance_id.clone()),
            status: BotStatus::Pending,
        };
        let bot = match self.store.save_bot(new_bot).await {
            Ok(bot) => bot,
            Err(e) => {
                if let Err(release_err) = self.ledger.release(&worker.instance_id, cost) {
                    warn!(error = %release_err, "Failed to undo reservation after store error.");
                }
                return Err(e.into());
            }
        };
        info!(bot_id = bot.id, worker_id = %worker.instance_id, cost, "Bot placed. Starting container.");

        let _guard = self.locks.acquire(bot.id).await;
        self.start_on_worker(bot, &worker).await
    }

    /// Starts the container of a `pending` bot that already holds a
    /// reservation on `worker`. Must be called with the bot's lock held.
    ///
    /// A bot stopped between its insert and the lock no longer holds the
    /// reservation, so it is returned as stored and no container is started.
    async fn start_on_worker(&self, bot: Bot, worker: &WorkerServer) -> Result<Bot, PlacementError> {
        let bot = self
            .store
            .get_bot(bot.id)
            .await?
            .ok_or(PlacementError::UnknownBot(bot.id))?;
        if bot.status != BotStatus::Pending {
            info!(bot_id = bot.id, status = bot.status.as_str(), "Bot left pending before its container started.");
            return Ok(bot);
        }

        let spec = ContainerSpec::for_bot(&bot, &self.config.bot_image);
        let result = self
            .with_retry(bot.id, "start_container", || {
                self.orchestrator.start_container(worker, &spec)
            })
            .await;

        match result {
            Ok(container_id) => {
                let bot = self
                    .store
                    .set_bot_container(bot.id, &container_id, BotStatus::Running)
                    .await?;
                info!(bot_id = bot.id, container_id = %container_id, "Bot container running.");
                self.publish_status(&bot);
                Ok(bot)
            }
            Err(source) => {
                error!(bot_id = bot.id, error = %source, "Bot container failed to start.");
                self.ledger.release_for(&bot);
                let bot = self.store.update_bot_status(bot.id, BotStatus::Error).await?;
                let record = NewBotError {
                    bot_id: bot.id,
                    container_name: bot.container_name.clone(),
                    error: format!("Container failed to start: {source}"),
                };
                if let Err(e) = self.store.save_bot_error(record).await {
                    warn!(bot_id = bot.id, error = %e, "Failed to record start failure.");
                }
                self.publish_status(&bot);
                Err(PlacementError::Orchestration { bot_id: bot.id, source })
            }
        }
    }

    /// Stops a bot and returns its capacity. Calling it on a stopped bot is a
    /// no-op. If the worker keeps refusing the stop, the bot is left as it was.
    pub async fn release_bot(&self, bot_id: i32) -> Result<Bot, PlacementError> {
        let _guard = self.locks.acquire(bot_id).await;
        let bot = self
            .store
            .get_bot(bot_id)
            .await?
            .ok_or(PlacementError::UnknownBot(bot_id))?;

        match bot.status {
            BotStatus::Stopped => {
                debug!(bot_id, "Bot already stopped.");
                Ok(bot)
            }
            BotStatus::Error => {
                // No reservation to return; clean up the container if we still can.
                if let Err(e) = self.stop_container_of(&bot).await {
                    warn!(bot_id, error = %e, "Could not stop container of errored bot.");
                }
                let bot = self.store.update_bot_status(bot_id, BotStatus::Stopped).await?;
                self.publish_status(&bot);
                Ok(bot)
            }
            BotStatus::Pending | BotStatus::Running => {
                self.stop_container_of(&bot)
                    .await
                    .map_err(|source| PlacementError::Orchestration { bot_id, source })?;
                self.ledger.release_for(&bot);
                let bot = self.store.update_bot_status(bot_id, BotStatus::Stopped).await?;
                info!(bot_id, "Bot stopped and capacity released.");
                self.publish_status(&bot);
                Ok(bot)
            }
        }
    }

    /// Moves an errored bot back to `pending` on a freshly chosen worker and
    /// starts it again.
    pub async fn retry_bot(&self, bot_id: i32) -> Result<Bot, PlacementError> {
        let _guard = self.locks.acquire(bot_id).await;
        let bot = self
            .store
            .get_bot(bot_id)
            .await?
            .ok_or(PlacementError::UnknownBot(bot_id))?;
        if !bot.status.can_transition_to(BotStatus::Pending) {
            return Err(PlacementError::InvalidTransition {
                bot_id,
                status: bot.status,
                action: "retry",
            });
        }
        // The old container may have outlived the error; it must not run next to the new one.
        if let Err(e) = self.stop_container_of(&bot).await {
            warn!(bot_id, error = %e, "Could not stop previous container of retried bot.");
        }

        let worker = self.reserve_best_fit(bot.memory_cost)?;
        let bot = match self
            .store
            .set_bot_placement(bot_id, &worker.instance_id, BotStatus::Pending)
            .await
        {
            Ok(bot) => bot,
            Err(e) => {
                if let Err(release_err) = self.ledger.release(&worker.instance_id, bot.memory_cost) {
                    warn!(error = %release_err, "Failed to undo reservation after store error.");
                }
                return Err(e.into());
            }
        };
        info!(bot_id, worker_id = %worker.instance_id, "Retrying errored bot.");
        self.publish_status(&bot);
        self.start_on_worker(bot, &worker).await
    }

    /// Moves bots left `pending` by a previous process to `error`, returning
    /// their reservations. Run once at startup, after the ledger is rebuilt.
    pub async fn recover_interrupted(&self) -> Result<usize, PlacementError> {
        let interrupted = self.store.load_bots_by_status(BotStatus::Pending).await?;
        for bot in &interrupted {
            let _guard = self.locks.acquire(bot.id).await;
            self.ledger.release_for(bot);
            let errored = self.store.update_bot_status(bot.id, BotStatus::Error).await?;
            let record = NewBotError {
                bot_id: bot.id,
                container_name: bot.container_name.clone(),
                error: "Server restarted before the container was confirmed running".to_string(),
            };
            if let Err(e) = self.store.save_bot_error(record).await {
                warn!(bot_id = bot.id, error = %e, "Failed to record interrupted start.");
            }
            self.publish_status(&errored);
        }
        if !interrupted.is_empty() {
            warn!(count = interrupted.len(), "Marked interrupted bot starts as errored.");
        }
        Ok(interrupted.len())
    }

    async fn stop_container_of(&self, bot: &Bot) -> Result<(), OrchestrationError> {
        let (Some(worker_id), Some(container_id)) = (bot.worker_instance_id.as_deref(), bot.container_id.as_deref())
        else {
            return Ok(());
        };
        let Some(worker) = self.ledger.get(worker_id) else {
            warn!(bot_id = bot.id, worker_id, "Worker of bot is no longer registered. Skipping container stop.");
            return Ok(());
        };
        self.with_retry(bot.id, "stop_container", || {
            self.orchestrator.stop_container(&worker, container_id)
        })
        .await
    }

    /// Runs a time-bounded orchestration call, retrying once on failure.
    async fn with_retry<T, F, Fut>(&self, bot_id: i32, operation: &'static str, call: F) -> Result<T, OrchestrationError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, OrchestrationError>>,
    {
        let limit = self.config.orchestration_timeout;
        let mut last_error = OrchestrationError::Timeout(limit);
        for attempt in 1..=ORCHESTRATION_ATTEMPTS {
            match timeout(limit, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => {
                    warn!(bot_id, operation, attempt, error = %e, "Orchestration call failed.");
                    last_error = e;
                }
                Err(_) => {
                    warn!(bot_id, operation, attempt, "Orchestration call timed out.");
                    last_error = OrchestrationError::Timeout(limit);
                }
            }
        }
        Err(last_error)
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

fn validate_spec(spec: &BotSpec) -> Result<(), PlacementError> {
    if spec.memory_cost <= 0 {
        return Err(PlacementError::InvalidSpec("memory_cost must be positive".to_string()));
    }
    if spec.name.trim().is_empty() || spec.strategy.trim().is_empty() || spec.symbol.trim().is_empty() {
        return Err(PlacementError::InvalidSpec(
            "name, strategy and symbol are required".to_string(),
        ));
    }
    if !(spec.quantity > 0.0) {
        return Err(PlacementError::InvalidSpec("quantity must be positive".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::testing::{MockOrchestrator, bot_spec, online_worker};

    struct Fixture {
        ledger: Arc<WorkerLedger>,
        store: Arc<MemoryStore>,
        orchestrator: Arc<MockOrchestrator>,
        hub: Arc<SubscriptionManager>,
        locks: BotLocks,
        placer: BotPlacer,
    }

    fn fixture(workers: &[(&str, i64)]) -> Fixture {
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
        Fixture {
            ledger,
            store,
            orchestrator,
            hub,
            locks,
            placer,
        }
    }

    #[tokio::test]
    async fn test_places_on_largest_available_worker() {
        let f = fixture(&[("w-a", 300), ("w-b", 550), ("w-c", 550)]);
        let bot = f.placer.place_bot(bot_spec("one", 110)).await.unwrap();

        // w-b and w-c tie; the lower id wins.
        assert_eq!(bot.worker_instance_id.as_deref(), Some("w-b"));
        assert_eq!(bot.status, BotStatus::Running);
        assert!(bot.container_id.is_some());
        assert_eq!(f.ledger.get("w-b").unwrap().available_memory, 440);

        let second = f.placer.place_bot(bot_spec("two", 110)).await.unwrap();
        assert_eq!(second.worker_instance_id.as_deref(), Some("w-c"));
    }

    #[tokio::test]
    async fn test_no_capacity() {
        let f = fixture(&[("w-a", 100)]);
        let err = f.placer.place_bot(bot_spec("big", 110)).await.unwrap_err();
        assert!(matches!(err, PlacementError::NoCapacityAvailable { requested: 110 }));
        assert!(f.store.list_bots_for_owner(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_skips_non_online_workers() {
        let f = fixture(&[("w-a", 550)]);
        f.ledger.update_heartbeat("w-a", 550, WorkerStatus::Degraded).unwrap();
        let err = f.placer.place_bot(bot_spec("one", 110)).await.unwrap_err();
        assert!(matches!(err, PlacementError::NoCapacityAvailable { .. }));
    }

    #[tokio::test]
    async fn test_start_failure_retries_once_then_errors() {
        let f = fixture(&[("w-a", 550)]);
        f.orchestrator.fail_next_starts(2);
        let mut sub = f.hub.subscribe(1);

        let bot_id = match f.placer.place_bot(bot_spec("flaky", 110)).await {
            Err(PlacementError::Orchestration { bot_id, .. }) => bot_id,
            other => panic!("unexpected: {other:?}"),
        };
        assert_eq!(f.orchestrator.start_calls(), 2);
        assert_eq!(f.ledger.get("w-a").unwrap().available_memory, 550);

        let bot = f.store.get_bot(bot_id).await.unwrap().unwrap();
        assert_eq!(bot.status, BotStatus::Error);
        assert_eq!(f.store.bot_errors().await.len(), 1);
        assert_eq!(
            *sub.receiver.recv().await.unwrap(),
            HubEvent::BotStatusChanged { bot_id, status: BotStatus::Error }
        );
    }

    #[tokio::test]
    async fn test_single_start_failure_is_absorbed_by_retry() {
        let f = fixture(&[("w-a", 550)]);
        f.orchestrator.fail_next_starts(1);
        let bot = f.placer.place_bot(bot_spec("flaky", 110)).await.unwrap();
        assert_eq!(bot.status, BotStatus::Running);
        assert_eq!(f.orchestrator.start_calls(), 2);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let f = fixture(&[("w-a", 550)]);
        let bot = f.placer.place_bot(bot_spec("one", 110)).await.unwrap();

        let stopped = f.placer.release_bot(bot.id).await.unwrap();
        assert_eq!(stopped.status, BotStatus::Stopped);
        assert_eq!(f.ledger.get("w-a").unwrap().available_memory, 550);

        let again = f.placer.release_bot(bot.id).await.unwrap();
        assert_eq!(again.status, BotStatus::Stopped);
        assert_eq!(f.ledger.get("w-a").unwrap().available_memory, 550);
        assert_eq!(f.orchestrator.stop_calls(), 1);
    }

    #[tokio::test]
    async fn test_release_keeps_bot_when_stop_fails() {
        let f = fixture(&[("w-a", 550)]);
        let bot = f.placer.place_bot(bot_spec("one", 110)).await.unwrap();
        f.orchestrator.fail_next_stops(2);

        let err = f.placer.release_bot(bot.id).await.unwrap_err();
        assert!(matches!(err, PlacementError::Orchestration { .. }));
        assert_eq!(f.store.get_bot(bot.id).await.unwrap().unwrap().status, BotStatus::Running);
        assert_eq!(f.ledger.get("w-a").unwrap().available_memory, 440);
    }

    #[tokio::test]
    async fn test_release_unknown_bot() {
        let f = fixture(&[]);
        assert!(matches!(f.placer.release_bot(7).await, Err(PlacementError::UnknownBot(7))));
    }

    #[tokio::test]
    async fn test_retry_moves_error_back_to_running() {
        let f = fixture(&[("w-a", 550)]);
        f.orchestrator.fail_next_starts(2);
        let bot_id = match f.placer.place_bot(bot_spec("flaky", 110)).await {
            Err(PlacementError::Orchestration { bot_id, .. }) => bot_id,
            other => panic!("unexpected: {other:?}"),
        };

        let bot = f.placer.retry_bot(bot_id).await.unwrap();
        assert_eq!(bot.status, BotStatus::Running);
        assert_eq!(f.ledger.get("w-a").unwrap().available_memory, 440);

        let err = f.placer.retry_bot(bot_id).await.unwrap_err();
        assert!(matches!(err, PlacementError::InvalidTransition { action: "retry", .. }));
    }

    #[tokio::test]
    async fn test_stop_before_start_cancels_placement() {
        let f = fixture(&[("w-a", 550)]);
        // The first bot gets id 1; hold its lock so placement parks after the insert.
        let guard = f.locks.acquire(1).await;

        let stop_while_parked = async {
            let bot = loop {
                if let Some(bot) = f.store.get_bot(1).await.unwrap() {
                    break bot;
                }
                tokio::task::yield_now().await;
            };
            assert_eq!(bot.status, BotStatus::Pending);
            // What a stop does to a bot that has no container yet.
            f.ledger.release_for(&bot);
            f.store.update_bot_status(bot.id, BotStatus::Stopped).await.unwrap();
            drop(guard);
        };
        let (placed, ()) = tokio::join!(f.placer.place_bot(bot_spec("racy", 110)), stop_while_parked);

        let placed = placed.unwrap();
        assert_eq!(placed.status, BotStatus::Stopped);
        assert_eq!(f.store.get_bot(1).await.unwrap().unwrap().status, BotStatus::Stopped);
        assert_eq!(f.orchestrator.start_calls(), 0);
        assert_eq!(f.ledger.get("w-a").unwrap().available_memory, 550);
    }

    #[tokio::test]
    async fn test_retry_stops_container_left_from_before_the_error() {
        let f = fixture(&[("w-a", 550)]);
        let bot = f.placer.place_bot(bot_spec("lost", 110)).await.unwrap();
        let old_container = bot.container_id.clone().unwrap();
        // The reconciler gave up on it while the container kept running.
        f.ledger.release_for(&bot);
        f.store.update_bot_status(bot.id, BotStatus::Error).await.unwrap();

        let retried = f.placer.retry_bot(bot.id).await.unwrap();
        assert_eq!(retried.status, BotStatus::Running);
        assert_ne!(retried.container_id.as_deref(), Some(old_container.as_str()));
        assert_eq!(f.orchestrator.stop_calls(), 1);
        assert_eq!(f.orchestrator.container_state(&old_container).as_deref(), Some("exited"));
        assert_eq!(f.ledger.get("w-a").unwrap().available_memory, 440);
    }

    #[tokio::test]
    async fn test_retry_proceeds_when_old_container_cannot_be_stopped() {
        let f = fixture(&[("w-a", 550)]);
        let bot = f.placer.place_bot(bot_spec("stubborn", 110)).await.unwrap();
        f.ledger.release_for(&bot);
        f.store.update_bot_status(bot.id, BotStatus::Error).await.unwrap();
        f.orchestrator.fail_next_stops(2);

        let retried = f.placer.retry_bot(bot.id).await.unwrap();
        assert_eq!(retried.status, BotStatus::Running);
        assert_eq!(f.orchestrator.stop_calls(), 2);
    }

    #[tokio::test]
    async fn test_recover_interrupted_pending_bots() {
        let f = fixture(&[("w-a", 550)]);
        let spec = bot_spec("half_started", 110);
        let pending = f
            .store
            .save_bot(NewBot {
                container_name: spec.container_name(),
                spec,
                worker_instance_id: Some("w-a".to_string()),
                status: BotStatus::Pending,
            })
            .await
            .unwrap();
        f.ledger
            .rebuild(&[online_worker("w-a", 550)], std::slice::from_ref(&pending));
        assert_eq!(f.ledger.get("w-a").unwrap().available_memory, 440);

        assert_eq!(f.placer.recover_interrupted().await.unwrap(), 1);
        assert_eq!(f.store.get_bot(pending.id).await.unwrap().unwrap().status, BotStatus::Error);
        assert_eq!(f.ledger.get("w-a").unwrap().available_memory, 550);
        assert_eq!(f.placer.recover_interrupted().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_spec_is_rejected_before_reserving() {
        let f = fixture(&[("w-a", 550)]);
        let err = f.placer.place_bot(bot_spec("zero", 0)).await.unwrap_err();
        assert!(matches!(err, PlacementError::InvalidSpec(_)));
        assert_eq!(f.ledger.get("w-a").unwrap().available_memory, 550);
    }
}
