//! In-process stand-ins for the worker agents and the exchange, used by the
//! test suite.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::db::enums::WorkerStatus;
use crate::db::models::{BotSpec, WorkerServer};
use crate::server::container_orchestrator::{
    ContainerOrchestrator, ContainerSpec, ContainerStateSnapshot, OrchestrationError,
};
use crate::services::exchange_service::{ExchangeData, ExchangeError};

pub fn online_worker(instance_id: &str, total_memory: i64) -> WorkerServer {
    WorkerServer {
        instance_id: instance_id.to_string(),
        private_ip: "10.0.0.10".to_string(),
        total_memory,
        available_memory: total_memory,
        status: WorkerStatus::Online,
        updated_at: Utc::now(),
    }
}

pub fn bot_spec(name: &str, memory_cost: i64) -> BotSpec {
    BotSpec {
        owner_id: 1,
        name: name.to_string(),
        strategy: "supertrend".to_string(),
        symbol: "ETH/USDT".to_string(),
        timeframe: "1d".to_string(),
        quantity: 0.1,
        memory_cost,
        description: None,
    }
}

#[derive(Debug, Default)]
struct OrchestratorState {
    next_container: u64,
    failing_starts: u32,
    failing_stops: u32,
    start_calls: u32,
    stop_calls: u32,
    poll_calls: u32,
    /// container id -> docker state; absent means the container is missing.
    containers: HashMap<String, (String, String)>,
    unreachable_workers: HashSet<String>,
    slow_workers: HashMap<String, Duration>,
}

/// Scriptable [`ContainerOrchestrator`].
#[derive(Debug, Default)]
pub struct MockOrchestrator {
    state: Mutex<OrchestratorState>,
}

impl MockOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut OrchestratorState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn fail_next_starts(&self, count: u32) {
        self.with_state(|s| s.failing_starts = count);
    }

    pub fn fail_next_stops(&self, count: u32) {
        self.with_state(|s| s.failing_stops = count);
    }

    pub fn start_calls(&self) -> u32 {
        self.with_state(|s| s.start_calls)
    }

    pub fn stop_calls(&self) -> u32 {
        self.with_state(|s| s.stop_calls)
    }

    pub fn poll_calls(&self) -> u32 {
        self.with_state(|s| s.poll_calls)
    }

    pub fn set_container_state(&self, container_id: &str, state: &str) {
        self.with_state(|s| {
            if let Some(entry) = s.containers.get_mut(container_id) {
                entry.1 = state.to_string();
            }
        });
    }

    pub fn container_state(&self, container_id: &str) -> Option<String> {
        self.with_state(|s| s.containers.get(container_id).map(|(_, state)| state.clone()))
    }

    pub fn remove_container(&self, container_id: &str) {
        self.with_state(|s| s.containers.remove(container_id));
    }

    pub fn set_unreachable(&self, worker_id: &str, unreachable: bool) {
        self.with_state(|s| {
            if unreachable {
                s.unreachable_workers.insert(worker_id.to_string());
            } else {
                s.unreachable_workers.remove(worker_id);
            }
        });
    }

    pub fn set_delay(&self, worker_id: &str, delay: Duration) {
        self.with_state(|s| s.slow_workers.insert(worker_id.to_string(), delay));
    }
}

#[async_trait]
impl ContainerOrchestrator for MockOrchestrator {
    async fn start_container(
        &self,
        _worker: &WorkerServer,
        spec: &ContainerSpec,
    ) -> Result<String, OrchestrationError> {
        self.with_state(|s| {
            s.start_calls += 1;
            if s.failing_starts > 0 {
                s.failing_starts -= 1;
                return Err(OrchestrationError::Rejected {
                    status: 500,
                    body: "docker daemon unavailable".to_string(),
                });
            }
            s.next_container += 1;
            let container_id = format!("ctr-{}", s.next_container);
            s.containers.insert(
                container_id.clone(),
                (spec.container_name.clone(), "running".to_string()),
            );
            Ok(container_id)
        })
    }

    async fn stop_container(&self, _worker: &WorkerServer, container_id: &str) -> Result<(), OrchestrationError> {
        self.with_state(|s| {
            s.stop_calls += 1;
            if s.failing_stops > 0 {
                s.failing_stops -= 1;
                return Err(OrchestrationError::Rejected {
                    status: 500,
                    body: "stop failed".to_string(),
                });
            }
            if let Some(entry) = s.containers.get_mut(container_id) {
                entry.1 = "exited".to_string();
            }
            Ok(())
        })
    }

    async fn poll_state(
        &self,
        worker: &WorkerServer,
        container_id: &str,
    ) -> Result<ContainerStateSnapshot, OrchestrationError> {
        let delay = self.with_state(|s| {
            s.poll_calls += 1;
            s.slow_workers.get(&worker.instance_id).copied()
        });
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.with_state(|s| {
            if s.unreachable_workers.contains(&worker.instance_id) {
                return Err(OrchestrationError::Unreachable(
                    worker.instance_id.clone(),
                    "connection refused".to_string(),
                ));
            }
            match s.containers.get(container_id) {
                Some((name, state)) => Ok(ContainerStateSnapshot {
                    container_id: container_id.to_string(),
                    container_name: name.clone(),
                    state: state.clone(),
                    status: String::new(),
                    running_for: "5 minutes".to_string(),
                    logs: Vec::new(),
                }),
                None => Err(OrchestrationError::ContainerMissing(container_id.to_string())),
            }
        })
    }
}

/// Scriptable [`ExchangeData`].
#[derive(Debug, Default)]
pub struct MockExchange {
    pnl: Mutex<HashMap<String, f64>>,
    failing: Mutex<bool>,
    delay: Mutex<Option<Duration>>,
    calls: Mutex<u32>,
}

impl MockExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_pnl(&self, order_id: &str, pnl: f64) {
        self.pnl.lock().unwrap().insert(order_id.to_string(), pnl);
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn calls(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl ExchangeData for MockExchange {
    async fn lookup_realized_pnl(&self, order_id: &str, symbol: &str) -> Result<f64, ExchangeError> {
        *self.calls.lock().unwrap() += 1;
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if *self.failing.lock().unwrap() {
            return Err(ExchangeError::Request("exchange unavailable".to_string()));
        }
        self.pnl
            .lock()
            .unwrap()
            .get(order_id)
            .copied()
            .ok_or_else(|| ExchangeError::NotFound {
                order_id: order_id.to_string(),
                symbol: symbol.to_string(),
            })
    }
}
