use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::db::models::{Bot, WorkerServer};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrchestrationError {
    #[error("Worker {0} is unreachable: {1}")]
    Unreachable(String, String),
    #[error("Container {0} not found on worker")]
    ContainerMissing(String),
    #[error("Worker rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("Worker call timed out after {0:?}")]
    Timeout(Duration),
    #[error("Invalid worker response: {0}")]
    InvalidResponse(String),
}

/// What a worker needs to start a bot container.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerSpec {
    pub container_name: String,
    pub image: String,
    pub strategy: String,
    pub symbol: String,
    pub t_frame: String,
    pub quantity: f64,
    pub memory_limit_mb: i64,
}

impl ContainerSpec {
    pub fn for_bot(bot: &Bot, image: &str) -> Self {
        Self {
            container_name: bot.container_name.clone(),
            image: image.to_string(),
            strategy: bot.strategy.clone(),
            symbol: bot.symbol.clone(),
            t_frame: bot.timeframe.clone(),
            quantity: bot.quantity,
            memory_limit_mb: bot.memory_cost,
        }
    }
}

/// Point-in-time container state as reported by a worker. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStateSnapshot {
    pub container_id: String,
    #[serde(default)]
    pub container_name: String,
    /// Docker state: `running`, `exited`, `created`, `dead`, ...
    pub state: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, alias = "RunningFor")]
    pub running_for: String,
    #[serde(default)]
    pub logs: Vec<String>,
}

impl ContainerStateSnapshot {
    pub fn is_running(&self) -> bool {
        self.state.eq_ignore_ascii_case("running")
    }

    pub fn is_exited(&self) -> bool {
        self.state.eq_ignore_ascii_case("exited") || self.state.eq_ignore_ascii_case("dead")
    }
}

/// Starts, stops and inspects bot containers on worker servers.
#[async_trait]
pub trait ContainerOrchestrator: Send + Sync {
    async fn start_container(
        &self,
        worker: &WorkerServer,
        spec: &ContainerSpec,
    ) -> Result<String, OrchestrationError>;

    async fn stop_container(&self, worker: &WorkerServer, container_id: &str) -> Result<(), OrchestrationError>;

    async fn poll_state(
        &self,
        worker: &WorkerServer,
        container_id: &str,
    ) -> Result<ContainerStateSnapshot, OrchestrationError>;
}

#[derive(Debug, Deserialize)]
struct StartContainerResponse {
    container_id: String,
}

/// Talks to the container agent running on each worker over HTTP.
#[derive(Debug, Clone)]
pub struct WorkerAgentClient {
    client: Client,
    agent_port: u16,
}

impl WorkerAgentClient {
    pub fn new(agent_port: u16, request_timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, agent_port }
    }

    fn url(&self, worker: &WorkerServer, path: &str) -> String {
        format!("http://{}:{}{}", worker.private_ip, self.agent_port, path)
    }

    fn map_send_error(worker: &WorkerServer, e: reqwest::Error) -> OrchestrationError {
        OrchestrationError::Unreachable(worker.instance_id.clone(), e.to_string())
    }

    async fn rejected(response: reqwest::Response) -> OrchestrationError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        OrchestrationError::Rejected { status, body }
    }
}

#[async_trait]
impl ContainerOrchestrator for WorkerAgentClient {
    async fn start_container(
        &self,
        worker: &WorkerServer,
        spec: &ContainerSpec,
    ) -> Result<String, OrchestrationError> {
        debug!(worker_id = %worker.instance_id, container_name = %spec.container_name, "Requesting container start.");
        let response = self
            .client
            .post(self.url(worker, "/containers"))
            .json(spec)
            .send()
            .await
            .map_err(|e| Self::map_send_error(worker, e))?;
        if !response.status().is_success() {
            return Err(Self::rejected(response).await);
        }
        let body: StartContainerResponse = response
            .json()
            .await
            .map_err(|e| OrchestrationError::InvalidResponse(e.to_string()))?;
        Ok(body.container_id)
    }

    async fn stop_container(&self, worker: &WorkerServer, container_id: &str) -> Result<(), OrchestrationError> {
        let response = self
            .client
            .delete(self.url(worker, &format!("/containers/{container_id}")))
            .send()
            .await
            .map_err(|e| Self::map_send_error(worker, e))?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                // Already gone is as good as stopped.
                warn!(worker_id = %worker.instance_id, container_id, "Container to stop was not found.");
                Ok(())
            }
            _ => Err(Self::rejected(response).await),
        }
    }

    async fn poll_state(
        &self,
        worker: &WorkerServer,
        container_id: &str,
    ) -> Result<ContainerStateSnapshot, OrchestrationError> {
        let response = self
            .client
            .get(self.url(worker, &format!("/containers/{container_id}")))
            .send()
            .await
            .map_err(|e| Self::map_send_error(worker, e))?;
        match response.status() {
            status if status.is_success() => response
                .json::<ContainerStateSnapshot>()
                .await
                .map_err(|e| OrchestrationError::InvalidResponse(e.to_string())),
            StatusCode::NOT_FOUND => Err(OrchestrationError::ContainerMissing(container_id.to_string())),
            _ => Err(Self::rejected(response).await),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_accepts_agent_field_names() {
        let snapshot: ContainerStateSnapshot = serde_json::from_value(serde_json::json!({
            "container_id": "abc123",
            "container_name": "User1_supertrend_cool_bot",
            "state": "exited",
            "status": "Exited (137) 39 hours ago",
            "RunningFor": "39 hours ago"
        }))
        .unwrap();
        assert!(snapshot.is_exited());
        assert!(!snapshot.is_running());
        assert_eq!(snapshot.running_for, "39 hours ago");
        assert!(snapshot.logs.is_empty());
    }

    #[test]
    fn test_agent_urls() {
        let client = WorkerAgentClient::new(8001, Duration::from_secs(1));
        let worker = WorkerServer {
            instance_id: "i-1".to_string(),
            private_ip: "172.31.0.5".to_string(),
            total_memory: 550,
            available_memory: 550,
            status: crate::db::enums::WorkerStatus::Online,
            updated_at: chrono::Utc::now(),
        };
        assert_eq!(client.url(&worker, "/containers/x"), "http://172.31.0.5:8001/containers/x");
    }
}
