use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use chrono::Utc;
use std::sync::Arc;
use tracing::warn;

use crate::db::enums::WorkerStatus;
use crate::db::models::WorkerServer;
use crate::web::AppState;
use crate::web::error::AppError;
use crate::web::models::{HeartbeatRequest, RegisterWorkerRequest};

async fn list_workers_handler(State(app_state): State<Arc<AppState>>) -> Json<Vec<WorkerServer>> {
    Json(app_state.ledger.snapshot())
}

async fn register_worker_handler(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<RegisterWorkerRequest>,
) -> Result<(StatusCode, Json<WorkerServer>), AppError> {
    let total_memory = payload
        .total_memory
        .unwrap_or(app_state.config.default_worker_memory_mb);
    if payload.instance_id.trim().is_empty() || payload.private_ip.trim().is_empty() {
        return Err(AppError::InvalidInput("instance_id and private_ip are required".to_string()));
    }
    if total_memory <= 0 {
        return Err(AppError::InvalidInput("total_memory must be positive".to_string()));
    }

    let worker = WorkerServer {
        instance_id: payload.instance_id.trim().to_string(),
        private_ip: payload.private_ip.trim().to_string(),
        total_memory,
        available_memory: total_memory,
        status: payload.status.unwrap_or(WorkerStatus::Online),
        updated_at: Utc::now(),
    };
    app_state.store.save_worker(&worker).await?;
    let registered = app_state.ledger.register(&worker);
    Ok((StatusCode::CREATED, Json(registered)))
}

async fn heartbeat_handler(
    State(app_state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Json(payload): Json<HeartbeatRequest>,
) -> Result<Json<WorkerServer>, AppError> {
    let current = app_state
        .ledger
        .get(&instance_id)
        .ok_or_else(|| AppError::NotFound(format!("Unknown worker: {instance_id}")))?;
    let total_memory = payload.total_memory.unwrap_or(current.total_memory);
    if total_memory < 0 {
        return Err(AppError::InvalidInput("total_memory must not be negative".to_string()));
    }

    let updated = app_state
        .ledger
        .update_heartbeat(&instance_id, total_memory, payload.status)?;
    // The ledger is authoritative; a failed write is repaired by the next heartbeat.
    if let Err(e) = app_state.store.save_worker(&updated).await {
        warn!(worker_id = %instance_id, error = %e, "Failed to persist worker heartbeat.");
    }
    Ok(Json(updated))
}

pub fn worker_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_workers_handler).post(register_worker_handler))
        .route("/{instance_id}/heartbeat", post(heartbeat_handler))
}
