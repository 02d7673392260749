use serde::{Deserialize, Serialize};

use crate::db::enums::WorkerStatus;

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserResponse {
    pub id: i32,
    pub name: String,
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    pub user_id: i32,
    pub username: String,
}

// JWT Claims structure
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user name
    pub user_id: i32,
    pub email: String,
    pub exp: usize,
}

/// Struct to hold authenticated user details, to be passed as a request extension.
#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub id: i32,
    pub name: String,
    pub email: String,
}

impl From<Claims> for AuthenticatedUser {
    fn from(claims: Claims) -> Self {
        Self {
            id: claims.user_id,
            name: claims.sub,
            email: claims.email,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateBotRequest {
    pub name: String,
    pub strategy: String,
    pub symbol: String,
    #[serde(alias = "timeframe")]
    pub t_frame: String,
    pub quantity: f64,
    pub description: Option<String>,
    /// Falls back to the configured default when absent.
    pub memory_cost: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterWorkerRequest {
    pub instance_id: String,
    pub private_ip: String,
    pub total_memory: Option<i64>,
    pub status: Option<WorkerStatus>,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub total_memory: Option<i64>,
    #[serde(default = "default_heartbeat_status")]
    pub status: WorkerStatus,
}

fn default_heartbeat_status() -> WorkerStatus {
    WorkerStatus::Online
}

#[derive(Debug, Deserialize)]
pub struct WebSocketAuthQuery {
    pub token: Option<String>,
}
