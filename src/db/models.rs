use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::enums::{BotStatus, TradeSide, WorkerStatus};

/// A registered user.
/// Corresponds to the `users` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i32,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub hashed_password: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub hashed_password: String,
}

/// A host able to run bot containers.
/// Corresponds to the `worker_servers` table; `reserved_memory` is ledger state
/// and is never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerServer {
    pub instance_id: String,
    pub private_ip: String,
    pub total_memory: i64,
    pub available_memory: i64,
    pub status: WorkerStatus,
    pub updated_at: DateTime<Utc>,
}

/// A trading bot and its current placement.
/// Corresponds to the `bots` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bot {
    pub id: i32,
    pub owner_id: i32,
    pub name: String,
    pub strategy: String,
    pub symbol: String,
    pub timeframe: String,
    pub quantity: f64,
    pub memory_cost: i64,
    pub description: Option<String>,
    pub worker_instance_id: Option<String>,
    pub container_id: Option<String>,
    pub container_name: String,
    pub status: BotStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What a caller asks for when creating a bot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotSpec {
    pub owner_id: i32,
    pub name: String,
    pub strategy: String,
    pub symbol: String,
    pub timeframe: String,
    pub quantity: f64,
    pub memory_cost: i64,
    pub description: Option<String>,
}

impl BotSpec {
    /// The name bots identify themselves with when reporting events.
    pub fn container_name(&self) -> String {
        format!("User{}_{}_{}", self.owner_id, self.strategy, self.name)
    }
}

#[derive(Debug, Clone)]
pub struct NewBot {
    pub spec: BotSpec,
    pub container_name: String,
    pub worker_instance_id: Option<String>,
    pub status: BotStatus,
}

/// One fill reported by a bot. Append-only.
/// Corresponds to the `trade_history` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeHistoryEntry {
    pub id: i64,
    pub bot_id: i32,
    pub container_name: String,
    pub order_id: String,
    pub side: TradeSide,
    pub qty: f64,
    pub avg_price: f64,
    pub realized_pnl: Option<f64>,
    pub info: serde_json::Value,
    /// Event time in unix milliseconds.
    pub timestamp: i64,
}

#[derive(Debug, Clone)]
pub struct NewTradeHistory {
    pub bot_id: i32,
    pub container_name: String,
    pub order_id: String,
    pub side: TradeSide,
    pub qty: f64,
    pub avg_price: f64,
    pub realized_pnl: Option<f64>,
    pub info: serde_json::Value,
    pub timestamp: i64,
}

/// An error reported by (or about) a bot. Append-only.
/// Corresponds to the `bot_errors` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotErrorEntry {
    pub id: i64,
    pub bot_id: i32,
    pub container_name: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewBotError {
    pub bot_id: i32,
    pub container_name: String,
    pub error: String,
}
