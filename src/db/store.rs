use async_trait::async_trait;
use sea_orm::SqlErr;

use super::enums::BotStatus;
use super::models::{
    Bot, BotErrorEntry, NewBot, NewBotError, NewTradeHistory, NewUser, TradeHistoryEntry, User,
    WorkerServer,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

impl From<sea_orm::DbErr> for StoreError {
    fn from(err: sea_orm::DbErr) -> Self {
        // Unique violations (duplicate container name or email) match the in-memory store.
        match err.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(detail)) => StoreError::Conflict(detail),
            _ => StoreError::Database(err.to_string()),
        }
    }
}

/// Repository-style access to everything the fleet core persists.
///
/// Every method is a single-entity write or a plain read; implementations
/// return owned records and never load related entities lazily.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn save_bot(&self, bot: NewBot) -> Result<Bot, StoreError>;
    async fn get_bot(&self, bot_id: i32) -> Result<Option<Bot>, StoreError>;
    async fn find_bot_by_container_name(&self, container_name: &str) -> Result<Option<Bot>, StoreError>;
    async fn list_bots_for_owner(&self, owner_id: i32) -> Result<Vec<Bot>, StoreError>;
    async fn load_bots_by_status(&self, status: BotStatus) -> Result<Vec<Bot>, StoreError>;
    async fn update_bot_status(&self, bot_id: i32, status: BotStatus) -> Result<Bot, StoreError>;
    /// Records the worker a bot was placed on, together with its new status.
    async fn set_bot_placement(
        &self,
        bot_id: i32,
        worker_instance_id: &str,
        status: BotStatus,
    ) -> Result<Bot, StoreError>;
    async fn set_bot_container(
        &self,
        bot_id: i32,
        container_id: &str,
        status: BotStatus,
    ) -> Result<Bot, StoreError>;

    async fn save_trade_history(&self, entry: NewTradeHistory) -> Result<TradeHistoryEntry, StoreError>;
    async fn list_trade_history(&self, bot_id: i32) -> Result<Vec<TradeHistoryEntry>, StoreError>;
    async fn save_bot_error(&self, entry: NewBotError) -> Result<BotErrorEntry, StoreError>;

    async fn save_worker(&self, worker: &WorkerServer) -> Result<(), StoreError>;
    async fn load_workers(&self) -> Result<Vec<WorkerServer>, StoreError>;

    async fn create_user(&self, user: NewUser) -> Result<User, StoreError>;
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
}
