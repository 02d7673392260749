use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::enums::BotStatus;
use super::models::{
    Bot, BotErrorEntry, NewBot, NewBotError, NewTradeHistory, NewUser, TradeHistoryEntry, User,
    WorkerServer,
};
use super::store::{Persistence, StoreError};

/// A process-local store. Used by the test suite and by `database_url = "memory"`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    bots: RwLock<HashMap<i32, Bot>>,
    trades: RwLock<Vec<TradeHistoryEntry>>,
    errors: RwLock<Vec<BotErrorEntry>>,
    workers: RwLock<HashMap<String, WorkerServer>>,
    users: RwLock<Vec<User>>,
    next_bot_id: AtomicI32,
    next_user_id: AtomicI32,
    next_entry_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn bot_errors(&self) -> Vec<BotErrorEntry> {
        self.errors.read().await.clone()
    }

    async fn mutate_bot<F>(&self, bot_id: i32, f: F) -> Result<Bot, StoreError>
    where
        F: FnOnce(&mut Bot),
    {
        let mut bots = self.bots.write().await;
        let bot = bots
            .get_mut(&bot_id)
            .ok_or_else(|| StoreError::NotFound(format!("bot {bot_id}")))?;
        f(bot);
        bot.updated_at = Utc::now();
        Ok(bot.clone())
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    async fn save_bot(&self, new_bot: NewBot) -> Result<Bot, StoreError> {
        let mut bots = self.bots.write().await;
        if bots.values().any(|b| b.container_name == new_bot.container_name) {
            return Err(StoreError::Conflict(format!(
                "container name {} already in use",
                new_bot.container_name
            )));
        }
        let id = self.next_bot_id.fetch_add(1, Ordering::Relaxed) + 1;
        let now = Utc::now();
        let spec = new_bot.spec;
        let bot = Bot {
            id,
            owner_id: spec.owner_id,
            name: spec.name,
            strategy: spec.strategy,
            symbol: spec.symbol,
            timeframe: spec.timeframe,
            quantity: spec.quantity,
            memory_cost: spec.memory_cost,
            description: spec.description,
            worker_instance_id: new_bot.worker_instance_id,
            container_id: None,
            container_name: new_bot.container_name,
            status: new_bot.status,
            created_at: now,
            updated_at: now,
        };
        bots.insert(id, bot.clone());
        Ok(bot)
    }

    async fn get_bot(&self, bot_id: i32) -> Result<Option<Bot>, StoreError> {
        Ok(self.bots.read().await.get(&bot_id).cloned())
    }

    async fn find_bot_by_container_name(&self, container_name: &str) -> Result<Option<Bot>, StoreError> {
        Ok(self
            .bots
            .read()
            .await
            .values()
            .find(|b| b.container_name == container_name)
            .cloned())
    }

    async fn list_bots_for_owner(&self, owner_id: i32) -> Result<Vec<Bot>, StoreError> {
        let mut bots: Vec<Bot> = self
            .bots
            .read()
            .await
            .values()
            .filter(|b| b.owner_id == owner_id)
            .cloned()
            .collect();
        bots.sort_by_key(|b| b.id);
        Ok(bots)
    }

    async fn load_bots_by_status(&self, status: BotStatus) -> Result<Vec<Bot>, StoreError> {
        let mut bots: Vec<Bot> = self
            .bots
            .read()
            .await
            .values()
            .filter(|b| b.status == status)
            .cloned()
            .collect();
        bots.sort_by_key(|b| b.id);
        Ok(bots)
    }

    async fn update_bot_status(&self, bot_id: i32, status: BotStatus) -> Result<Bot, StoreError> {
        self.mutate_bot(bot_id, |bot| bot.status = status).await
    }

    async fn set_bot_placement(
        &self,
        bot_id: i32,
        worker_instance_id: &str,
        status: BotStatus,
    ) -> Result<Bot, StoreError> {
        self.mutate_bot(bot_id, |bot| {
            bot.worker_instance_id = Some(worker_instance_id.to_string());
            bot.container_id = None;
            bot.status = status;
        })
        .await
    }

    async fn set_bot_container(
        &self,
        bot_id: i32,
        container_id: &str,
        status: BotStatus,
    ) -> Result<Bot, StoreError> {
        self.mutate_bot(bot_id, |bot| {
            bot.container_id = Some(container_id.to_string());
            bot.status = status;
        })
        .await
    }

    async fn save_trade_history(&self, entry: NewTradeHistory) -> Result<TradeHistoryEntry, StoreError> {
        let record = TradeHistoryEntry {
            id: self.next_entry_id.fetch_add(1, Ordering::Relaxed) + 1,
            bot_id: entry.bot_id,
            container_name: entry.container_name,
            order_id: entry.order_id,
            side: entry.side,
            qty: entry.qty,
            avg_price: entry.avg_price,
            realized_pnl: entry.realized_pnl,
            info: entry.info,
            timestamp: entry.timestamp,
        };
        self.trades.write().await.push(record.clone());
        Ok(record)
    }

    async fn list_trade_history(&self, bot_id: i32) -> Result<Vec<TradeHistoryEntry>, StoreError> {
        Ok(self
            .trades
            .read()
            .await
            .iter()
            .filter(|t| t.bot_id == bot_id)
            .cloned()
            .collect())
    }

    async fn save_bot_error(&self, entry: NewBotError) -> Result<BotErrorEntry, StoreError> {
        let record = BotErrorEntry {
            id: self.next_entry_id.fetch_add(1, Ordering::Relaxed) + 1,
            bot_id: entry.bot_id,
            container_name: entry.container_name,
            error: entry.error,
            timestamp: Utc::now(),
        };
        self.errors.write().await.push(record.clone());
        Ok(record)
    }

    async fn save_worker(&self, worker: &WorkerServer) -> Result<(), StoreError> {
        self.workers
            .write()
            .await
            .insert(worker.instance_id.clone(), worker.clone());
        Ok(())
    }

    async fn load_workers(&self) -> Result<Vec<WorkerServer>, StoreError> {
        let mut workers: Vec<WorkerServer> = self.workers.read().await.values().cloned().collect();
        workers.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(workers)
    }

    async fn create_user(&self, user: NewUser) -> Result<User, StoreError> {
        let mut users = self.users.write().await;
        if users.iter().any(|u| u.email == user.email) {
            return Err(StoreError::Conflict(format!("email {} already registered", user.email)));
        }
        let record = User {
            id: self.next_user_id.fetch_add(1, Ordering::Relaxed) + 1,
            name: user.name,
            email: user.email,
            hashed_password: user.hashed_password,
            created_at: Utc::now(),
        };
        users.push(record.clone());
        Ok(record)
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        Ok(self.users.read().await.iter().find(|u| u.email == email).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::BotSpec;

    fn new_bot(name: &str) -> NewBot {
        let spec = BotSpec {
            owner_id: 1,
            name: name.to_string(),
            strategy: "supertrend".to_string(),
            symbol: "ETH/USDT".to_string(),
            timeframe: "1d".to_string(),
            quantity: 0.1,
            memory_cost: 110,
            description: None,
        };
        NewBot {
            container_name: spec.container_name(),
            spec,
            worker_instance_id: Some("i-1".to_string()),
            status: BotStatus::Pending,
        }
    }

    #[tokio::test]
    async fn test_container_names_are_unique() {
        let store = MemoryStore::new();
        store.save_bot(new_bot("cool_bot")).await.unwrap();
        let result = store.save_bot(new_bot("cool_bot")).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_status_queries_follow_updates() {
        let store = MemoryStore::new();
        let bot = store.save_bot(new_bot("a")).await.unwrap();
        store.set_bot_container(bot.id, "c-1", BotStatus::Running).await.unwrap();

        let running = store.load_bots_by_status(BotStatus::Running).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].container_id.as_deref(), Some("c-1"));
        assert!(store.load_bots_by_status(BotStatus::Pending).await.unwrap().is_empty());

        let found = store.find_bot_by_container_name("User1_supertrend_a").await.unwrap();
        assert_eq!(found.map(|b| b.id), Some(bot.id));
    }

    #[tokio::test]
    async fn test_update_unknown_bot_is_not_found() {
        let store = MemoryStore::new();
        let result = store.update_bot_status(42, BotStatus::Stopped).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }
}
