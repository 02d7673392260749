use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Serialises lifecycle changes per bot. Unrelated bots never contend.
#[derive(Debug, Default, Clone)]
pub struct BotLocks {
    locks: Arc<DashMap<i32, Arc<Mutex<()>>>>,
}

impl BotLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, bot_id: i32) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(bot_id).or_default().clone();
        lock.lock_owned().await
    }
}
