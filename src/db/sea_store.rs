use async_trait::async_trait;
use chrono::Utc;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait,
    IntoActiveModel, QueryFilter, QueryOrder, Schema, Set,
};
use tracing::info;

use super::entities::{bot, bot_error, trade_history, user, worker_server};
use super::enums::{BotStatus, TradeSide, WorkerStatus};
use super::models::{
    Bot, BotErrorEntry, NewBot, NewBotError, NewTradeHistory, NewUser, TradeHistoryEntry, User,
    WorkerServer,
};
use super::store::{Persistence, StoreError};

/// Creates the tables the backend needs if they are missing.
pub async fn ensure_schema(db: &DatabaseConnection) -> Result<(), DbErr> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);
    // Parents before children so foreign keys resolve.
    let mut statements = vec![
        schema.create_table_from_entity(user::Entity),
        schema.create_table_from_entity(worker_server::Entity),
        schema.create_table_from_entity(bot::Entity),
        schema.create_table_from_entity(trade_history::Entity),
        schema.create_table_from_entity(bot_error::Entity),
    ];
    for statement in statements.iter_mut() {
        statement.if_not_exists();
        db.execute(backend.build(&*statement)).await?;
    }
    info!("Database schema verified.");
    Ok(())
}

/// PostgreSQL-backed [`Persistence`] using sea-orm entities.
#[derive(Clone)]
pub struct SeaOrmStore {
    db: DatabaseConnection,
}

impl SeaOrmStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    async fn find_bot_model(&self, bot_id: i32) -> Result<bot::Model, StoreError> {
        bot::Entity::find_by_id(bot_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("bot {bot_id}")))
    }
}

fn bot_from_model(model: bot::Model) -> Result<Bot, StoreError> {
    let status = model
        .status
        .parse::<BotStatus>()
        .map_err(|_| StoreError::Corrupt(format!("bot {} has status '{}'", model.id, model.status)))?;
    Ok(Bot {
        id: model.id,
        owner_id: model.owner_id,
        name: model.name,
        strategy: model.strategy,
        symbol: model.symbol,
        timeframe: model.t_frame,
        quantity: model.quantity,
        memory_cost: model.memory_cost,
        description: model.description,
        worker_instance_id: model.worker_instance_id,
        container_id: model.container_id,
        container_name: model.container_name,
        status,
        created_at: model.created_at,
        updated_at: model.updated_at,
    })
}

fn trade_from_model(model: trade_history::Model) -> Result<TradeHistoryEntry, StoreError> {
    let side = model
        .action
        .parse::<TradeSide>()
        .map_err(|_| StoreError::Corrupt(format!("trade {} has side '{}'", model.id, model.action)))?;
    Ok(TradeHistoryEntry {
        id: model.id,
        bot_id: model.bot_id,
        container_name: model.container_name,
        order_id: model.order_id,
        side,
        qty: model.qty,
        avg_price: model.avg_price,
        realized_pnl: model.realized_pnl,
        info: model.info,
        timestamp: model.timestamp,
    })
}

fn user_from_model(model: user::Model) -> User {
    User {
        id: model.id,
        name: model.name,
        email: model.email,
        hashed_password: model.hashed_password,
        created_at: model.created_at,
    }
}

fn worker_from_model(model: worker_server::Model) -> Result<WorkerServer, StoreError> {
    let status = model.status.parse::<WorkerStatus>().map_err(|_| {
        StoreError::Corrupt(format!("worker {} has status '{}'", model.instance_id, model.status))
    })?;
    Ok(WorkerServer {
        instance_id: model.instance_id,
        private_ip: model.private_ip,
        total_memory: model.total_memory,
        // Reservations are rebuilt by the ledger from active bots.
        available_memory: model.total_memory,
        status,
        updated_at: model.updated_at,
    })
}

#[async_trait]
impl Persistence for SeaOrmStore {
    async fn save_bot(&self, new_bot: NewBot) -> Result<Bot, StoreError> {
        let now = Utc::now();
        let spec = new_bot.spec;
        let active = bot::ActiveModel {
            owner_id: Set(spec.owner_id),
            name: Set(spec.name),
            strategy: Set(spec.strategy),
            symbol: Set(spec.symbol),
            t_frame: Set(spec.timeframe),
            quantity: Set(spec.quantity),
            memory_cost: Set(spec.memory_cost),
            description: Set(spec.description),
            worker_instance_id: Set(new_bot.worker_instance_id),
            container_id: Set(None),
            container_name: Set(new_bot.container_name),
            status: Set(new_bot.status.as_str().to_owned()),
            created_at: Set(now),
            updated_at: Set(now),
            ..Default::default()
        };
        bot_from_model(active.insert(&self.db).await?)
    }

    async fn get_bot(&self, bot_id: i32) -> Result<Option<Bot>, StoreError> {
        bot::Entity::find_by_id(bot_id)
            .one(&self.db)
            .await?
            .map(bot_from_model)
            .transpose()
    }

    async fn find_bot_by_container_name(&self, container_name: &str) -> Result<Option<Bot>, StoreError> {
        bot::Entity::find()
            .filter(bot::Column::ContainerName.eq(container_name))
            .one(&self.db)
            .await?
            .map(bot_from_model)
            .transpose()
    }

    async fn list_bots_for_owner(&self, owner_id: i32) -> Result<Vec<Bot>, StoreError> {
        bot::Entity::find()
            .filter(bot::Column::OwnerId.eq(owner_id))
            .order_by_asc(bot::Column::Id)
            .all(&self.db)
            .await?
            .into_iter()
            .map(bot_from_model)
            .collect()
    }

    async fn load_bots_by_status(&self, status: BotStatus) -> Result<Vec<Bot>, StoreError> {
        bot::Entity::find()
            .filter(bot::Column::Status.eq(status.as_str()))
            .order_by_asc(bot::Column::Id)
            .all(&self.db)
            .await?
            .into_iter()
            .map(bot_from_model)
            .collect()
    }

    async fn update_bot_status(&self, bot_id: i32, status: BotStatus) -> Result<Bot, StoreError> {
        let mut active = self.find_bot_model(bot_id).await?.into_active_model();
        active.status = Set(status.as_str().to_owned());
        active.updated_at = Set(Utc::now());
        bot_from_model(active.update(&self.db).await?)
    }

    async fn set_bot_placement(
        &self,
        bot_id: i32,
        worker_instance_id: &str,
        status: BotStatus,
    ) -> Result<Bot, StoreError> {
        let mut active = self.find_bot_model(bot_id).await?.into_active_model();
        active.worker_instance_id = Set(Some(worker_instance_id.to_owned()));
        active.container_id = Set(None);
        active.status = Set(status.as_str().to_owned());
        active.updated_at = Set(Utc::now());
        bot_from_model(active.update(&self.db).await?)
    }

    async fn set_bot_container(
        &self,
        bot_id: i32,
        container_id: &str,
        status: BotStatus,
    ) -> Result<Bot, StoreError> {
        let mut active = self.find_bot_model(bot_id).await?.into_active_model();
        active.container_id = Set(Some(container_id.to_owned()));
        active.status = Set(status.as_str().to_owned());
        active.updated_at = Set(Utc::now());
        bot_from_model(active.update(&self.db).await?)
    }

    async fn save_trade_history(&self, entry: NewTradeHistory) -> Result<TradeHistoryEntry, StoreError> {
        let active = trade_history::ActiveModel {
            bot_id: Set(entry.bot_id),
            container_name: Set(entry.container_name),
            order_id: Set(entry.order_id),
            action: Set(entry.side.as_str().to_owned()),
            qty: Set(entry.qty),
            avg_price: Set(entry.avg_price),
            realized_pnl: Set(entry.realized_pnl),
            info: Set(entry.info),
            timestamp: Set(entry.timestamp),
            ..Default::default()
        };
        trade_from_model(active.insert(&self.db).await?)
    }

    async fn list_trade_history(&self, bot_id: i32) -> Result<Vec<TradeHistoryEntry>, StoreError> {
        trade_history::Entity::find()
            .filter(trade_history::Column::BotId.eq(bot_id))
            .order_by_asc(trade_history::Column::Timestamp)
            .all(&self.db)
            .await?
            .into_iter()
            .map(trade_from_model)
            .collect()
    }

    async fn save_bot_error(&self, entry: NewBotError) -> Result<BotErrorEntry, StoreError> {
        let active = bot_error::ActiveModel {
            bot_id: Set(entry.bot_id),
            container_name: Set(entry.container_name),
            error: Set(entry.error),
            timestamp: Set(Utc::now()),
            ..Default::default()
        };
        let model = active.insert(&self.db).await?;
        Ok(BotErrorEntry {
            id: model.id,
            bot_id: model.bot_id,
            container_name: model.container_name,
            error: model.error,
            timestamp: model.timestamp,
        })
    }

    async fn save_worker(&self, worker: &WorkerServer) -> Result<(), StoreError> {
        let active = worker_server::ActiveModel {
            instance_id: Set(worker.instance_id.clone()),
            private_ip: Set(worker.private_ip.clone()),
            total_memory: Set(worker.total_memory),
            status: Set(worker.status.as_str().to_owned()),
            updated_at: Set(worker.updated_at),
        };
        worker_server::Entity::insert(active)
            .on_conflict(
                OnConflict::column(worker_server::Column::InstanceId)
                    .update_columns([
                        worker_server::Column::PrivateIp,
                        worker_server::Column::TotalMemory,
                        worker_server::Column::Status,
                        worker_server::Column::UpdatedAt,
                    ])
                    .to_owned(),
            )
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn load_workers(&self) -> Result<Vec<WorkerServer>, StoreError> {
        worker_server::Entity::find()
            .order_by_asc(worker_server::Column::InstanceId)
            .all(&self.db)
            .await?
            .into_iter()
            .map(worker_from_model)
            .collect()
    }

    async fn create_user(&self, new_user: NewUser) -> Result<User, StoreError> {
        let existing = user::Entity::find()
            .filter(user::Column::Email.eq(&new_user.email))
            .one(&self.db)
            .await?;
        if existing.is_some() {
            return Err(StoreError::Conflict(format!("email {} already registered", new_user.email)));
        }
        let active = user::ActiveModel {
            name: Set(new_user.name),
            email: Set(new_user.email),
            hashed_password: Set(new_user.hashed_password),
            created_at: Set(Utc::now()),
            ..Default::default()
        };
        Ok(user_from_model(active.insert(&self.db).await?))
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        Ok(user::Entity::find()
            .filter(user::Column::Email.eq(email))
            .one(&self.db)
            .await?
            .map(user_from_model))
    }
}
