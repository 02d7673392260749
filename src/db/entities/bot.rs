use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "bots")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub owner_id: i32,
    pub name: String,
    pub strategy: String,
    pub symbol: String,
    pub t_frame: String,
    pub quantity: f64,
    pub memory_cost: i64,
    #[sea_orm(nullable)]
    pub description: Option<String>,
    #[sea_orm(nullable)]
    pub worker_instance_id: Option<String>,
    #[sea_orm(nullable)]
    pub container_id: Option<String>,
    #[sea_orm(unique)]
    pub container_name: String,
    pub status: String,
    pub created_at: ChronoDateTimeUtc,
    pub updated_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::user::Entity",
        from = "Column::OwnerId",
        to = "super::user::Column::Id",
        on_delete = "Cascade"
    )]
    Owner,

    #[sea_orm(
        belongs_to = "super::worker_server::Entity",
        from = "Column::WorkerInstanceId",
        to = "super::worker_server::Column::InstanceId",
        on_delete = "SetNull"
    )]
    WorkerServer,

    #[sea_orm(has_many = "super::trade_history::Entity")]
    TradeHistory,

    #[sea_orm(has_many = "super::bot_error::Entity")]
    BotErrors,
}

impl Related<super::user::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Owner.def()
    }
}

impl Related<super::worker_server::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::WorkerServer.def()
    }
}

impl Related<super::trade_history::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::TradeHistory.def()
    }
}

impl Related<super::bot_error::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::BotErrors.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
