use axum::{
    Json, Router,
    extract::{Extension, Path, State},
    http::StatusCode,
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::db::models::{Bot, BotSpec, TradeHistoryEntry};
use crate::web::models::{AuthenticatedUser, CreateBotRequest};
use crate::web::AppState;
use crate::web::error::AppError;

#[derive(Debug, Serialize)]
pub struct BotResponse {
    #[serde(flatten)]
    pub bot: Bot,
    /// Last time the reconciler saw the container running.
    pub last_seen: Option<DateTime<Utc>>,
}

fn to_response(app_state: &AppState, bot: Bot) -> BotResponse {
    let last_seen = app_state.reconciler.last_seen(bot.id);
    BotResponse { bot, last_seen }
}

/// Loads a bot and checks that the caller owns it. Other users' bots are
/// reported as missing.
async fn owned_bot(app_state: &AppState, user: &AuthenticatedUser, bot_id: i32) -> Result<Bot, AppError> {
    app_state
        .store
        .get_bot(bot_id)
        .await?
        .filter(|bot| bot.owner_id == user.id)
        .ok_or_else(|| AppError::NotFound(format!("Bot {bot_id} not found")))
}

async fn list_bots_handler(
    Extension(authenticated_user): Extension<AuthenticatedUser>,
    State(app_state): State<Arc<AppState>>,
) -> Result<Json<Vec<BotResponse>>, AppError> {
    let bots = app_state.store.list_bots_for_owner(authenticated_user.id).await?;
    Ok(Json(bots.into_iter().map(|bot| to_response(&app_state, bot)).collect()))
}

async fn create_bot_handler(
    Extension(authenticated_user): Extension<AuthenticatedUser>,
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<CreateBotRequest>,
) -> Result<(StatusCode, Json<BotResponse>), AppError> {
    let spec = BotSpec {
        owner_id: authenticated_user.id,
        name: payload.name,
        strategy: payload.strategy,
        symbol: payload.symbol,
        timeframe: payload.t_frame,
        quantity: payload.quantity,
        memory_cost: payload.memory_cost.unwrap_or(app_state.config.default_bot_memory_mb),
        description: payload.description,
    };
    let bot = app_state.placer.place_bot(spec).await?;
    Ok((StatusCode::CREATED, Json(to_response(&app_state, bot))))
}

async fn stop_bot_handler(
    Extension(authenticated_user): Extension<AuthenticatedUser>,
    State(app_state): State<Arc<AppState>>,
    Path(bot_id): Path<i32>,
) -> Result<Json<BotResponse>, AppError> {
    owned_bot(&app_state, &authenticated_user, bot_id).await?;
    let bot = app_state.placer.release_bot(bot_id).await?;
    Ok(Json(to_response(&app_state, bot)))
}

async fn retry_bot_handler(
    Extension(authenticated_user): Extension<AuthenticatedUser>,
    State(app_state): State<Arc<AppState>>,
    Path(bot_id): Path<i32>,
) -> Result<Json<BotResponse>, AppError> {
    owned_bot(&app_state, &authenticated_user, bot_id).await?;
    let bot = app_state.placer.retry_bot(bot_id).await?;
    Ok(Json(to_response(&app_state, bot)))
}

async fn trade_history_handler(
    Extension(authenticated_user): Extension<AuthenticatedUser>,
    State(app_state): State<Arc<AppState>>,
    Path(bot_id): Path<i32>,
) -> Result<Json<Vec<TradeHistoryEntry>>, AppError> {
    owned_bot(&app_state, &authenticated_user, bot_id).await?;
    let trades = app_state.store.list_trade_history(bot_id).await?;
    Ok(Json(trades))
}

pub fn bot_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_bots_handler).post(create_bot_handler))
        .route("/{id}/stop", post(stop_bot_handler))
        .route("/{id}/retry", post(retry_bot_handler))
        .route("/{id}/trade-history", get(trade_history_handler))
}
