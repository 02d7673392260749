use axum::{
    Json, Router,
    extract::State,
    http::{HeaderValue, Method, header},
    middleware as axum_middleware,
    response::IntoResponse,
    routing::{get, post},
};
use axum_extra::extract::cookie::{Cookie, SameSite};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::db::Persistence;
use crate::server::bot_placement::BotPlacer;
use crate::server::config::ServerConfig;
use crate::server::fleet_reconciler::FleetReconciler;
use crate::server::subscription_manager::SubscriptionManager;
use crate::server::trade_ingest::IngestPipeline;
use crate::server::worker_ledger::WorkerLedger;
use crate::services::auth_service;
use crate::web::{
    error::AppError,
    middleware::auth,
    models::{LoginRequest, RegisterRequest, UserResponse},
    routes::{bot_routes, worker_routes},
};

pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod websocket_handler;

pub struct AppState {
    pub store: Arc<dyn Persistence>,
    pub ledger: Arc<WorkerLedger>,
    pub placer: Arc<BotPlacer>,
    pub reconciler: Arc<FleetReconciler>,
    pub ingest: Arc<IngestPipeline>,
    pub hub: Arc<SubscriptionManager>,
    pub config: Arc<ServerConfig>,
}

async fn register_handler(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<RegisterRequest>,
) -> Result<Json<UserResponse>, AppError> {
    let user = auth_service::register_user(app_state.store.as_ref(), payload).await?;
    Ok(Json(user))
}

async fn login_handler(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<LoginRequest>,
) -> Result<impl IntoResponse, AppError> {
    let login_response =
        auth_service::login_user(app_state.store.as_ref(), payload, &app_state.config.jwt_secret).await?;

    let auth_cookie = Cookie::build(("token", login_response.access_token.clone()))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(true)
        .build();
    let cookie_value = HeaderValue::from_str(&auth_cookie.to_string())
        .map_err(|e| AppError::InternalServerError(format!("Invalid cookie header: {e}")))?;

    let mut response = Json(login_response).into_response();
    response.headers_mut().insert(header::SET_COOKIE, cookie_value);
    Ok(response)
}

async fn health_check_handler() -> &'static str {
    "OK"
}

pub fn create_axum_router(app_state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(vec![Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    let auth_state = app_state.clone();
    let require_auth = move || axum_middleware::from_fn_with_state(auth_state.clone(), auth::auth);

    Router::new()
        .route("/api/health", get(health_check_handler))
        .route("/signup", post(register_handler))
        .route("/login", post(login_handler))
        .route(
            "/api/v1/user/profile",
            get(auth_service::profile).route_layer(require_auth()),
        )
        .nest("/api/v1/bots", bot_routes::bot_router().route_layer(require_auth()))
        .nest(
            "/api/v1/worker-servers",
            worker_routes::worker_router().route_layer(require_auth()),
        )
        .route("/ws/trade_history", get(websocket_handler::trade_history_handler))
        .route(
            "/ws/backtest_result/{client_id}",
            get(websocket_handler::backtest_result_handler),
        )
        .route("/ws/events", get(websocket_handler::events_handler))
        .with_state(app_state)
        .layer(cors)
}
