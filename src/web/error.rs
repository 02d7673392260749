use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use crate::db::StoreError;
use crate::server::bot_placement::PlacementError;
use crate::server::trade_ingest::IngestError;
use crate::server::worker_ledger::LedgerError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("User already exists: {0}")]
    UserAlreadyExists(String),
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Password hashing failed: {0}")]
    PasswordHashingError(String),
    #[error("JWT creation failed: {0}")]
    TokenCreationError(String),
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Internal server error: {0}")]
    InternalServerError(String),
    #[error("Not Found: {0}")]
    NotFound(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Insufficient capacity: {0}")]
    InsufficientCapacity(String),
    #[error("Worker unavailable: {0}")]
    BadGateway(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::UserAlreadyExists(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::InvalidCredentials => (StatusCode::BAD_REQUEST, "Incorrect email or password".to_string()),
            AppError::PasswordHashingError(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Password hashing error: {msg}"),
            ),
            AppError::TokenCreationError(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Token creation error: {msg}"),
            ),
            AppError::DatabaseError(msg) => {
                error!(error = %msg, "Database error while handling request.");
                (StatusCode::INTERNAL_SERVER_ERROR, format!("Database error: {msg}"))
            }
            AppError::InternalServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::InsufficientCapacity(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            AppError::BadGateway(msg) => (StatusCode::BAD_GATEWAY, msg),
        };
        (status, Json(serde_json::json!({ "error": error_message }))).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => AppError::NotFound(msg),
            StoreError::Conflict(msg) => AppError::Conflict(msg),
            StoreError::Database(msg) | StoreError::Corrupt(msg) => AppError::DatabaseError(msg),
        }
    }
}

impl From<PlacementError> for AppError {
    fn from(err: PlacementError) -> Self {
        match err {
            PlacementError::NoCapacityAvailable { .. } => AppError::InsufficientCapacity(err.to_string()),
            PlacementError::UnknownBot(_) => AppError::NotFound(err.to_string()),
            PlacementError::InvalidSpec(msg) => AppError::InvalidInput(msg),
            PlacementError::InvalidTransition { .. } => AppError::Conflict(err.to_string()),
            PlacementError::Orchestration { .. } => AppError::BadGateway(err.to_string()),
            PlacementError::Store(store_err) => store_err.into(),
        }
    }
}

impl From<LedgerError> for AppError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::UnknownWorker(_) => AppError::NotFound(err.to_string()),
            LedgerError::WorkerOffline { .. } | LedgerError::InsufficientCapacity { .. } => {
                AppError::InsufficientCapacity(err.to_string())
            }
        }
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Validation(msg) => AppError::InvalidInput(msg),
            IngestError::UnknownBot(_) => AppError::NotFound(err.to_string()),
            IngestError::Store(store_err) => store_err.into(),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InternalServerError(format!("JSON serialization/deserialization error: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let cases = [
            (AppError::from(PlacementError::NoCapacityAvailable { requested: 110 }), StatusCode::SERVICE_UNAVAILABLE),
            (AppError::from(PlacementError::UnknownBot(3)), StatusCode::NOT_FOUND),
            (AppError::from(StoreError::Conflict("dup".to_string())), StatusCode::CONFLICT),
            (AppError::from(IngestError::Validation("bad".to_string())), StatusCode::BAD_REQUEST),
            (AppError::from(LedgerError::UnknownWorker("w".to_string())), StatusCode::NOT_FOUND),
            (AppError::Unauthorized("no token".to_string()), StatusCode::UNAUTHORIZED),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }
}
