pub mod auth_service;
pub mod exchange_service;
