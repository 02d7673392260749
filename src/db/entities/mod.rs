pub mod bot;
pub mod bot_error;
pub mod trade_history;
pub mod user;
pub mod worker_server;
