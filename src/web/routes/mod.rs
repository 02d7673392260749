pub mod bot_routes;
pub mod worker_routes;
