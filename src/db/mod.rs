pub mod entities;
pub mod enums;
pub mod memory_store;
pub mod models;
pub mod sea_store;
pub mod store;

pub use memory_store::MemoryStore;
pub use sea_store::SeaOrmStore;
pub use store::{Persistence, StoreError};
