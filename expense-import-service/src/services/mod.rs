//! Services module for expense-import-service.

pub mod cache;
pub mod database;
pub mod memory_store;
pub mod metrics;
pub mod providers;
pub mod store;

pub use cache::{CacheStore, ImportCache, MemoryCache, RedisCache};
pub use database::Database;
pub use memory_store::MemoryStore;
pub use metrics::{get_metrics, init_metrics};
pub use store::{ChunkTransaction, ExpenseStore, JobStore};
