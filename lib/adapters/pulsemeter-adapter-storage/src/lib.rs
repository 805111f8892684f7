//! Storage adapters: SQLite and in-memory durable stores, in-memory TTL cache.

pub mod memory;
pub mod sqlite;

pub use memory::{MemoryCache, MemoryStore};
pub use sqlite::SqliteStore;
