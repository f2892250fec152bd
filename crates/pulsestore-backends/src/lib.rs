//! PulseStore Backends: production store adapters
//!
//! - [`RedisFastStore`]: the fast store over Redis hashes, sets and sorted sets
//! - [`SqliteDurableStore`]: the durable system of record over SQLite
//!
//! Both implement the traits in `pulsestore_core::store` and are meant to be
//! built once at startup and shared as `Arc<dyn ...>`.

pub mod redis_store;
pub mod sqlite_store;

pub use redis_store::RedisFastStore;
pub use sqlite_store::SqliteDurableStore;
