//! Idempotent response cache.
//!
//! The cache is an optimization only: a miss costs a job, a store failure is
//! logged and treated as a miss. Nothing on the submission or completion path
//! fails because of it.

pub mod manager;
pub mod postgres;
pub mod store;

pub use manager::{CacheManager, CacheManagerConfig};
pub use postgres::PostgresCacheStore;
pub use store::{CacheError, CacheStore, InMemoryCacheStore};
