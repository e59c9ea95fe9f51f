use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use assay_core::{CacheEntry, CacheKey};

/// Cache storage error. Never escapes [`super::CacheManager`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("cache storage error: {0}")]
    Storage(String),
    #[error("corrupt cache row: {0}")]
    Corrupt(String),
}

/// Persisted key/value medium with TTL and hit counters.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Atomically bump `hit_count`/`last_hit_at` of a live entry and return it.
    /// Expired and absent keys both yield `None`.
    async fn hit(&self, key: &CacheKey, now: DateTime<Utc>)
    -> Result<Option<CacheEntry>, CacheError>;

    /// Insert or overwrite the entry for `entry.cache_key`.
    async fn upsert(&self, entry: CacheEntry) -> Result<(), CacheError>;

    /// Remove entries with `expires_at < now`; returns the number removed.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, CacheError>;

    /// Number of stored rows, expired ones included.
    async fn count(&self) -> Result<u64, CacheError>;
}

/// In-memory cache store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
}

impl InMemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw entry, bypassing TTL and hit accounting.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.read().ok()?.get(key).cloned()
    }
}

fn poisoned<T>(_: T) -> CacheError {
    CacheError::Storage("cache lock poisoned".into())
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn hit(
        &self,
        key: &CacheKey,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>, CacheError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.record_hit(now);
                Ok(Some(entry.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn upsert(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        entries.insert(entry.cache_key.clone(), entry);
        Ok(())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, CacheError> {
        let mut entries = self.entries.write().map_err(poisoned)?;
        let before = entries.len();
        entries.retain(|_, e| e.expires_at >= now);
        Ok((before - entries.len()) as u64)
    }

    async fn count(&self) -> Result<u64, CacheError> {
        Ok(self.entries.read().map_err(poisoned)?.len() as u64)
    }
}
