//! Cache manager: key derivation, TTL and fail-open reads/writes.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use assay_core::{CacheEntry, CacheKey, JobKind};

use super::store::{CacheError, CacheStore};
use crate::workers::{TaskHandle, spawn_periodic};

/// Cache manager configuration.
#[derive(Debug, Clone)]
pub struct CacheManagerConfig {
    /// Disabled: every `get` misses, every `set` is a no-op.
    pub enabled: bool,
    pub ttl: Duration,
}

impl Default for CacheManagerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Wraps a [`CacheStore`]. Storage failures never reach the caller.
#[derive(Clone)]
pub struct CacheManager {
    store: Arc<dyn CacheStore>,
    config: CacheManagerConfig,
}

impl CacheManager {
    pub fn new(store: Arc<dyn CacheStore>, config: CacheManagerConfig) -> Self {
        Self { store, config }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn ttl(&self) -> Duration {
        self.config.ttl
    }

    pub fn generate_key(&self, kind: JobKind, input: &Value) -> CacheKey {
        CacheKey::derive(kind, input)
    }

    /// Cached response for `(kind, input)`, or `None` on miss, expiry or
    /// storage failure.
    pub async fn get(&self, kind: JobKind, input: &Value) -> Option<Value> {
        self.get_by_key(&self.generate_key(kind, input)).await
    }

    pub async fn get_by_key(&self, key: &CacheKey) -> Option<Value> {
        if !self.config.enabled {
            return None;
        }
        match self.store.hit(key, Utc::now()).await {
            Ok(Some(entry)) => {
                debug!(cache_key = %key, hit_count = entry.hit_count, "cache hit");
                Some(entry.response)
            }
            Ok(None) => {
                debug!(cache_key = %key, "cache miss");
                None
            }
            Err(err) => {
                warn!(cache_key = %key, error = %err, "cache read failed; treating as miss");
                None
            }
        }
    }

    /// Store `response` for `(kind, input)` with a fresh TTL and zero hits.
    pub async fn set(&self, kind: JobKind, input: &Value, response: Value) {
        let key = self.generate_key(kind, input);
        self.set_by_key(key, kind, response).await;
    }

    pub async fn set_by_key(&self, key: CacheKey, kind: JobKind, response: Value) {
        if !self.config.enabled {
            return;
        }
        let ttl = chrono::Duration::from_std(self.config.ttl)
            .unwrap_or_else(|_| chrono::Duration::days(3650));
        let entry = CacheEntry::new(key.clone(), kind, response, Utc::now(), ttl);
        if let Err(err) = self.store.upsert(entry).await {
            warn!(cache_key = %key, error = %err, "cache write failed; continuing without cache");
        }
    }

    /// Bulk-delete expired rows. Unlike `get`/`set`, errors are returned.
    pub async fn cleanup(&self) -> Result<u64, CacheError> {
        let removed = self.store.delete_expired(Utc::now()).await?;
        if removed > 0 {
            info!(removed, "expired cache entries removed");
        }
        Ok(removed)
    }

    pub async fn entry_count(&self) -> Result<u64, CacheError> {
        self.store.count().await
    }

    /// Run [`CacheManager::cleanup`] every `interval`.
    pub fn spawn_cleanup(&self, interval: Duration) -> TaskHandle {
        let manager = self.clone();
        spawn_periodic("cache-janitor", interval, move || {
            let manager = manager.clone();
            async move {
                if let Err(err) = manager.cleanup().await {
                    warn!(error = %err, "cache cleanup failed");
                }
            }
        })
    }
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
