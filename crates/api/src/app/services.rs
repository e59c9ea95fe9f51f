//! Service wiring: stores, submitter, status reads and operator actions.

use std::sync::Arc;

use anyhow::Context;

use assay_core::KindSettingsMap;
use assay_infra::AssayConfig;
use assay_infra::cache::{CacheManager, InMemoryCacheStore, PostgresCacheStore};
use assay_infra::db;
use assay_infra::jobs::{
    AnalyzerRegistry, HttpAnalyzer, InMemoryJobStore, JobAdmin, JobStore, PostgresJobStore,
    RecoverySweeper, StatusReporter, Submitter, WorkerPool,
};

/// Shared storage plus the per-kind settings every component agrees on.
#[derive(Clone)]
pub struct Backends {
    pub jobs: Arc<dyn JobStore>,
    pub cache: CacheManager,
    pub settings: Arc<KindSettingsMap>,
}

impl Backends {
    /// Postgres when `DATABASE_URL` is configured, in-memory otherwise.
    pub async fn from_config(config: &AssayConfig) -> anyhow::Result<Self> {
        let Some(url) = config.database_url.as_deref() else {
            return Ok(Self::in_memory(config));
        };

        let pool = db::connect(url, config.db_max_connections)
            .await
            .context("failed to connect to Postgres")?;
        db::migrate(&pool)
            .await
            .context("failed to create analysis tables")?;

        Ok(Self {
            jobs: Arc::new(PostgresJobStore::new(pool.clone())),
            cache: CacheManager::new(Arc::new(PostgresCacheStore::new(pool)), config.cache.clone()),
            settings: Arc::new(config.kinds.clone()),
        })
    }

    pub fn in_memory(config: &AssayConfig) -> Self {
        Self {
            jobs: InMemoryJobStore::arc(),
            cache: CacheManager::new(Arc::new(InMemoryCacheStore::new()), config.cache.clone()),
            settings: Arc::new(config.kinds.clone()),
        }
    }

    pub fn worker_pool(&self, analyzers: AnalyzerRegistry, config: &AssayConfig) -> WorkerPool {
        WorkerPool::new(
            self.jobs.clone(),
            self.cache.clone(),
            analyzers,
            self.settings.clone(),
            config.pool.clone(),
        )
    }

    pub fn sweeper(&self, config: &AssayConfig) -> RecoverySweeper {
        RecoverySweeper::new(self.jobs.clone(), config.recovery.clone())
    }
}

/// One [`HttpAnalyzer`] per kind with a configured endpoint.
pub fn http_analyzers(config: &AssayConfig) -> AnalyzerRegistry {
    let mut registry = AnalyzerRegistry::new();
    for (kind, url) in &config.analyzer_urls {
        tracing::info!(%kind, %url, "registered HTTP analyzer");
        registry.register(*kind, Arc::new(HttpAnalyzer::new(url.clone())));
    }
    registry
}

/// Everything the HTTP handlers need.
pub struct AppServices {
    pub submitter: Submitter,
    pub status: StatusReporter,
    pub admin: JobAdmin,
    pub cache: CacheManager,
    pub admin_token: Option<String>,
}

impl AppServices {
    pub fn new(backends: &Backends, config: &AssayConfig) -> Self {
        Self {
            submitter: Submitter::new(
                backends.jobs.clone(),
                backends.cache.clone(),
                backends.settings.clone(),
            )
            .with_max_input_bytes(config.max_input_bytes),
            status: StatusReporter::new(backends.jobs.clone()),
            admin: JobAdmin::new(backends.jobs.clone()),
            cache: backends.cache.clone(),
            admin_token: config.admin_token.clone(),
        }
    }
}
