//! Environment-driven configuration.
//!
//! Every knob has a default; invalid values are reported instead of being
//! silently replaced.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use assay_core::{JobKind, KindSettingsMap};

use crate::cache::CacheManagerConfig;
use crate::jobs::{DEFAULT_MAX_INPUT_BYTES, RecoveryConfig, WorkerPoolConfig};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, value: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

/// Full service configuration.
#[derive(Debug, Clone)]
pub struct AssayConfig {
    pub bind_addr: String,
    /// `None` runs on in-memory stores.
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub pool: WorkerPoolConfig,
    pub cache: CacheManagerConfig,
    pub cache_cleanup_interval: Duration,
    pub recovery: RecoveryConfig,
    pub max_input_bytes: usize,
    /// `None` disables the admin routes.
    pub admin_token: Option<String>,
    pub kinds: KindSettingsMap,
    pub analyzer_urls: HashMap<JobKind, String>,
}

impl Default for AssayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            database_url: None,
            db_max_connections: 10,
            pool: WorkerPoolConfig::default(),
            cache: CacheManagerConfig::default(),
            cache_cleanup_interval: Duration::from_secs(3600),
            recovery: RecoveryConfig::default(),
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
            admin_token: None,
            kinds: KindSettingsMap::default(),
            analyzer_urls: HashMap::new(),
        }
    }
}

impl AssayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the process environment in
    /// production, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Lookup(&lookup);
        let defaults = Self::default();

        let pool = WorkerPoolConfig {
            workers: env.positive("ASSAY_WORKERS", defaults.pool.workers)?,
            poll_interval: Duration::from_millis(env.positive("ASSAY_POLL_INTERVAL_MS", 500u64)?),
            claim_batch: env.positive("ASSAY_CLAIM_BATCH", defaults.pool.claim_batch)?,
            priority_aging: env
                .optional::<u64>("ASSAY_PRIORITY_AGING_SECS")?
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            ..defaults.pool
        };

        let cache = CacheManagerConfig {
            enabled: env.flag("ASSAY_CACHE_ENABLED", true)?,
            ttl: Duration::from_secs(env.positive("ASSAY_CACHE_TTL_SECS", 86_400u64)?),
        };

        let grace_factor = env.parse("ASSAY_RECOVERY_GRACE_FACTOR", 3.0f64)?;
        if !(grace_factor.is_finite() && grace_factor > 0.0) {
            return Err(ConfigError::invalid(
                "ASSAY_RECOVERY_GRACE_FACTOR",
                &grace_factor.to_string(),
                "must be a positive number",
            ));
        }
        let recovery = RecoveryConfig {
            grace_factor,
            interval: Duration::from_secs(env.positive("ASSAY_RECOVERY_INTERVAL_SECS", 60u64)?),
            count_attempt: env.flag("ASSAY_RECOVERY_COUNTS_ATTEMPT", false)?,
            ..defaults.recovery
        };

        let mut kinds = KindSettingsMap::default();
        let mut analyzer_urls = HashMap::new();
        for kind in JobKind::ALL {
            let prefix = format!("ASSAY_{}", kind.as_str().to_uppercase());
            let current = kinds.get(kind).clone();

            let max_attempts =
                env.positive(&format!("{prefix}_MAX_ATTEMPTS"), current.max_attempts)?;
            let timeout_secs =
                env.positive(&format!("{prefix}_TIMEOUT_SECS"), current.timeout.as_secs())?;
            kinds.update(kind, |s| {
                s.max_attempts = max_attempts;
                s.timeout = Duration::from_secs(timeout_secs);
            });

            if let Some(url) = env.raw(&format!("{prefix}_ANALYZER_URL")) {
                analyzer_urls.insert(kind, url);
            }
        }

        let database_url = env.raw("DATABASE_URL");
        if database_url.is_none() {
            warn!("DATABASE_URL not set; using in-memory stores (state is lost on restart)");
        }
        let admin_token = env.raw("ASSAY_ADMIN_TOKEN");
        if admin_token.is_none() {
            warn!("ASSAY_ADMIN_TOKEN not set; admin routes are disabled");
        }

        Ok(Self {
            bind_addr: env.raw("ASSAY_BIND_ADDR").unwrap_or(defaults.bind_addr),
            database_url,
            db_max_connections: env.positive("ASSAY_DB_MAX_CONNECTIONS", defaults.db_max_connections)?,
            pool,
            cache,
            cache_cleanup_interval: Duration::from_secs(
                env.positive("ASSAY_CACHE_CLEANUP_INTERVAL_SECS", 3600u64)?,
            ),
            recovery,
            max_input_bytes: env.positive("ASSAY_MAX_INPUT_BYTES", defaults.max_input_bytes)?,
            admin_token,
            kinds,
            analyzer_urls,
        })
    }
}

struct Lookup<'a, F>(&'a F);

impl<F> Lookup<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Non-empty trimmed value.
    fn raw(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn optional<T: FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T::Err: std::fmt::Display,
    {
        self.raw(key)
            .map(|v| {
                v.parse::<T>()
                    .map_err(|e| ConfigError::invalid(key, &v, e.to_string()))
            })
            .transpose()
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T::Err: std::fmt::Display,
    {
        Ok(self.optional(key)?.unwrap_or(default))
    }

    fn positive<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr + PartialOrd + Default + Copy + std::fmt::Display,
        T::Err: std::fmt::Display,
    {
        let value = self.parse(key, default)?;
        if value <= T::default() {
            return Err(ConfigError::invalid(key, &value.to_string(), "must be greater than zero"));
        }
        Ok(value)
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.raw(key) {
            None => Ok(default),
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::invalid(key, &v, "expected a boolean")),
            },
        }
    }
}
