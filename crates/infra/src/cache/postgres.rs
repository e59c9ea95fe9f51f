//! Postgres-backed cache store on the `analysis_cache` table.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;

use assay_core::{CacheEntry, CacheKey, JobKind};

use super::store::{CacheError, CacheStore};

#[derive(Debug, Clone)]
pub struct PostgresCacheStore {
    pool: Arc<PgPool>,
}

impl PostgresCacheStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl CacheStore for PostgresCacheStore {
    #[instrument(skip(self), fields(cache_key = %key), err)]
    async fn hit(
        &self,
        key: &CacheKey,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>, CacheError> {
        let row = sqlx::query(
            r#"
            UPDATE analysis_cache
            SET hit_count = hit_count + 1, last_hit_at = $2
            WHERE cache_key = $1 AND expires_at > $2
            RETURNING cache_key, kind, response, expires_at, hit_count, last_hit_at, created_at
            "#,
        )
        .bind(key.as_str())
        .bind(now)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("hit", e))?;

        row.as_ref().map(entry_from_row).transpose()
    }

    #[instrument(skip(self, entry), fields(cache_key = %entry.cache_key), err)]
    async fn upsert(&self, entry: CacheEntry) -> Result<(), CacheError> {
        sqlx::query(
            r#"
            INSERT INTO analysis_cache
                (cache_key, kind, response, expires_at, hit_count, last_hit_at, created_at)
            VALUES ($1, $2, $3, $4, 0, NULL, $5)
            ON CONFLICT (cache_key) DO UPDATE SET
                kind = EXCLUDED.kind,
                response = EXCLUDED.response,
                expires_at = EXCLUDED.expires_at,
                hit_count = 0,
                last_hit_at = NULL,
                created_at = EXCLUDED.created_at
            "#,
        )
        .bind(entry.cache_key.as_str())
        .bind(entry.kind.as_str())
        .bind(&entry.response)
        .bind(entry.expires_at)
        .bind(entry.created_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert", e))?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, CacheError> {
        let result = sqlx::query("DELETE FROM analysis_cache WHERE expires_at < $1")
            .bind(now)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_expired", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn count(&self) -> Result<u64, CacheError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM analysis_cache")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("count", e))?;

        Ok(u64::try_from(n).unwrap_or(0))
    }
}

fn entry_from_row(row: &PgRow) -> Result<CacheEntry, CacheError> {
    let decode = |e: sqlx::Error| CacheError::Corrupt(format!("failed to decode cache row: {e}"));

    let cache_key: String = row.try_get("cache_key").map_err(decode)?;
    let kind: String = row.try_get("kind").map_err(decode)?;
    let hit_count: i64 = row.try_get("hit_count").map_err(decode)?;

    Ok(CacheEntry {
        cache_key: CacheKey::from_raw(cache_key),
        kind: kind
            .parse::<JobKind>()
            .map_err(|e| CacheError::Corrupt(e.to_string()))?,
        response: row.try_get("response").map_err(decode)?,
        expires_at: row.try_get("expires_at").map_err(decode)?,
        hit_count: u64::try_from(hit_count).unwrap_or(0),
        last_hit_at: row.try_get("last_hit_at").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> CacheError {
    match err {
        sqlx::Error::Database(db_err) => {
            CacheError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            CacheError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => CacheError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
