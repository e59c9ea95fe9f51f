//! Postgres pool and schema bootstrap.

use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

const SCHEMA: &[(&str, &str)] = &[
    (
        "analysis_jobs",
        r#"
        CREATE TABLE IF NOT EXISTS analysis_jobs (
            id                          UUID PRIMARY KEY,
            owner_id                    UUID NOT NULL,
            kind                        TEXT NOT NULL,
            input_data                  JSONB NOT NULL,
            cache_key                   TEXT NOT NULL,
            priority                    INTEGER NOT NULL,
            status                      TEXT NOT NULL
                CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
            attempts                    INTEGER NOT NULL DEFAULT 0 CHECK (attempts >= 0),
            max_attempts                INTEGER NOT NULL CHECK (max_attempts >= 1),
            worker_id                   TEXT NULL,
            result                      JSONB NULL,
            error_message               TEXT NULL,
            estimated_duration_seconds  INTEGER NOT NULL,
            actual_duration_seconds     DOUBLE PRECISION NULL,
            not_before                  TIMESTAMPTZ NULL,
            created_at                  TIMESTAMPTZ NOT NULL,
            started_at                  TIMESTAMPTZ NULL,
            completed_at                TIMESTAMPTZ NULL,
            updated_at                  TIMESTAMPTZ NOT NULL,
            CHECK (attempts <= max_attempts)
        )
        "#,
    ),
    (
        "analysis_jobs_claim_idx",
        r#"
        CREATE INDEX IF NOT EXISTS analysis_jobs_claim_idx
            ON analysis_jobs (status, priority, created_at)
        "#,
    ),
    (
        "analysis_jobs_owner_key_idx",
        r#"
        CREATE INDEX IF NOT EXISTS analysis_jobs_owner_key_idx
            ON analysis_jobs (owner_id, cache_key)
        "#,
    ),
    (
        "analysis_cache",
        r#"
        CREATE TABLE IF NOT EXISTS analysis_cache (
            cache_key    TEXT PRIMARY KEY,
            kind         TEXT NOT NULL,
            response     JSONB NOT NULL,
            expires_at   TIMESTAMPTZ NOT NULL,
            hit_count    BIGINT NOT NULL DEFAULT 0,
            last_hit_at  TIMESTAMPTZ NULL,
            created_at   TIMESTAMPTZ NOT NULL
        )
        "#,
    ),
    (
        "analysis_cache_expires_idx",
        r#"
        CREATE INDEX IF NOT EXISTS analysis_cache_expires_idx
            ON analysis_cache (expires_at)
        "#,
    ),
];

/// Open a pool against `database_url`.
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
}

/// Create the job and cache tables if they do not exist yet. Idempotent.
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    for (name, ddl) in SCHEMA {
        sqlx::query(ddl).execute(pool).await?;
        info!(object = name, "schema object ensured");
    }
    Ok(())
}
