//! Postgres-backed job store.
//!
//! Every edge is one `UPDATE … WHERE <expected state> RETURNING …`
//! statement. Zero rows returned means the precondition no longer held
//! (another worker claimed first, the claim was lost, the job moved on) and
//! maps to `Ok(None)`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) on insert | `23505` | `AlreadyExists` |
//! | Database (check constraint violation) | `23514` | `Corrupt` |
//! | Anything else | N/A | `Storage` |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row};
use tracing::instrument;

use assay_core::{CacheKey, Job, JobId, JobKind, JobStatus, OwnerId, WorkerId};

use super::store::{JobStats, JobStore, JobStoreError, ResetGuard};

const JOB_COLUMNS: &str = r#"
    id, owner_id, kind, input_data, cache_key, priority, status,
    attempts, max_attempts, worker_id, result, error_message,
    estimated_duration_seconds, actual_duration_seconds, not_before,
    created_at, started_at, completed_at, updated_at
"#;

/// Job store on the `analysis_jobs` table (see [`crate::db::migrate`]).
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn fetch_job(
        &self,
        operation: &'static str,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Option<Job>, JobStoreError> {
        let row = query
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn fetch_jobs(
        &self,
        operation: &'static str,
        query: sqlx::query::Query<'_, Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        rows.iter().map(job_from_row).collect()
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, kind = %job.kind), err)]
    async fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        job.check_invariants()?;

        let sql = format!(
            "INSERT INTO analysis_jobs ({JOB_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)"
        );
        let result = sqlx::query(&sql)
            .bind(job.id.as_uuid())
            .bind(job.owner_id.as_uuid())
            .bind(job.kind.as_str())
            .bind(&job.input_data)
            .bind(job.cache_key.as_str())
            .bind(job.priority)
            .bind(job.status.as_str())
            .bind(to_i32(job.attempts))
            .bind(to_i32(job.max_attempts))
            .bind(job.worker_id.as_ref().map(|w| w.as_str().to_string()))
            .bind(&job.result)
            .bind(&job.error_message)
            .bind(to_i32(job.estimated_duration_seconds))
            .bind(job.actual_duration_seconds)
            .bind(job.not_before)
            .bind(job.created_at)
            .bind(job.started_at)
            .bind(job.completed_at)
            .bind(job.updated_at)
            .execute(&*self.pool)
            .await;

        match result {
            Ok(_) => Ok(job.id),
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("23505") => {
                Err(JobStoreError::AlreadyExists(job.id))
            }
            Err(e) => Err(map_sqlx_error("insert", e)),
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM analysis_jobs WHERE id = $1");
        let query = sqlx::query(&sql).bind(job_id.as_uuid());

        self.fetch_job("get", query).await
    }

    #[instrument(skip(self), fields(owner_id = %owner, cache_key = %cache_key), err)]
    async fn find_in_flight(
        &self,
        owner: OwnerId,
        cache_key: &CacheKey,
    ) -> Result<Option<Job>, JobStoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM analysis_jobs
            WHERE owner_id = $1 AND cache_key = $2 AND status IN ('pending', 'processing')
            ORDER BY created_at ASC
            LIMIT 1
            "#
        );
        let query = sqlx::query(&sql)
            .bind(owner.as_uuid())
            .bind(cache_key.as_str());

        self.fetch_job("find_in_flight", query).await
    }

    #[instrument(skip(self), err)]
    async fn next_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        aging: Option<Duration>,
    ) -> Result<Vec<Job>, JobStoreError> {
        // Aging: one priority band sooner per elapsed interval (NULL = off).
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM analysis_jobs
            WHERE status = 'pending' AND (not_before IS NULL OR not_before <= $1)
            ORDER BY
                priority - CASE
                    WHEN $3::double precision IS NULL OR $3::double precision <= 0 THEN 0
                    ELSE FLOOR(GREATEST(EXTRACT(EPOCH FROM ($1 - created_at)), 0) / $3::double precision)
                END ASC,
                created_at ASC
            LIMIT $2
            "#
        );
        let query = sqlx::query(&sql)
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .bind(aging.map(|d| d.as_secs_f64()));

        self.fetch_jobs("next_candidates", query).await
    }

    #[instrument(skip(self), fields(job_id = %job_id, worker_id = %worker_id), err)]
    async fn try_claim(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE analysis_jobs SET
                status = 'processing',
                worker_id = $2,
                started_at = $3,
                not_before = NULL,
                updated_at = $3
            WHERE id = $1
              AND status = 'pending'
              AND (not_before IS NULL OR not_before <= $3)
            RETURNING {JOB_COLUMNS}
            "#
        );
        let query = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .bind(worker_id.as_str())
            .bind(now);

        self.fetch_job("try_claim", query).await
    }

    #[instrument(skip(self, result), fields(job_id = %job_id, worker_id = %worker_id), err)]
    async fn complete(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        result: Value,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE analysis_jobs SET
                status = 'completed',
                result = $3,
                actual_duration_seconds = GREATEST(EXTRACT(EPOCH FROM ($4 - started_at)), 0)::double precision,
                worker_id = NULL,
                completed_at = $4,
                updated_at = $4
            WHERE id = $1 AND status = 'processing' AND worker_id = $2
            RETURNING {JOB_COLUMNS}
            "#
        );
        let query = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .bind(worker_id.as_str())
            .bind(result)
            .bind(now);

        self.fetch_job("complete", query).await
    }

    #[instrument(skip(self), fields(job_id = %job_id, worker_id = %worker_id), err)]
    async fn retry(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let not_before = Job::retry_not_before(now, delay)?;
        let sql = format!(
            r#"
            UPDATE analysis_jobs SET
                status = 'pending',
                attempts = attempts + 1,
                worker_id = NULL,
                started_at = NULL,
                not_before = $3,
                updated_at = $4
            WHERE id = $1
              AND status = 'processing'
              AND worker_id = $2
              AND attempts + 1 < max_attempts
            RETURNING {JOB_COLUMNS}
            "#
        );
        let query = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .bind(worker_id.as_str())
            .bind(not_before)
            .bind(now);

        self.fetch_job("retry", query).await
    }

    #[instrument(skip(self), fields(job_id = %job_id, worker_id = %worker_id), err)]
    async fn fail(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE analysis_jobs SET
                status = 'failed',
                attempts = LEAST(attempts + 1, max_attempts),
                error_message = $3,
                actual_duration_seconds = GREATEST(EXTRACT(EPOCH FROM ($4 - started_at)), 0)::double precision,
                worker_id = NULL,
                not_before = NULL,
                completed_at = $4,
                updated_at = $4
            WHERE id = $1 AND status = 'processing' AND worker_id = $2
            RETURNING {JOB_COLUMNS}
            "#
        );
        let query = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .bind(worker_id.as_str())
            .bind(error)
            .bind(now);

        self.fetch_job("fail", query).await
    }

    #[instrument(skip(self), err)]
    async fn list_stuck(
        &self,
        now: DateTime<Utc>,
        grace_factor: f64,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM analysis_jobs
            WHERE status = 'processing'
              AND started_at + make_interval(secs => estimated_duration_seconds * $2) < $1
            ORDER BY started_at ASC
            LIMIT $3
            "#
        );
        let query = sqlx::query(&sql)
            .bind(now)
            .bind(grace_factor.max(0.0))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX));

        self.fetch_jobs("list_stuck", query).await
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn reset_processing(
        &self,
        job_id: JobId,
        guard: ResetGuard,
        count_attempt: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let (holder, grace_factor) = match guard {
            ResetGuard::Stuck {
                worker_id,
                grace_factor,
            } => (Some(worker_id.as_str().to_string()), grace_factor.max(0.0)),
            ResetGuard::Any => (None, 0.0),
        };

        // SET expressions see the pre-update row, so `exhausted` is evaluated
        // once against the old attempt count. A counted release that uses the
        // last attempt fails the job instead of requeueing it.
        let exhausted = "($2 AND attempts + 1 >= max_attempts)";
        let sql = format!(
            r#"
            UPDATE analysis_jobs SET
                status = CASE WHEN {exhausted} THEN 'failed' ELSE 'pending' END,
                attempts = CASE WHEN $2 THEN LEAST(attempts + 1, max_attempts) ELSE attempts END,
                error_message = CASE WHEN {exhausted}
                    THEN 'abandoned by worker ' || COALESCE(worker_id, '') ELSE NULL END,
                actual_duration_seconds = CASE WHEN {exhausted}
                    THEN GREATEST(EXTRACT(EPOCH FROM ($3 - started_at)), 0)::double precision
                    ELSE NULL END,
                completed_at = CASE WHEN {exhausted} THEN $3 ELSE NULL END,
                started_at = CASE WHEN {exhausted} THEN started_at ELSE NULL END,
                worker_id = NULL,
                not_before = NULL,
                updated_at = $3
            WHERE id = $1
              AND status = 'processing'
              AND (
                $4::text IS NULL
                OR (worker_id = $4
                    AND started_at + make_interval(secs => estimated_duration_seconds * $5) < $3)
              )
            RETURNING {JOB_COLUMNS}
            "#
        );
        let query = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .bind(count_attempt)
            .bind(now)
            .bind(holder)
            .bind(grace_factor);

        self.fetch_job("reset_processing", query).await
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn requeue_failed(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE analysis_jobs SET
                status = 'pending',
                attempts = 0,
                error_message = NULL,
                completed_at = NULL,
                actual_duration_seconds = NULL,
                worker_id = NULL,
                started_at = NULL,
                not_before = NULL,
                updated_at = $2
            WHERE id = $1 AND status = 'failed'
            RETURNING {JOB_COLUMNS}
            "#
        );
        let query = sqlx::query(&sql).bind(job_id.as_uuid()).bind(now);

        self.fetch_job("requeue_failed", query).await
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM analysis_jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(corrupt)?;
            let n: i64 = row.try_get("n").map_err(corrupt)?;
            let n = u64::try_from(n).unwrap_or(0);
            match status.parse::<JobStatus>()? {
                JobStatus::Pending => stats.pending = n,
                JobStatus::Processing => stats.processing = n,
                JobStatus::Completed => stats.completed = n,
                JobStatus::Failed => stats.failed = n,
            }
        }
        Ok(stats)
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    let kind: String = row.try_get("kind").map_err(corrupt)?;
    let status: String = row.try_get("status").map_err(corrupt)?;
    let cache_key: String = row.try_get("cache_key").map_err(corrupt)?;
    let worker_id: Option<String> = row.try_get("worker_id").map_err(corrupt)?;

    Ok(Job {
        id: JobId::from_uuid(row.try_get("id").map_err(corrupt)?),
        owner_id: OwnerId::from_uuid(row.try_get("owner_id").map_err(corrupt)?),
        kind: kind.parse::<JobKind>()?,
        input_data: row.try_get("input_data").map_err(corrupt)?,
        cache_key: CacheKey::from_raw(cache_key),
        priority: row.try_get("priority").map_err(corrupt)?,
        status: status.parse::<JobStatus>()?,
        attempts: from_i32(row.try_get("attempts").map_err(corrupt)?, "attempts")?,
        max_attempts: from_i32(row.try_get("max_attempts").map_err(corrupt)?, "max_attempts")?,
        worker_id: worker_id.map(WorkerId::new),
        result: row.try_get("result").map_err(corrupt)?,
        error_message: row.try_get("error_message").map_err(corrupt)?,
        estimated_duration_seconds: from_i32(
            row.try_get("estimated_duration_seconds").map_err(corrupt)?,
            "estimated_duration_seconds",
        )?,
        actual_duration_seconds: row.try_get("actual_duration_seconds").map_err(corrupt)?,
        not_before: row.try_get("not_before").map_err(corrupt)?,
        created_at: row.try_get("created_at").map_err(corrupt)?,
        started_at: row.try_get("started_at").map_err(corrupt)?,
        completed_at: row.try_get("completed_at").map_err(corrupt)?,
        updated_at: row.try_get("updated_at").map_err(corrupt)?,
    })
}

fn to_i32(n: u32) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn from_i32(n: i32, column: &str) -> Result<u32, JobStoreError> {
    u32::try_from(n).map_err(|_| JobStoreError::Corrupt(format!("negative {column}: {n}")))
}

fn corrupt(err: sqlx::Error) -> JobStoreError {
    JobStoreError::Corrupt(format!("failed to decode job row: {err}"))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23514") => JobStoreError::Corrupt(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
