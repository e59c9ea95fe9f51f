//! Job storage implementations.
//!
//! Every status edge is a *conditional* write: it names the state it expects
//! to find and does nothing (returns `Ok(None)`) when the row has moved on.
//! That conditional write is the only mutual-exclusion primitive; workers in
//! other processes coordinate through the same store.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use assay_core::{CacheKey, DomainError, Job, JobId, JobStatus, OwnerId, WorkerId};

/// Job store error.
///
/// Losing the store means no progress can be guaranteed, so callers
/// propagate this instead of swallowing it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job record rejected: {0}")]
    Domain(#[from] DomainError),
    #[error("corrupt job row: {0}")]
    Corrupt(String),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Precondition for moving a `processing` job back to `pending`.
#[derive(Debug, Clone, PartialEq)]
pub enum ResetGuard {
    /// Recovery sweep: still held by `worker_id` and still past its deadline.
    Stuck { worker_id: WorkerId, grace_factor: f64 },
    /// Administrative reset: any `processing` job.
    Any,
}

/// Job counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobStats {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.completed + self.failed
    }
}

/// Job store abstraction.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new `pending` job.
    async fn insert(&self, job: Job) -> Result<JobId, JobStoreError>;

    /// Get a job by ID.
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Oldest non-terminal job of `owner` with the same cache key, if any.
    async fn find_in_flight(
        &self,
        owner: OwnerId,
        cache_key: &CacheKey,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Claimable jobs ordered by (effective priority, created_at).
    async fn next_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        aging: Option<Duration>,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// `pending → processing`. `Ok(None)` means another worker won the race.
    async fn try_claim(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// `processing → completed`, only while `worker_id` still holds the claim.
    async fn complete(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        result: Value,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// `processing → pending` after a retryable failure.
    async fn retry(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// `processing → failed`.
    async fn fail(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// `processing` jobs whose deadline (`started_at + estimated × grace`) has passed.
    async fn list_stuck(
        &self,
        now: DateTime<Utc>,
        grace_factor: f64,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// `processing → pending` (or `→ failed` if a counted attempt exhausts the job).
    async fn reset_processing(
        &self,
        job_id: JobId,
        guard: ResetGuard,
        count_attempt: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Administrative override: `failed → pending` with a fresh attempt budget.
    async fn requeue_failed(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Get job statistics.
    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// In-memory job store for tests/dev.
///
/// A single write lock around each conditional transition gives the same
/// compare-and-set semantics as the SQL `UPDATE … WHERE status = …`.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".into()))
    }

    /// Apply `transition` to the job if `precondition` holds, atomically.
    ///
    /// The transition runs on a copy so a rejected edge leaves the stored
    /// record untouched.
    fn transition<P, T>(
        &self,
        job_id: JobId,
        precondition: P,
        transition: T,
    ) -> Result<Option<Job>, JobStoreError>
    where
        P: FnOnce(&Job) -> bool,
        T: FnOnce(&mut Job) -> Result<(), DomainError>,
    {
        let mut jobs = self.write()?;
        let Some(stored) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if !precondition(stored) {
            return Ok(None);
        }

        let mut next = stored.clone();
        transition(&mut next)?;
        next.check_invariants()?;
        *stored = next.clone();
        Ok(Some(next))
    }

    fn held_by(job: &Job, worker_id: &WorkerId) -> bool {
        job.status == JobStatus::Processing && job.worker_id.as_ref() == Some(worker_id)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> Result<JobId, JobStoreError> {
        job.check_invariants()?;
        let mut jobs = self.write()?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.get(&job_id).cloned())
    }

    async fn find_in_flight(
        &self,
        owner: OwnerId,
        cache_key: &CacheKey,
    ) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.read()?;
        Ok(jobs
            .values()
            .filter(|j| j.owner_id == owner && &j.cache_key == cache_key && !j.status.is_terminal())
            .min_by_key(|j| j.created_at)
            .cloned())
    }

    async fn next_candidates(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        aging: Option<Duration>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read()?;
        let mut candidates: Vec<_> = jobs.values().filter(|j| j.is_claimable(now)).collect();

        candidates.sort_by_key(|j| (j.effective_priority(now, aging), j.created_at));
        Ok(candidates.into_iter().take(limit).cloned().collect())
    }

    async fn try_claim(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        self.transition(
            job_id,
            |j| j.is_claimable(now),
            |j| j.claim(worker_id.clone(), now),
        )
    }

    async fn complete(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        result: Value,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        self.transition(
            job_id,
            |j| Self::held_by(j, worker_id),
            |j| j.complete(result, now),
        )
    }

    async fn retry(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        delay: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        self.transition(
            job_id,
            |j| Self::held_by(j, worker_id) && j.attempts + 1 < j.max_attempts,
            |j| j.retry(delay, now),
        )
    }

    async fn fail(
        &self,
        job_id: JobId,
        worker_id: &WorkerId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        self.transition(
            job_id,
            |j| Self::held_by(j, worker_id),
            |j| j.fail(error, now),
        )
    }

    async fn list_stuck(
        &self,
        now: DateTime<Utc>,
        grace_factor: f64,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read()?;
        let mut stuck: Vec<_> = jobs
            .values()
            .filter(|j| j.is_stuck(now, grace_factor))
            .collect();

        stuck.sort_by_key(|j| j.started_at);
        Ok(stuck.into_iter().take(limit).cloned().collect())
    }

    async fn reset_processing(
        &self,
        job_id: JobId,
        guard: ResetGuard,
        count_attempt: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        self.transition(
            job_id,
            |j| match &guard {
                ResetGuard::Stuck {
                    worker_id,
                    grace_factor,
                } => Self::held_by(j, worker_id) && j.is_stuck(now, *grace_factor),
                ResetGuard::Any => j.status == JobStatus::Processing,
            },
            |j| j.release(count_attempt, now),
        )
    }

    async fn requeue_failed(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        self.transition(
            job_id,
            |j| j.status == JobStatus::Failed,
            |j| j.requeue_failed(now),
        )
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.read()?;
        let mut stats = JobStats::default();

        for job in jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }

        Ok(stats)
    }
}
