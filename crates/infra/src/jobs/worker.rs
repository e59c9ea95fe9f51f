//! Worker pool: select → claim → analyze → transition.
//!
//! Workers share nothing in memory except counters. Every decision about a
//! job is made through a conditional store write, so pools in separate
//! processes can run against the same store.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use assay_core::{AnalyzerError, ErrorClass, Job, JobId, KindSettingsMap, RetryDecision, WorkerId};

use super::analyzer::AnalyzerRegistry;
use super::store::{JobStore, JobStoreError};
use crate::cache::CacheManager;
use crate::workers::{TaskHandle, sleep_or_shutdown};

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Prefix for worker ids and log fields
    pub name: String,
    /// Number of concurrent execution loops
    pub workers: usize,
    /// Sleep between polls when there is nothing to claim
    pub poll_interval: Duration,
    /// Candidates fetched per poll
    pub claim_batch: usize,
    /// Priority aging interval; `None` disables aging
    pub priority_aging: Option<Duration>,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            name: "assay-worker".to_string(),
            workers: 4,
            poll_interval: Duration::from_millis(500),
            claim_batch: 16,
            priority_aging: None,
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// Result of one [`WorkerPool::run_once`] cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Nothing was eligible.
    Idle,
    Completed { job_id: JobId },
    Retrying { job_id: JobId, delay: Duration },
    Failed { job_id: JobId, class: ErrorClass },
    /// Every candidate was claimed by someone else, or the claim was lost
    /// before the final write.
    ClaimLost,
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct PoolStats {
    pub jobs_claimed: u64,
    pub jobs_completed: u64,
    pub jobs_retried: u64,
    pub jobs_failed: u64,
    pub claims_lost: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

#[derive(Debug)]
struct PoolCounters {
    claimed: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    claims_lost: AtomicU64,
    running: AtomicUsize,
    started: Instant,
}

impl Default for PoolCounters {
    fn default() -> Self {
        Self {
            claimed: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            claims_lost: AtomicU64::new(0),
            running: AtomicUsize::new(0),
            started: Instant::now(),
        }
    }
}

impl PoolCounters {
    fn snapshot(&self) -> PoolStats {
        PoolStats {
            jobs_claimed: self.claimed.load(Ordering::Relaxed),
            jobs_completed: self.completed.load(Ordering::Relaxed),
            jobs_retried: self.retried.load(Ordering::Relaxed),
            jobs_failed: self.failed.load(Ordering::Relaxed),
            claims_lost: self.claims_lost.load(Ordering::Relaxed),
            current_running: self.running.load(Ordering::Relaxed),
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl<'a> RunningGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Handle to a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    tasks: TaskHandle,
    counters: Arc<PoolCounters>,
}

impl WorkerPoolHandle {
    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot()
    }

    pub fn worker_count(&self) -> usize {
        self.tasks.task_count()
    }

    /// Stop claiming and wait for in-progress jobs to finish.
    pub async fn shutdown(self) {
        self.tasks.shutdown().await;
    }
}

/// Executes jobs with the analyzers registered per kind.
pub struct WorkerPool {
    store: Arc<dyn JobStore>,
    cache: CacheManager,
    analyzers: AnalyzerRegistry,
    settings: Arc<KindSettingsMap>,
    config: WorkerPoolConfig,
    counters: Arc<PoolCounters>,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn JobStore>,
        cache: CacheManager,
        analyzers: AnalyzerRegistry,
        settings: Arc<KindSettingsMap>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            store,
            cache,
            analyzers,
            settings,
            config,
            counters: Arc::new(PoolCounters::default()),
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot()
    }

    /// Start `config.workers` execution loops.
    pub fn spawn(self) -> WorkerPoolHandle {
        let missing = self.analyzers.missing_kinds();
        if !missing.is_empty() {
            warn!(pool = %self.config.name, ?missing, "no analyzer registered; these jobs will fail");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = TaskHandle::new(self.config.name.clone(), shutdown_tx);
        let counters = self.counters.clone();
        let pool = Arc::new(self);

        for index in 0..pool.config.workers.max(1) {
            let worker = WorkerId::generate(&pool.config.name, index);
            tasks.push(tokio::spawn(worker_loop(
                pool.clone(),
                worker,
                shutdown_rx.clone(),
            )));
        }

        info!(pool = %pool.config.name, workers = tasks.task_count(), "worker pool started");
        WorkerPoolHandle { tasks, counters }
    }

    /// One select → claim → execute → transition cycle for `worker`.
    pub async fn run_once(&self, worker: &WorkerId) -> Result<JobOutcome, JobStoreError> {
        let candidates = self
            .store
            .next_candidates(Utc::now(), self.config.claim_batch.max(1), self.config.priority_aging)
            .await?;
        if candidates.is_empty() {
            return Ok(JobOutcome::Idle);
        }

        for candidate in candidates {
            match self.store.try_claim(candidate.id, worker, Utc::now()).await? {
                Some(job) => {
                    self.counters.claimed.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        %worker,
                        job_id = %job.id,
                        kind = %job.kind,
                        attempts = job.attempts,
                        "claimed job"
                    );
                    return self.process(worker, job).await;
                }
                None => {
                    self.counters.claims_lost.fetch_add(1, Ordering::Relaxed);
                    debug!(%worker, job_id = %candidate.id, "claim lost; trying next candidate");
                }
            }
        }

        Ok(JobOutcome::ClaimLost)
    }

    async fn process(&self, worker: &WorkerId, job: Job) -> Result<JobOutcome, JobStoreError> {
        let _running = RunningGuard::enter(&self.counters.running);

        match self.execute(&job).await {
            Ok(result) => self.on_success(worker, &job, result).await,
            Err(err) => self.on_failure(worker, &job, err).await,
        }
    }

    /// Run the analyzer on its own task under the kind's timeout.
    async fn execute(&self, job: &Job) -> Result<Value, AnalyzerError> {
        let Some(analyzer) = self.analyzers.get(job.kind) else {
            return Err(AnalyzerError::validation(format!(
                "no analyzer registered for {}",
                job.kind
            )));
        };
        let timeout = self.settings.get(job.kind).timeout;
        let input = job.input_data.clone();

        let mut task = tokio::spawn(async move { analyzer.analyze(&input).await });
        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) if join_err.is_panic() => {
                Err(AnalyzerError::transient("analyzer panicked"))
            }
            Ok(Err(join_err)) => Err(AnalyzerError::transient(format!(
                "analyzer task cancelled: {join_err}"
            ))),
            Err(_) => {
                task.abort();
                Err(AnalyzerError::transient(format!(
                    "analyzer timed out after {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    async fn on_success(
        &self,
        worker: &WorkerId,
        job: &Job,
        result: Value,
    ) -> Result<JobOutcome, JobStoreError> {
        let Some(done) = self
            .store
            .complete(job.id, worker, result.clone(), Utc::now())
            .await?
        else {
            return Ok(self.lost(worker, job, "complete"));
        };

        // Only after the completion is durable, so a hit implies a completed job.
        self.cache
            .set_by_key(done.cache_key.clone(), done.kind, result)
            .await;

        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        info!(
            %worker,
            job_id = %done.id,
            kind = %done.kind,
            duration_secs = done.actual_duration_seconds.unwrap_or_default(),
            "job completed"
        );
        Ok(JobOutcome::Completed { job_id: done.id })
    }

    async fn on_failure(
        &self,
        worker: &WorkerId,
        job: &Job,
        err: AnalyzerError,
    ) -> Result<JobOutcome, JobStoreError> {
        let class = err.class();
        let consumed = job.attempts + 1;
        let policy = &self.settings.get(job.kind).retry;

        match policy.decide(consumed, job.max_attempts, class) {
            RetryDecision::Retry { delay } => {
                let delay = policy.honor_hint(delay, err.retry_after());
                match self.store.retry(job.id, worker, delay, Utc::now()).await? {
                    Some(_) => {
                        self.counters.retried.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            %worker,
                            job_id = %job.id,
                            attempts = consumed,
                            max_attempts = job.max_attempts,
                            error_class = %class,
                            error = %err,
                            delay_ms = delay.as_millis() as u64,
                            "job failed; retry scheduled"
                        );
                        Ok(JobOutcome::Retrying {
                            job_id: job.id,
                            delay,
                        })
                    }
                    None => Ok(self.lost(worker, job, "retry")),
                }
            }
            RetryDecision::Fail => {
                let message = err.to_string();
                match self.store.fail(job.id, worker, &message, Utc::now()).await? {
                    Some(_) => {
                        self.counters.failed.fetch_add(1, Ordering::Relaxed);
                        error!(
                            %worker,
                            job_id = %job.id,
                            attempts = consumed,
                            error_class = %class,
                            error = %message,
                            "job failed permanently"
                        );
                        Ok(JobOutcome::Failed {
                            job_id: job.id,
                            class,
                        })
                    }
                    None => Ok(self.lost(worker, job, "fail")),
                }
            }
        }
    }

    fn lost(&self, worker: &WorkerId, job: &Job, write: &str) -> JobOutcome {
        self.counters.claims_lost.fetch_add(1, Ordering::Relaxed);
        warn!(%worker, job_id = %job.id, write, "claim no longer held; result discarded");
        JobOutcome::ClaimLost
    }
}

async fn worker_loop(pool: Arc<WorkerPool>, worker: WorkerId, mut shutdown: watch::Receiver<bool>) {
    info!(%worker, "worker started");
    let poll = pool.config.poll_interval;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let idle = match pool.run_once(&worker).await {
            Ok(JobOutcome::Idle) => true,
            Ok(_) => false,
            Err(err) => {
                error!(%worker, error = %err, "job store unavailable");
                true
            }
        };

        if idle && sleep_or_shutdown(poll, &mut shutdown).await {
            break;
        }
    }

    info!(%worker, "worker stopped");
}
