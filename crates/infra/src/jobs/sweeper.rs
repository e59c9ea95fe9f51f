//! Recovery of jobs abandoned mid-`processing` by crashed or hung workers.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use assay_core::JobStatus;

use super::store::{JobStore, JobStoreError, ResetGuard};
use crate::workers::{TaskHandle, spawn_periodic};

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// A job is stuck once `started_at + estimated_duration × grace_factor` has passed.
    pub grace_factor: f64,
    pub interval: Duration,
    /// Charge the abandoned execution against the job's attempt budget.
    pub count_attempt: bool,
    /// Stuck jobs examined per sweep
    pub batch_size: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            grace_factor: 3.0,
            interval: Duration::from_secs(60),
            count_attempt: false,
            batch_size: 100,
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct SweepReport {
    pub examined: usize,
    /// Returned to `pending`
    pub reset: usize,
    /// Counted release exhausted the attempt budget
    pub failed: usize,
    /// Completed or re-claimed between listing and reset
    pub skipped: usize,
}

#[derive(Clone)]
pub struct RecoverySweeper {
    store: Arc<dyn JobStore>,
    config: RecoveryConfig,
}

impl RecoverySweeper {
    pub fn new(store: Arc<dyn JobStore>, config: RecoveryConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Reset every job that is stuck as of `now`.
    ///
    /// Each reset re-checks holder and deadline in the same conditional write,
    /// so a worker that finishes between listing and reset keeps its result.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, JobStoreError> {
        let stuck = self
            .store
            .list_stuck(now, self.config.grace_factor, self.config.batch_size)
            .await?;
        let mut report = SweepReport {
            examined: stuck.len(),
            ..SweepReport::default()
        };

        for job in stuck {
            let Some(worker_id) = job.worker_id.clone() else {
                report.skipped += 1;
                continue;
            };
            let guard = ResetGuard::Stuck {
                worker_id: worker_id.clone(),
                grace_factor: self.config.grace_factor,
            };

            match self
                .store
                .reset_processing(job.id, guard, self.config.count_attempt, now)
                .await?
            {
                Some(updated) if updated.status == JobStatus::Failed => {
                    report.failed += 1;
                    warn!(
                        job_id = %job.id,
                        worker = %worker_id,
                        attempts = updated.attempts,
                        "abandoned job exhausted its attempts"
                    );
                }
                Some(_) => {
                    report.reset += 1;
                    warn!(
                        job_id = %job.id,
                        worker = %worker_id,
                        started_at = ?job.started_at,
                        "abandoned job returned to pending"
                    );
                }
                None => report.skipped += 1,
            }
        }

        if report.examined > 0 {
            info!(
                examined = report.examined,
                reset = report.reset,
                failed = report.failed,
                skipped = report.skipped,
                "recovery sweep finished"
            );
        }
        Ok(report)
    }

    /// Run [`RecoverySweeper::sweep_once`] every `config.interval`.
    pub fn spawn(self) -> TaskHandle {
        let interval = self.config.interval;
        spawn_periodic("recovery-sweeper", interval, move || {
            let sweeper = self.clone();
            async move {
                if let Err(err) = sweeper.sweep_once(Utc::now()).await {
                    warn!(error = %err, "recovery sweep failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::InMemoryJobStore;
    use assay_core::{Job, JobId, JobKind, OwnerId, WorkerId};
    use serde_json::json;

    async fn claimed_job(store: &InMemoryJobStore, max_attempts: u32) -> (JobId, DateTime<Utc>) {
        let t0 = Utc::now();
        let mut settings = JobKind::ExamAnalysis.default_settings();
        settings.max_attempts = max_attempts;
        let job = Job::new(OwnerId::new(), JobKind::ExamAnalysis, json!({"doc": "X"}), &settings, t0);
        let id = store.insert(job).await.unwrap();
        store.try_claim(id, &WorkerId::new("w-crashed"), t0).await.unwrap().unwrap();
        (id, t0)
    }

    #[tokio::test]
    async fn stuck_job_returns_to_pending() {
        let store = Arc::new(InMemoryJobStore::new());
        let (id, t0) = claimed_job(&store, 3).await;
        let sweeper = RecoverySweeper::new(store.clone(), RecoveryConfig::default());

        // 90s estimate x 3.0 grace = 270s.
        let early = sweeper.sweep_once(t0 + chrono::Duration::seconds(200)).await.unwrap();
        assert_eq!(early, SweepReport::default());

        let report = sweeper.sweep_once(t0 + chrono::Duration::seconds(271)).await.unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.reset, 1);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.worker_id.is_none());
        assert!(job.is_claimable(t0 + chrono::Duration::seconds(271)));
    }

    #[tokio::test]
    async fn counted_release_can_fail_the_job() {
        let store = Arc::new(InMemoryJobStore::new());
        let (id, t0) = claimed_job(&store, 1).await;
        let sweeper = RecoverySweeper::new(
            store.clone(),
            RecoveryConfig {
                count_attempt: true,
                ..RecoveryConfig::default()
            },
        );

        let report = sweeper.sweep_once(t0 + chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(report.failed, 1);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert!(job.error_message.unwrap().contains("w-crashed"));
    }

    #[tokio::test]
    async fn completed_jobs_are_left_alone() {
        let store = Arc::new(InMemoryJobStore::new());
        let (id, t0) = claimed_job(&store, 3).await;
        store
            .complete(id, &WorkerId::new("w-crashed"), json!({"late": true}), t0)
            .await
            .unwrap()
            .unwrap();

        let sweeper = RecoverySweeper::new(store.clone(), RecoveryConfig::default());
        let report = sweeper.sweep_once(t0 + chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(report.examined, 0);
        assert_eq!(
            store.get(id).await.unwrap().unwrap().status,
            JobStatus::Completed
        );
    }
}
