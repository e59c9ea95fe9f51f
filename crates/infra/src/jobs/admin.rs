//! Operator actions. Every override goes through the same conditional
//! store transitions the workers use.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use assay_core::{Job, JobId, JobStatus};

use super::store::{JobStats, JobStore, JobStoreError, ResetGuard};

#[derive(Debug, Clone, thiserror::Error)]
pub enum AdminError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {job_id} is {status}, expected {expected}")]
    InvalidState {
        job_id: JobId,
        status: JobStatus,
        expected: JobStatus,
    },
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

#[derive(Clone)]
pub struct JobAdmin {
    store: Arc<dyn JobStore>,
}

impl JobAdmin {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Force a `processing` job back to `pending` without touching attempts.
    pub async fn reset(&self, job_id: JobId) -> Result<Job, AdminError> {
        match self
            .store
            .reset_processing(job_id, ResetGuard::Any, false, Utc::now())
            .await?
        {
            Some(job) => {
                warn!(%job_id, "job reset to pending by operator");
                Ok(job)
            }
            None => Err(self.rejection(job_id, JobStatus::Processing).await),
        }
    }

    /// Give a `failed` job a fresh attempt budget.
    pub async fn requeue_failed(&self, job_id: JobId) -> Result<Job, AdminError> {
        match self.store.requeue_failed(job_id, Utc::now()).await? {
            Some(job) => {
                info!(%job_id, "failed job requeued by operator");
                Ok(job)
            }
            None => Err(self.rejection(job_id, JobStatus::Failed).await),
        }
    }

    pub async fn stats(&self) -> Result<JobStats, AdminError> {
        Ok(self.store.stats().await?)
    }

    async fn rejection(&self, job_id: JobId, expected: JobStatus) -> AdminError {
        match self.store.get(job_id).await {
            Ok(Some(job)) => AdminError::InvalidState {
                job_id,
                status: job.status,
                expected,
            },
            Ok(None) => AdminError::NotFound(job_id),
            Err(err) => AdminError::Store(err),
        }
    }
}
