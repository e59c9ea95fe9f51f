use std::sync::Arc;

use tracing::debug;

use assay_core::{JobId, JobStatusView, OwnerId};

use super::store::{JobStore, JobStoreError};

/// Owner-scoped read access to job status.
#[derive(Clone)]
pub struct StatusReporter {
    store: Arc<dyn JobStore>,
}

impl StatusReporter {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Status view of `job_id` for `caller`.
    ///
    /// Absent and foreign jobs both yield `Ok(None)`; only a store failure is
    /// an error.
    pub async fn status(
        &self,
        caller: OwnerId,
        job_id: JobId,
    ) -> Result<Option<JobStatusView>, JobStoreError> {
        match self.store.get(job_id).await? {
            Some(job) if job.is_owned_by(caller) => Ok(Some(JobStatusView::from(&job))),
            Some(_) => {
                debug!(%job_id, %caller, "status requested for a foreign job");
                Ok(None)
            }
            None => Ok(None),
        }
    }
}
