//! Read-only projection of a job for polling clients.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::id::{JobId, WorkerId};
use crate::job::{Job, JobStatus};
use crate::kind::JobKind;

/// Status view returned to the job's owner.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    #[serde(rename = "type")]
    pub kind: JobKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub detail: StatusDetail,
}

/// Status-specific fields; the `status` tag selects the shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StatusDetail {
    Pending {
        priority: i32,
        attempts: u32,
        not_before: Option<DateTime<Utc>>,
    },
    Processing {
        worker_id: Option<WorkerId>,
        started_at: Option<DateTime<Utc>>,
        attempts: u32,
    },
    Completed {
        result: Option<Value>,
        actual_duration_seconds: Option<f64>,
        completed_at: Option<DateTime<Utc>>,
    },
    Failed {
        error_message: Option<String>,
        attempts: u32,
        max_attempts: u32,
    },
}

impl StatusDetail {
    pub fn status(&self) -> JobStatus {
        match self {
            StatusDetail::Pending { .. } => JobStatus::Pending,
            StatusDetail::Processing { .. } => JobStatus::Processing,
            StatusDetail::Completed { .. } => JobStatus::Completed,
            StatusDetail::Failed { .. } => JobStatus::Failed,
        }
    }
}

impl From<&Job> for JobStatusView {
    fn from(job: &Job) -> Self {
        let detail = match job.status {
            JobStatus::Pending => StatusDetail::Pending {
                priority: job.priority,
                attempts: job.attempts,
                not_before: job.not_before,
            },
            JobStatus::Processing => StatusDetail::Processing {
                worker_id: job.worker_id.clone(),
                started_at: job.started_at,
                attempts: job.attempts,
            },
            JobStatus::Completed => StatusDetail::Completed {
                result: job.result.clone(),
                actual_duration_seconds: job.actual_duration_seconds,
                completed_at: job.completed_at,
            },
            JobStatus::Failed => StatusDetail::Failed {
                error_message: job.error_message.clone(),
                attempts: job.attempts,
                max_attempts: job.max_attempts,
            },
        };

        Self {
            job_id: job.id,
            kind: job.kind,
            created_at: job.created_at,
            updated_at: job.updated_at,
            detail,
        }
    }
}
