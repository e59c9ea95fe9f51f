//! `assay-core`: domain model for asynchronous analysis jobs.
//!
//! This crate is **pure domain**: identifiers, the job state machine, retry
//! decisions, error classification and cache key derivation. Storage, workers
//! and HTTP live in `assay-infra` / `assay-api`.

pub mod cache;
pub mod error;
pub mod failure;
pub mod id;
pub mod job;
pub mod kind;
pub mod retry;
pub mod view;

pub use cache::{CacheEntry, CacheKey, canonical_json};
pub use error::{DomainError, DomainResult};
pub use failure::{AnalyzerError, ErrorClass};
pub use id::{JobId, OwnerId, WorkerId};
pub use job::{Job, JobStatus};
pub use kind::{JobKind, KindSettings, KindSettingsMap};
pub use retry::{BackoffStrategy, MAX_RETRY_DELAY, RetryDecision, RetryPolicy};
pub use view::{JobStatusView, StatusDetail};
