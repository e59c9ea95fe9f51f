//! Asynchronous analysis jobs with retry, backoff and recovery.
//!
//! ## Design
//!
//! - Jobs are owner-scoped and typed by [`assay_core::JobKind`]
//! - The store's conditional writes are the only coordination between workers
//! - Retry policy per kind, driven by the analyzer's error class
//! - Abandoned `processing` jobs are reclaimed by a periodic sweep
//!
//! ## Components
//!
//! - `JobStore`: persistence with compare-and-set transitions (in-memory or Postgres)
//! - `Submitter`: cache lookup, in-flight dedup, enqueue
//! - `WorkerPool`: claims and executes jobs
//! - `RecoverySweeper`: resets stuck jobs
//! - `StatusReporter` / `JobAdmin`: owner-scoped reads and operator overrides

pub mod admin;
pub mod analyzer;
pub mod http_analyzer;
pub mod postgres;
pub mod status;
pub mod store;
pub mod submitter;
pub mod sweeper;
pub mod worker;

pub use admin::{AdminError, JobAdmin};
pub use analyzer::{Analyzer, AnalyzerRegistry, FnAnalyzer};
pub use http_analyzer::{HttpAnalyzer, classify_status};
pub use postgres::PostgresJobStore;
pub use status::StatusReporter;
pub use store::{InMemoryJobStore, JobStats, JobStore, JobStoreError, ResetGuard};
pub use submitter::{DEFAULT_MAX_INPUT_BYTES, SubmitError, Submission, Submitter};
pub use sweeper::{RecoveryConfig, RecoverySweeper, SweepReport};
pub use worker::{JobOutcome, PoolStats, WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
