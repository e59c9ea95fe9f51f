//! Job record and its state machine.
//!
//! ```text
//!             claim                 complete
//!   pending ─────────► processing ───────────► completed
//!      ▲                  │  │
//!      │  retry / release │  │ fail
//!      └──────────────────┘  └───────────────► failed
//! ```
//!
//! `completed` and `failed` are terminal; the only way out of `failed` is the
//! administrative [`Job::requeue_failed`] override.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::CacheKey;
use crate::error::{DomainError, DomainResult};
use crate::id::{JobId, OwnerId, WorkerId};
use crate::kind::{JobKind, KindSettings};
use crate::retry::MAX_RETRY_DELAY;

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Queued, waiting to be claimed
    Pending,
    /// Claimed by exactly one worker
    Processing,
    /// Finished with a result
    Completed,
    /// Finished with an error message
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Processing,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Edges reachable by workers and the recovery sweeper.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Pending)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job status: {s}")))
    }
}

/// A unit of asynchronous analysis work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub owner_id: OwnerId,
    pub kind: JobKind,
    pub input_data: Value,
    /// Derived from `(kind, input_data)` at creation.
    pub cache_key: CacheKey,
    /// Lower = sooner.
    pub priority: i32,
    pub status: JobStatus,
    /// Attempts consumed so far (every failed execution counts).
    pub attempts: u32,
    pub max_attempts: u32,
    /// Set only while `processing`.
    pub worker_id: Option<WorkerId>,
    /// Present iff `completed`.
    pub result: Option<Value>,
    /// Present iff `failed`.
    pub error_message: Option<String>,
    pub estimated_duration_seconds: u32,
    pub actual_duration_seconds: Option<f64>,
    /// A retried job is not claimable before this instant.
    pub not_before: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new `pending` job using the kind's settings.
    pub fn new(
        owner_id: OwnerId,
        kind: JobKind,
        input_data: Value,
        settings: &KindSettings,
        now: DateTime<Utc>,
    ) -> Self {
        let cache_key = CacheKey::derive(kind, &input_data);
        Self {
            id: JobId::new(),
            owner_id,
            kind,
            input_data,
            cache_key,
            priority: settings.default_priority,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: settings.max_attempts.max(1),
            worker_id: None,
            result: None,
            error_message: None,
            estimated_duration_seconds: u32::try_from(settings.estimated_duration.as_secs())
                .unwrap_or(u32::MAX),
            actual_duration_seconds: None,
            not_before: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn is_owned_by(&self, owner: OwnerId) -> bool {
        self.owner_id == owner
    }

    /// `pending` and past its retry delay.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.not_before.is_none_or(|t| t <= now)
    }

    /// Priority after aging: one band sooner per elapsed `aging` interval.
    pub fn effective_priority(&self, now: DateTime<Utc>, aging: Option<Duration>) -> i64 {
        let base = i64::from(self.priority);
        match aging {
            Some(interval) if !interval.is_zero() => {
                let age_ms = (now - self.created_at).num_milliseconds().max(0);
                let interval_ms = i64::try_from(interval.as_millis()).unwrap_or(i64::MAX);
                base - age_ms / interval_ms
            }
            _ => base,
        }
    }

    /// Instant after which a `processing` job counts as abandoned.
    pub fn stuck_deadline(&self, grace_factor: f64) -> Option<DateTime<Utc>> {
        let started = self.started_at?;
        let grace_ms = f64::from(self.estimated_duration_seconds) * grace_factor.max(0.0) * 1000.0;
        Some(started + chrono::Duration::milliseconds(grace_ms as i64))
    }

    pub fn is_stuck(&self, now: DateTime<Utc>, grace_factor: f64) -> bool {
        self.status == JobStatus::Processing
            && self.stuck_deadline(grace_factor).is_some_and(|d| d < now)
    }

    /// `pending → processing`.
    pub fn claim(&mut self, worker: WorkerId, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_transition(JobStatus::Processing)?;
        if !self.is_claimable(now) {
            return Err(DomainError::invariant(format!(
                "job {} is not claimable before its retry delay",
                self.id
            )));
        }
        self.status = JobStatus::Processing;
        self.worker_id = Some(worker);
        self.started_at = Some(now);
        self.not_before = None;
        self.updated_at = now;
        Ok(())
    }

    /// `processing → completed`.
    pub fn complete(&mut self, result: Value, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_transition(JobStatus::Completed)?;
        self.status = JobStatus::Completed;
        self.result = Some(result);
        self.actual_duration_seconds = self.elapsed_seconds(now);
        self.worker_id = None;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// `processing → pending` after a retryable failure.
    ///
    /// Consumes one attempt; refuses if that would exhaust `max_attempts`
    /// (such a failure must go to [`Job::fail`]).
    pub fn retry(&mut self, delay: Duration, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_transition(JobStatus::Pending)?;
        let attempts = self.attempts + 1;
        if attempts >= self.max_attempts {
            return Err(DomainError::invariant(format!(
                "job {} has no attempts left ({attempts}/{})",
                self.id, self.max_attempts
            )));
        }
        let not_before = Self::retry_not_before(now, delay)?;
        self.attempts = attempts;
        self.back_to_pending(now);
        self.not_before = Some(not_before);
        Ok(())
    }

    /// When a job retried at `now` becomes claimable again.
    ///
    /// `delay` saturates at [`MAX_RETRY_DELAY`]; it is never shortened to zero.
    pub fn retry_not_before(now: DateTime<Utc>, delay: Duration) -> DomainResult<DateTime<Utc>> {
        let delay = delay.min(MAX_RETRY_DELAY);
        chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .ok_or_else(|| {
                DomainError::invariant(format!("retry delay {delay:?} overflows {now}"))
            })
    }

    /// `processing → failed`. Consumes one attempt (capped at `max_attempts`).
    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_transition(JobStatus::Failed)?;
        self.attempts = (self.attempts + 1).min(self.max_attempts);
        self.status = JobStatus::Failed;
        self.error_message = Some(error.into());
        self.actual_duration_seconds = self.elapsed_seconds(now);
        self.worker_id = None;
        self.not_before = None;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// `processing → pending` for an abandoned claim (recovery sweep or
    /// administrative reset).
    ///
    /// With `count_attempt`, the abandoned execution consumes an attempt; if
    /// that exhausts `max_attempts` the job fails instead.
    pub fn release(&mut self, count_attempt: bool, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_transition(JobStatus::Pending)?;
        if count_attempt {
            if self.attempts + 1 >= self.max_attempts {
                let worker = self
                    .worker_id
                    .as_ref()
                    .map(|w| w.to_string())
                    .unwrap_or_default();
                return self.fail(format!("abandoned by worker {worker}"), now);
            }
            self.attempts += 1;
        }
        self.back_to_pending(now);
        Ok(())
    }

    /// Administrative override: `failed → pending` with a fresh attempt budget.
    pub fn requeue_failed(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status != JobStatus::Failed {
            return Err(DomainError::transition(self.status, JobStatus::Pending));
        }
        self.attempts = 0;
        self.error_message = None;
        self.completed_at = None;
        self.actual_duration_seconds = None;
        self.back_to_pending(now);
        Ok(())
    }

    /// Validate the record-level invariants.
    pub fn check_invariants(&self) -> DomainResult<()> {
        if self.max_attempts < 1 {
            return Err(DomainError::invariant("max_attempts must be >= 1"));
        }
        if self.attempts > self.max_attempts {
            return Err(DomainError::invariant(format!(
                "attempts {} exceed max_attempts {}",
                self.attempts, self.max_attempts
            )));
        }
        if self.worker_id.is_some() != (self.status == JobStatus::Processing) {
            return Err(DomainError::invariant(
                "worker_id must be set exactly while processing",
            ));
        }
        if self.result.is_some() != (self.status == JobStatus::Completed) {
            return Err(DomainError::invariant("result must be set exactly when completed"));
        }
        if self.error_message.is_some() != (self.status == JobStatus::Failed) {
            return Err(DomainError::invariant(
                "error_message must be set exactly when failed",
            ));
        }
        Ok(())
    }

    fn ensure_transition(&self, next: JobStatus) -> DomainResult<()> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(DomainError::transition(self.status, next))
        }
    }

    fn back_to_pending(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.worker_id = None;
        self.started_at = None;
        self.not_before = None;
        self.updated_at = now;
    }

    fn elapsed_seconds(&self, now: DateTime<Utc>) -> Option<f64> {
        self.started_at
            .map(|s| (now - s).num_milliseconds().max(0) as f64 / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn new_job(max_attempts: u32) -> Job {
        let mut settings = JobKind::ExamAnalysis.default_settings();
        settings.max_attempts = max_attempts;
        Job::new(
            OwnerId::new(),
            JobKind::ExamAnalysis,
            json!({"doc": "X"}),
            &settings,
            Utc::now(),
        )
    }

    fn worker() -> WorkerId {
        WorkerId::new("w-1")
    }

    #[test]
    fn job_lifecycle() {
        let mut job = new_job(3);
        let now = job.created_at;
        assert_eq!(job.status, JobStatus::Pending);
        job.check_invariants().unwrap();

        job.claim(worker(), now).unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.worker_id, Some(worker()));
        job.check_invariants().unwrap();

        let done = now + chrono::Duration::milliseconds(1500);
        job.complete(json!({"score": 1}), done).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.worker_id, None);
        assert_eq!(job.actual_duration_seconds, Some(1.5));
        assert_eq!(job.completed_at, Some(done));
        job.check_invariants().unwrap();
    }

    #[test]
    fn terminal_states_reject_writes() {
        let mut job = new_job(3);
        let now = job.created_at;
        job.claim(worker(), now).unwrap();
        job.complete(json!({}), now).unwrap();

        assert!(matches!(
            job.claim(worker(), now),
            Err(DomainError::InvalidTransition { .. })
        ));
        assert!(job.fail("late", now).is_err());
        assert!(job.release(false, now).is_err());
        assert!(job.requeue_failed(now).is_err());
    }

    #[test]
    fn pending_cannot_complete_or_fail() {
        let mut job = new_job(3);
        let now = job.created_at;
        assert!(job.complete(json!({}), now).is_err());
        assert!(job.fail("x", now).is_err());
        assert!(job.retry(Duration::ZERO, now).is_err());
    }

    #[test]
    fn retry_defers_eligibility() {
        let mut job = new_job(3);
        let now = job.created_at;
        job.claim(worker(), now).unwrap();
        job.retry(Duration::from_secs(10), now).unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.worker_id, None);
        assert_eq!(job.started_at, None);
        assert!(!job.is_claimable(now));
        assert!(job.is_claimable(now + chrono::Duration::seconds(10)));
        assert!(job.claim(worker(), now).is_err());
    }

    #[test]
    fn oversized_retry_delay_saturates() {
        let ceiling = chrono::Duration::from_std(MAX_RETRY_DELAY).unwrap();
        for secs in [100_000_000_000_000, u64::MAX] {
            let mut job = new_job(3);
            let now = job.created_at;
            job.claim(worker(), now).unwrap();
            job.retry(Duration::from_secs(secs), now).unwrap();

            assert_eq!(job.not_before, Some(now + ceiling));
            assert!(!job.is_claimable(now));
            assert!(!job.is_claimable(now + ceiling - chrono::Duration::seconds(1)));
            assert!(job.is_claimable(now + ceiling));
        }
    }

    #[test]
    fn retry_near_the_end_of_time_is_refused_untouched() {
        let mut job = new_job(3);
        let now = job.created_at;
        job.claim(worker(), now).unwrap();

        let end = DateTime::<Utc>::MAX_UTC - chrono::Duration::seconds(1);
        assert!(job.retry(Duration::from_secs(60), end).is_err());
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempts, 0);
    }

    #[test]
    fn last_attempt_must_fail_not_retry() {
        let mut job = new_job(3);
        let now = job.created_at;
        for _ in 0..2 {
            job.claim(worker(), now).unwrap();
            job.retry(Duration::ZERO, now).unwrap();
        }
        job.claim(worker(), now).unwrap();
        assert!(job.retry(Duration::ZERO, now).is_err());

        job.fail("backend down", now).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert_eq!(job.error_message.as_deref(), Some("backend down"));
        job.check_invariants().unwrap();
    }

    #[test]
    fn release_without_counting_keeps_attempts() {
        let mut job = new_job(3);
        let now = job.created_at;
        job.claim(worker(), now).unwrap();
        job.release(false, now).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.is_claimable(now));
    }

    #[test]
    fn counted_release_can_exhaust_the_job() {
        let mut job = new_job(1);
        let now = job.created_at;
        job.claim(worker(), now).unwrap();
        job.release(true, now).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert!(job.error_message.as_deref().unwrap().contains("w-1"));
    }

    #[test]
    fn requeue_failed_resets_budget() {
        let mut job = new_job(1);
        let now = job.created_at;
        job.claim(worker(), now).unwrap();
        job.fail("bad", now).unwrap();
        job.requeue_failed(now).unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.error_message, None);
        job.check_invariants().unwrap();
    }

    #[test]
    fn stuck_detection_uses_grace_factor() {
        let mut job = new_job(3);
        let start = job.created_at;
        job.claim(worker(), start).unwrap();
        let est = i64::from(job.estimated_duration_seconds);

        assert!(!job.is_stuck(start + chrono::Duration::seconds(est * 2), 3.0));
        assert!(job.is_stuck(start + chrono::Duration::seconds(est * 3 + 1), 3.0));
    }

    #[test]
    fn aging_promotes_old_jobs() {
        let job = new_job(3).with_priority(5);
        let later = job.created_at + chrono::Duration::seconds(125);

        assert_eq!(job.effective_priority(later, None), 5);
        assert_eq!(job.effective_priority(later, Some(Duration::from_secs(60))), 3);
    }

    #[test]
    fn only_the_four_edges_are_legal() {
        for from in JobStatus::ALL {
            for to in JobStatus::ALL {
                let expected = matches!(
                    (from, to),
                    (JobStatus::Pending, JobStatus::Processing)
                        | (JobStatus::Processing, JobStatus::Completed)
                        | (JobStatus::Processing, JobStatus::Pending)
                        | (JobStatus::Processing, JobStatus::Failed)
                );
                assert_eq!(from.can_transition_to(to), expected, "{from} -> {to}");
            }
        }
    }

    #[derive(Debug, Clone)]
    enum Step {
        Claim,
        Complete,
        Retry,
        Fail,
        Release(bool),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            Just(Step::Claim),
            Just(Step::Complete),
            Just(Step::Retry),
            Just(Step::Fail),
            any::<bool>().prop_map(Step::Release),
        ]
    }

    proptest! {
        #[test]
        fn invariants_hold_under_any_sequence(
            max_attempts in 1u32..6,
            steps in proptest::collection::vec(step(), 0..40),
        ) {
            let mut job = new_job(max_attempts);
            let now = job.created_at;
            for s in steps {
                let before = job.status;
                let _ = match s {
                    Step::Claim => job.claim(worker(), now),
                    Step::Complete => job.complete(json!({"ok": true}), now),
                    Step::Retry => job.retry(Duration::ZERO, now),
                    Step::Fail => job.fail("boom", now),
                    Step::Release(count) => job.release(count, now),
                };
                prop_assert!(job.check_invariants().is_ok());
                prop_assert!(job.attempts <= job.max_attempts);
                if job.status != before {
                    prop_assert!(before.can_transition_to(job.status));
                }
            }
        }
    }
}
