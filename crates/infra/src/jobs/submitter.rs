//! Submission entry point: cache first, then deduplicate, then enqueue.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};

use assay_core::{CacheKey, Job, JobId, JobKind, KindSettingsMap, OwnerId};

use super::store::{JobStore, JobStoreError};
use crate::cache::CacheManager;
use crate::singleflight::Singleflight;

/// Default upper bound on the serialized input size.
pub const DEFAULT_MAX_INPUT_BYTES: usize = 1024 * 1024;

/// Outcome of a submission.
#[derive(Debug, Clone, PartialEq)]
pub enum Submission {
    /// A live cache entry answered the request; no job was created.
    Cached { cache_key: CacheKey, response: Value },
    /// A new `pending` job was created.
    Enqueued { job_id: JobId },
    /// The caller already has this exact work in flight.
    Joined { job_id: JobId },
}

impl Submission {
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Submission::Cached { .. } => None,
            Submission::Enqueued { job_id } | Submission::Joined { job_id } => Some(*job_id),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SubmitError {
    #[error("invalid submission: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Accepts analysis requests without waiting for the analyzer.
#[derive(Clone)]
pub struct Submitter {
    store: Arc<dyn JobStore>,
    cache: CacheManager,
    settings: Arc<KindSettingsMap>,
    flights: Arc<Singleflight<(OwnerId, CacheKey)>>,
    max_input_bytes: usize,
}

impl Submitter {
    pub fn new(
        store: Arc<dyn JobStore>,
        cache: CacheManager,
        settings: Arc<KindSettingsMap>,
    ) -> Self {
        Self {
            store,
            cache,
            settings,
            flights: Arc::new(Singleflight::new()),
            max_input_bytes: DEFAULT_MAX_INPUT_BYTES,
        }
    }

    pub fn with_max_input_bytes(mut self, max: usize) -> Self {
        self.max_input_bytes = max;
        self
    }

    /// Submit `(kind, input)` on behalf of `owner`.
    ///
    /// Concurrent identical submissions from the same owner are serialized,
    /// so the second one finds the first one's job and joins it.
    pub async fn submit(
        &self,
        owner: OwnerId,
        kind: JobKind,
        input: Value,
        priority: Option<i32>,
    ) -> Result<Submission, SubmitError> {
        self.validate(&input)?;

        let cache_key = self.cache.generate_key(kind, &input);
        if let Some(response) = self.cache.get_by_key(&cache_key).await {
            debug!(%owner, %cache_key, "submission answered from cache");
            return Ok(Submission::Cached {
                cache_key,
                response,
            });
        }

        let flight_key = (owner, cache_key.clone());
        self.flights
            .run(flight_key, || {
                self.join_or_enqueue(owner, kind, input, priority, &cache_key)
            })
            .await
    }

    async fn join_or_enqueue(
        &self,
        owner: OwnerId,
        kind: JobKind,
        input: Value,
        priority: Option<i32>,
        cache_key: &CacheKey,
    ) -> Result<Submission, SubmitError> {
        if let Some(existing) = self.store.find_in_flight(owner, cache_key).await? {
            debug!(%owner, job_id = %existing.id, "joined in-flight job");
            return Ok(Submission::Joined {
                job_id: existing.id,
            });
        }

        let mut job = Job::new(owner, kind, input, self.settings.get(kind), Utc::now());
        if let Some(p) = priority {
            job = job.with_priority(p);
        }
        let job_id = self.store.insert(job).await?;
        info!(%owner, %job_id, %kind, "job enqueued");
        Ok(Submission::Enqueued { job_id })
    }

    fn validate(&self, input: &Value) -> Result<(), SubmitError> {
        if !input.is_object() {
            return Err(SubmitError::Validation(
                "input must be a JSON object".into(),
            ));
        }
        let size = serde_json::to_vec(input)
            .map_err(|e| SubmitError::Validation(format!("input is not serializable: {e}")))?
            .len();
        if size > self.max_input_bytes {
            return Err(SubmitError::Validation(format!(
                "input is {size} bytes; limit is {}",
                self.max_input_bytes
            )));
        }
        Ok(())
    }
}
