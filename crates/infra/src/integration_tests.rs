//! End-to-end tests across the job pipeline on in-memory stores.
//!
//! Tests: Submitter → JobStore → WorkerPool → CacheManager → StatusReporter
//!
//! Verifies:
//! - A completed analysis answers identical submissions from cache
//! - Retryable failures consume the attempt budget, then fail the job
//! - Abandoned claims are recovered and re-executed by another worker
//! - Exactly one of many concurrent claimers wins

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use chrono::Utc;
    use serde_json::{Value, json};

    use assay_core::{
        AnalyzerError, Job, JobKind, JobStatus, KindSettingsMap, OwnerId, RetryPolicy, WorkerId,
    };

    use crate::cache::{CacheManager, CacheManagerConfig, InMemoryCacheStore};
    use crate::jobs::{
        AnalyzerRegistry, InMemoryJobStore, JobOutcome, JobStore, RecoveryConfig, RecoverySweeper,
        StatusReporter, Submission, Submitter, WorkerPool, WorkerPoolConfig,
    };

    struct Pipeline {
        store: Arc<InMemoryJobStore>,
        cache: CacheManager,
        submitter: Submitter,
        pool: WorkerPool,
        status: StatusReporter,
    }

    fn pipeline(analyzers: AnalyzerRegistry, settings: KindSettingsMap) -> Pipeline {
        let store = Arc::new(InMemoryJobStore::new());
        let cache = CacheManager::new(
            Arc::new(InMemoryCacheStore::new()),
            CacheManagerConfig::default(),
        );
        let settings = Arc::new(settings);
        let submitter = Submitter::new(store.clone(), cache.clone(), settings.clone());
        let pool = WorkerPool::new(
            store.clone(),
            cache.clone(),
            analyzers,
            settings,
            WorkerPoolConfig::default(),
        );
        let status = StatusReporter::new(store.clone());
        Pipeline {
            store,
            cache,
            submitter,
            pool,
            status,
        }
    }

    fn no_backoff() -> KindSettingsMap {
        let mut settings = KindSettingsMap::default();
        for kind in JobKind::ALL {
            settings.update(kind, |s| s.retry = RetryPolicy::fixed(Duration::ZERO));
        }
        settings
    }

    #[tokio::test]
    async fn completed_analysis_is_served_from_cache() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let mut analyzers = AnalyzerRegistry::new();
        analyzers.register_fn(JobKind::ExamAnalysis, move |input: Value| {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"summary": format!("read {}", input["doc"])}))
            }
        });
        let p = pipeline(analyzers, KindSettingsMap::default());
        let owner = OwnerId::new();

        let first = p
            .submitter
            .submit(owner, JobKind::ExamAnalysis, json!({"doc": "X"}), None)
            .await
            .unwrap();
        let Submission::Enqueued { job_id } = first else {
            panic!("expected a new job, got {first:?}");
        };
        let view = p.status.status(owner, job_id).await.unwrap().unwrap();
        assert_eq!(view.detail.status(), JobStatus::Pending);

        let outcome = p.pool.run_once(&WorkerId::new("w-1")).await.unwrap();
        assert_eq!(outcome, JobOutcome::Completed { job_id });

        let view = p.status.status(owner, job_id).await.unwrap().unwrap();
        assert_eq!(view.detail.status(), JobStatus::Completed);
        assert_eq!(p.cache.entry_count().await.unwrap(), 1);

        // Any owner gets the cached answer; no second job and no second call.
        let second = p
            .submitter
            .submit(OwnerId::new(), JobKind::ExamAnalysis, json!({"doc": "X"}), None)
            .await
            .unwrap();
        assert!(matches!(
            second,
            Submission::Cached { ref response, .. } if response["summary"] == "read \"X\""
        ));
        assert_eq!(p.store.stats().await.unwrap().total(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_failures_fail_the_job_on_the_last_attempt() {
        let mut analyzers = AnalyzerRegistry::new();
        analyzers.register_fn(JobKind::ExamAnalysis, |_input: Value| async move {
            Err(AnalyzerError::transient("ocr backend reset the connection"))
        });
        let p = pipeline(analyzers, no_backoff());
        let owner = OwnerId::new();

        let job_id = p
            .submitter
            .submit(owner, JobKind::ExamAnalysis, json!({"doc": "blurry"}), None)
            .await
            .unwrap()
            .job_id()
            .unwrap();
        let worker = WorkerId::new("w-1");

        for expected in 1..=2 {
            let outcome = p.pool.run_once(&worker).await.unwrap();
            assert!(matches!(outcome, JobOutcome::Retrying { .. }));
            let job = p.store.get(job_id).await.unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Pending);
            assert_eq!(job.attempts, expected);
        }

        p.pool.run_once(&worker).await.unwrap();
        let job = p.store.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 3);
        assert!(job.error_message.is_some());
        assert_eq!(p.cache.entry_count().await.unwrap(), 0);

        // The failure does not block a fresh submission of the same work.
        let again = p
            .submitter
            .submit(owner, JobKind::ExamAnalysis, json!({"doc": "blurry"}), None)
            .await
            .unwrap();
        assert!(matches!(again, Submission::Enqueued { job_id: id } if id != job_id));
    }

    #[tokio::test]
    async fn abandoned_job_is_recovered_and_reclaimed() {
        let mut analyzers = AnalyzerRegistry::new();
        analyzers.register_fn(JobKind::FoodImageAnalysis, |_input: Value| async move {
            Ok(json!({"kcal": 610}))
        });
        let p = pipeline(analyzers, KindSettingsMap::default());
        let owner = OwnerId::new();

        let job_id = p
            .submitter
            .submit(owner, JobKind::FoodImageAnalysis, json!({"image": "lunch.jpg"}), None)
            .await
            .unwrap()
            .job_id()
            .unwrap();

        // A worker claimed it an hour ago and never came back.
        let crashed = WorkerId::new("w-crashed");
        let claimed_at = Utc::now() - chrono::Duration::hours(1);
        p.store
            .try_claim(job_id, &crashed, claimed_at)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(p.pool.run_once(&WorkerId::new("w-2")).await.unwrap(), JobOutcome::Idle);

        let sweeper = RecoverySweeper::new(p.store.clone(), RecoveryConfig::default());
        let report = sweeper.sweep_once(Utc::now()).await.unwrap();
        assert_eq!(report.reset, 1);

        let outcome = p.pool.run_once(&WorkerId::new("w-2")).await.unwrap();
        assert_eq!(outcome, JobOutcome::Completed { job_id });

        // The crashed worker's late completion is rejected.
        let late = p
            .store
            .complete(job_id, &crashed, json!({"kcal": 1}), Utc::now())
            .await
            .unwrap();
        assert!(late.is_none());
        let job = p.store.get(job_id).await.unwrap().unwrap();
        assert_eq!(job.result, Some(json!({"kcal": 610})));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn exactly_one_concurrent_claim_wins() {
        let store = Arc::new(InMemoryJobStore::new());
        let job = Job::new(
            OwnerId::new(),
            JobKind::MedicalReport,
            json!({"patient": "p-7"}),
            &JobKind::MedicalReport.default_settings(),
            Utc::now(),
        );
        let job_id = store.insert(job).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .try_claim(job_id, &WorkerId::generate("race", i), Utc::now())
                    .await
                    .unwrap()
                    .is_some()
            }));
        }

        let mut winners = 0;
        for t in tasks {
            if t.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(store.stats().await.unwrap().processing, 1);
    }

    #[tokio::test]
    async fn foreign_owner_cannot_see_job() {
        let p = pipeline(AnalyzerRegistry::new(), KindSettingsMap::default());
        let owner = OwnerId::new();
        let job_id = p
            .submitter
            .submit(owner, JobKind::NutritionCalculation, json!({"foods": ["rice"]}), None)
            .await
            .unwrap()
            .job_id()
            .unwrap();

        assert!(p.status.status(owner, job_id).await.unwrap().is_some());
        assert!(p.status.status(OwnerId::new(), job_id).await.unwrap().is_none());
    }
}
