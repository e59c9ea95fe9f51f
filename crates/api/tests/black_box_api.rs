use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{Value, json};
use uuid::Uuid;

use assay_api::app::{self, services};
use assay_core::{AnalyzerError, JobKind};
use assay_infra::AssayConfig;
use assay_infra::jobs::{AnalyzerRegistry, WorkerPoolHandle};

const ADMIN_TOKEN: &str = "test-admin-token";

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
    _pool: Option<WorkerPoolHandle>,
}

impl TestServer {
    /// Router only; submitted jobs stay `pending`.
    async fn spawn() -> Self {
        Self::spawn_with(test_config(Some(ADMIN_TOKEN)), None).await
    }

    /// Router plus a worker pool running `analyzers`.
    async fn spawn_with_workers(analyzers: AnalyzerRegistry) -> Self {
        Self::spawn_with(test_config(Some(ADMIN_TOKEN)), Some(analyzers)).await
    }

    async fn spawn_with(config: AssayConfig, analyzers: Option<AnalyzerRegistry>) -> Self {
        let backends = services::Backends::in_memory(&config);
        let pool = analyzers.map(|a| backends.worker_pool(a, &config).spawn());

        // Same router as prod, bound to an ephemeral port.
        let app = app::build_app(Arc::new(services::AppServices::new(&backends, &config)));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            handle,
            _pool: pool,
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn test_config(admin_token: Option<&str>) -> AssayConfig {
    let mut config = AssayConfig::default();
    config.admin_token = admin_token.map(str::to_string);
    config.pool = config
        .pool
        .with_workers(2)
        .with_poll_interval(Duration::from_millis(10));
    config
}

async fn submit(
    client: &reqwest::Client,
    base_url: &str,
    caller: Uuid,
    body: Value,
) -> (StatusCode, Value) {
    let res = client
        .post(format!("{}/jobs", base_url))
        .header("X-Caller-Id", caller.to_string())
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = res.status();
    (status, res.json().await.unwrap())
}

async fn get_status(
    client: &reqwest::Client,
    base_url: &str,
    caller: Uuid,
    job_id: &str,
) -> (StatusCode, Value) {
    let res = client
        .get(format!("{}/jobs/{}", base_url, job_id))
        .header("X-Caller-Id", caller.to_string())
        .send()
        .await
        .unwrap();
    let status = res.status();
    (status, res.json().await.unwrap())
}

async fn wait_for_status(
    client: &reqwest::Client,
    base_url: &str,
    caller: Uuid,
    job_id: &str,
    expected: &str,
) -> Value {
    // Workers run asynchronously; poll briefly.
    for _ in 0..200 {
        let (status, body) = get_status(client, base_url, caller, job_id).await;
        assert_eq!(status, StatusCode::OK);
        if body["status"] == expected {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {job_id} did not reach {expected} within timeout");
}

/// The cache is written right after the completion, so it can trail the
/// status by a moment.
async fn wait_for_cache_entries(client: &reqwest::Client, base_url: &str, expected: u64) {
    for _ in 0..200 {
        let body: Value = client
            .get(format!("{}/admin/jobs/stats", base_url))
            .header("X-Admin-Token", ADMIN_TOKEN)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if body["cache_entries"].as_u64() == Some(expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("cache did not reach {expected} entries within timeout");
}

#[tokio::test]
async fn health_is_public() {
    let srv = TestServer::spawn().await;
    let res = reqwest::get(format!("{}/health", srv.base_url)).await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn caller_id_is_required() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/jobs", srv.base_url))
        .json(&json!({"type": "exam_analysis", "input": {"doc": "X"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = client
        .get(format!("{}/jobs/{}", srv.base_url, Uuid::new_v4()))
        .header("X-Caller-Id", "not-a-uuid")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn submit_then_duplicate_joins_the_same_job() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let caller = Uuid::new_v4();
    let body = json!({"type": "food_image_analysis", "input": {"image": "lunch.jpg", "portion": 1}});

    let (status, first) = submit(&client, &srv.base_url, caller, body).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(first["status"], "pending");
    assert_eq!(first["deduplicated"], false);
    let job_id = first["job_id"].as_str().unwrap().to_string();

    // Same input with keys reordered.
    let reordered = json!({"type": "food_image_analysis", "input": {"portion": 1, "image": "lunch.jpg"}});
    let (status, second) = submit(&client, &srv.base_url, caller, reordered).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(second["deduplicated"], true);
    assert_eq!(second["job_id"], job_id.as_str());

    let (status, view) = get_status(&client, &srv.base_url, caller, &job_id).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["status"], "pending");
    assert_eq!(view["type"], "food_image_analysis");
    assert_eq!(view["job_id"], job_id.as_str());
}

#[tokio::test]
async fn status_is_uniformly_not_found_for_foreign_and_absent_jobs() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let owner = Uuid::new_v4();

    let (_, created) = submit(
        &client,
        &srv.base_url,
        owner,
        json!({"type": "medical_report", "input": {"patient": "p-1"}}),
    )
    .await;
    let job_id = created["job_id"].as_str().unwrap();

    let (foreign_status, foreign_body) =
        get_status(&client, &srv.base_url, Uuid::new_v4(), job_id).await;
    let (absent_status, absent_body) =
        get_status(&client, &srv.base_url, owner, &Uuid::new_v4().to_string()).await;

    assert_eq!(foreign_status, StatusCode::NOT_FOUND);
    assert_eq!(absent_status, StatusCode::NOT_FOUND);
    assert_eq!(foreign_body, absent_body);

    // Query-string variant.
    let res = client
        .get(format!("{}/jobs/status?job_id={}", srv.base_url, job_id))
        .header("X-Caller-Id", owner.to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn bad_requests_are_rejected_with_400() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let caller = Uuid::new_v4();

    let (status, body) = submit(
        &client,
        &srv.base_url,
        caller,
        json!({"type": "horoscope", "input": {"sign": "leo"}}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");

    let (status, _) = submit(
        &client,
        &srv.base_url,
        caller,
        json!({"type": "exam_analysis", "input": [1, 2, 3]}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = submit(&client, &srv.base_url, caller, json!({"input": {}})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    for url in [
        format!("{}/jobs/status", srv.base_url),
        format!("{}/jobs/status?job_id=", srv.base_url),
        format!("{}/jobs/status?job_id=nope", srv.base_url),
        format!("{}/jobs/not-a-uuid", srv.base_url),
    ] {
        let res = client
            .get(&url)
            .header("X-Caller-Id", caller.to_string())
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::BAD_REQUEST, "{url}");
    }
}

#[tokio::test]
async fn completed_job_answers_repeat_submissions_from_cache() {
    let mut analyzers = AnalyzerRegistry::new();
    analyzers.register_fn(JobKind::ExamAnalysis, |input: Value| async move {
        Ok(json!({"summary": "normal", "doc": input["doc"].clone()}))
    });
    let srv = TestServer::spawn_with_workers(analyzers).await;
    let client = reqwest::Client::new();
    let caller = Uuid::new_v4();
    let body = json!({"type": "exam_analysis", "input": {"doc": "X"}});

    let (status, created) = submit(&client, &srv.base_url, caller, body.clone()).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = created["job_id"].as_str().unwrap();

    let done = wait_for_status(&client, &srv.base_url, caller, job_id, "completed").await;
    assert_eq!(done["result"]["summary"], "normal");
    wait_for_cache_entries(&client, &srv.base_url, 1).await;

    // A different caller submitting the same work gets the cached response.
    let (status, cached) = submit(&client, &srv.base_url, Uuid::new_v4(), body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cached["cached"], true);
    assert_eq!(cached["result"]["doc"], "X");
    let key = cached["cache_key"].as_str().unwrap();
    assert!(key.starts_with("exam_analysis:"));
    assert_eq!(key.len(), "exam_analysis:".len() + 64);
}

#[tokio::test]
async fn validation_failure_is_reported_as_failed() {
    let mut analyzers = AnalyzerRegistry::new();
    analyzers.register_fn(JobKind::NutritionCalculation, |_input: Value| async move {
        Err(AnalyzerError::validation("unknown food"))
    });
    let srv = TestServer::spawn_with_workers(analyzers).await;
    let client = reqwest::Client::new();
    let caller = Uuid::new_v4();

    let (_, created) = submit(
        &client,
        &srv.base_url,
        caller,
        json!({"type": "nutrition_calculation", "input": {"foods": ["???"]}}),
    )
    .await;
    let job_id = created["job_id"].as_str().unwrap();

    let failed = wait_for_status(&client, &srv.base_url, caller, job_id, "failed").await;
    assert_eq!(failed["attempts"], 1);
    assert!(failed["error_message"].as_str().unwrap().contains("unknown food"));

    // Failures are never cached.
    let (status, again) = submit(
        &client,
        &srv.base_url,
        caller,
        json!({"type": "nutrition_calculation", "input": {"foods": ["???"]}}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(again["deduplicated"], false);
}

#[tokio::test]
async fn admin_routes_require_the_token() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let url = format!("{}/admin/jobs/stats", srv.base_url);

    let res = client.get(&url).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = client
        .get(&url)
        .header("X-Admin-Token", "guess")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = client
        .get(&url)
        .header("X-Admin-Token", ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["total"], 0);
    assert_eq!(body["cache_entries"], 0);
}

#[tokio::test]
async fn admin_routes_are_refused_without_a_configured_token() {
    let srv = TestServer::spawn_with(test_config(None), None).await;
    let res = reqwest::Client::new()
        .get(format!("{}/admin/jobs/stats", srv.base_url))
        .header("X-Admin-Token", ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn admin_overrides_follow_the_state_machine() {
    let srv = TestServer::spawn().await;
    let client = reqwest::Client::new();
    let caller = Uuid::new_v4();

    let (_, created) = submit(
        &client,
        &srv.base_url,
        caller,
        json!({"type": "exam_analysis", "input": {"doc": "pending"}}),
    )
    .await;
    let job_id = created["job_id"].as_str().unwrap();

    // Not processing: reset is refused.
    let res = client
        .post(format!("{}/admin/jobs/{}/reset", srv.base_url, job_id))
        .header("X-Admin-Token", ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    // Not failed: requeue is refused.
    let res = client
        .post(format!("{}/admin/jobs/{}/requeue", srv.base_url, job_id))
        .header("X-Admin-Token", ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    let res = client
        .post(format!("{}/admin/jobs/{}/reset", srv.base_url, Uuid::new_v4()))
        .header("X-Admin-Token", ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);

    let res = client
        .post(format!("{}/admin/cache/cleanup", srv.base_url))
        .header("X-Admin-Token", ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["removed"], 0);
}
