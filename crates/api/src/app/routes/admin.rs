//! Operator routes. Guarded by `X-Admin-Token` (see [`crate::middleware::admin_middleware`]).
//!
//! Overrides go through the job store's conditional transitions; an operator
//! cannot move a job along an edge a worker could not.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::json;

use assay_core::JobStatusView;

use crate::app::{dto, errors, services::AppServices};

/// POST /admin/jobs/:job_id/reset - Force a `processing` job back to `pending`
pub async fn reset_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id = match dto::parse_job_id(&job_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.admin.reset(job_id).await {
        Ok(job) => (StatusCode::OK, Json(JobStatusView::from(&job))).into_response(),
        Err(e) => errors::admin_error_to_response(e),
    }
}

/// POST /admin/jobs/:job_id/requeue - Give a `failed` job a fresh attempt budget
pub async fn requeue_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id = match dto::parse_job_id(&job_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.admin.requeue_failed(job_id).await {
        Ok(job) => (StatusCode::OK, Json(JobStatusView::from(&job))).into_response(),
        Err(e) => errors::admin_error_to_response(e),
    }
}

/// GET /admin/jobs/stats - Job counts by status plus cache size
pub async fn job_stats(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    let jobs = match services.admin.stats().await {
        Ok(s) => s,
        Err(e) => return errors::admin_error_to_response(e),
    };
    // Cache size is informational; a cache outage does not hide job counts.
    let cache_entries = services.cache.entry_count().await.ok();

    Json(json!({
        "jobs": jobs,
        "total": jobs.total(),
        "cache_entries": cache_entries,
        "cache_enabled": services.cache.is_enabled(),
    }))
    .into_response()
}

/// POST /admin/cache/cleanup - Delete expired cache entries now
pub async fn cleanup_cache(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Response {
    match services.cache.cleanup().await {
        Ok(removed) => Json(json!({ "removed": removed })).into_response(),
        Err(e) => errors::cache_error_to_response(e),
    }
}
