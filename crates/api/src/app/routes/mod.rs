use axum::{
    Router,
    routing::{get, post},
};

pub mod admin;
pub mod jobs;
pub mod system;

/// Router for caller-scoped endpoints.
pub fn router() -> Router {
    Router::new().nest("/jobs", jobs::router())
}

/// Router for operator endpoints (mounted under `/admin`).
pub fn admin_router() -> Router {
    Router::new()
        .route("/jobs/stats", get(admin::job_stats))
        .route("/jobs/:job_id/reset", post(admin::reset_job))
        .route("/jobs/:job_id/requeue", post(admin::requeue_job))
        .route("/cache/cleanup", post(admin::cleanup_cache))
}
