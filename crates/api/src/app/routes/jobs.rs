//! Caller-scoped job routes: submit and poll.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, rejection::JsonRejection},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use assay_core::JobId;

use crate::app::{dto, errors, services::AppServices};
use crate::context::CallerContext;

pub fn router() -> Router {
    Router::new()
        .route("/", post(submit_job))
        .route("/status", get(get_job_status))
        .route("/:job_id", get(get_job))
}

/// POST /jobs - Submit an analysis; answers from cache when possible
pub async fn submit_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(caller): Extension<CallerContext>,
    body: Result<Json<dto::SubmitJobRequest>, JsonRejection>,
) -> axum::response::Response {
    let Json(body) = match body {
        Ok(b) => b,
        Err(rejection) => {
            return errors::json_error(
                StatusCode::BAD_REQUEST,
                "validation_error",
                rejection.body_text(),
            );
        }
    };

    let kind = match dto::parse_job_kind(&body.kind) {
        Ok(k) => k,
        Err(resp) => return resp,
    };

    match services
        .submitter
        .submit(caller.owner_id(), kind, body.input, body.priority)
        .await
    {
        Ok(submission) => dto::submission_response(submission),
        Err(e) => errors::submit_error_to_response(e),
    }
}

/// GET /jobs/:job_id
pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(caller): Extension<CallerContext>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    match dto::parse_job_id(&job_id) {
        Ok(id) => status_response(&services, caller, id).await,
        Err(resp) => resp,
    }
}

/// GET /jobs/status?job_id=...
pub async fn get_job_status(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(caller): Extension<CallerContext>,
    Query(query): Query<dto::StatusQuery>,
) -> axum::response::Response {
    let Some(raw) = query.job_id.filter(|s| !s.trim().is_empty()) else {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "missing_job_id",
            "job_id query parameter is required",
        );
    };
    match dto::parse_job_id(&raw) {
        Ok(id) => status_response(&services, caller, id).await,
        Err(resp) => resp,
    }
}

async fn status_response(
    services: &AppServices,
    caller: CallerContext,
    job_id: JobId,
) -> axum::response::Response {
    match services.status.status(caller.owner_id(), job_id).await {
        Ok(Some(view)) => (StatusCode::OK, Json(view)).into_response(),
        Ok(None) => errors::not_found(),
        Err(e) => errors::store_error_to_response(e),
    }
}
