use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use assay_infra::cache::CacheError;
use assay_infra::jobs::{AdminError, JobStoreError, SubmitError};

pub fn submit_error_to_response(err: SubmitError) -> axum::response::Response {
    match err {
        SubmitError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        SubmitError::Store(e) => store_error_to_response(e),
    }
}

pub fn admin_error_to_response(err: AdminError) -> axum::response::Response {
    match err {
        AdminError::NotFound(_) => not_found(),
        AdminError::InvalidState { .. } => {
            json_error(StatusCode::CONFLICT, "invalid_state", err.to_string())
        }
        AdminError::Store(e) => store_error_to_response(e),
    }
}

pub fn store_error_to_response(err: JobStoreError) -> axum::response::Response {
    tracing::error!(error = %err, "job store failure");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err.to_string())
}

pub fn cache_error_to_response(err: CacheError) -> axum::response::Response {
    tracing::error!(error = %err, "cache store failure");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "cache_error", err.to_string())
}

/// Same body for absent and foreign jobs.
pub fn not_found() -> axum::response::Response {
    json_error(StatusCode::NOT_FOUND, "not_found", "job not found")
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
