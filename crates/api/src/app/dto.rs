use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use serde_json::{Value, json};

use assay_core::{JobId, JobKind};
use assay_infra::jobs::Submission;

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub input: Value,
    pub priority: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    pub job_id: Option<String>,
}

// -------------------------
// Parsing helpers
// -------------------------

pub fn parse_job_kind(s: &str) -> Result<JobKind, axum::response::Response> {
    s.parse::<JobKind>().map_err(|_| {
        let supported: Vec<&str> = JobKind::ALL.iter().map(|k| k.as_str()).collect();
        errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            format!("unsupported job type {s:?}; expected one of: {}", supported.join(", ")),
        )
    })
}

pub fn parse_job_id(s: &str) -> Result<JobId, axum::response::Response> {
    s.trim().parse::<JobId>().map_err(|_| {
        errors::json_error(StatusCode::BAD_REQUEST, "invalid_job_id", "job_id must be a UUID")
    })
}

// -------------------------
// Response mapping
// -------------------------

pub fn submission_response(submission: Submission) -> axum::response::Response {
    match submission {
        Submission::Cached {
            cache_key,
            response,
        } => (
            StatusCode::OK,
            axum::Json(json!({
                "cached": true,
                "cache_key": cache_key.as_str(),
                "result": response,
            })),
        )
            .into_response(),
        Submission::Enqueued { job_id } => accepted(job_id, false),
        Submission::Joined { job_id } => accepted(job_id, true),
    }
}

fn accepted(job_id: JobId, deduplicated: bool) -> axum::response::Response {
    (
        StatusCode::ACCEPTED,
        axum::Json(json!({
            "job_id": job_id.to_string(),
            "status": "pending",
            "deduplicated": deduplicated,
        })),
    )
        .into_response()
}
