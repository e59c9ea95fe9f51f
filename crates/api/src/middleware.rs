use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

use assay_core::OwnerId;

use crate::context::CallerContext;

pub const CALLER_HEADER: &str = "x-caller-id";
pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Resolve the caller from `X-Caller-Id` and attach a [`CallerContext`].
pub async fn caller_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let owner_id = extract_caller(req.headers())?;
    req.extensions_mut().insert(CallerContext::new(owner_id));
    Ok(next.run(req).await)
}

#[derive(Clone)]
pub struct AdminState {
    /// `None` when no admin token is configured; every admin call is refused.
    pub token: Option<Arc<str>>,
}

pub async fn admin_middleware(
    State(state): State<AdminState>,
    req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(expected) = state.token.as_deref() else {
        return Err(StatusCode::FORBIDDEN);
    };

    let presented = req
        .headers()
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if !constant_time_eq(presented.as_bytes(), expected.as_bytes()) {
        tracing::warn!("admin request with a wrong token");
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(req).await)
}

fn extract_caller(headers: &HeaderMap) -> Result<OwnerId, StatusCode> {
    let header = headers
        .get(CALLER_HEADER)
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let header = header.to_str().map_err(|_| StatusCode::UNAUTHORIZED)?;

    let uuid = Uuid::parse_str(header.trim()).map_err(|_| StatusCode::UNAUTHORIZED)?;
    Ok(OwnerId::from_uuid(uuid))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
