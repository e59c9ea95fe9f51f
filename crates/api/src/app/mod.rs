//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: stores, submitter, status reporter, admin actions
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request DTOs and response mapping
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router (public entrypoint used by `main.rs` and the
/// black-box tests).
pub fn build_app(services: Arc<AppServices>) -> Router {
    let admin_state = middleware::AdminState {
        token: services.admin_token.as_deref().map(Arc::from),
    };

    // Caller routes: require X-Caller-Id.
    let protected = routes::router()
        .layer(Extension(services.clone()))
        .layer(axum::middleware::from_fn(middleware::caller_middleware));

    // Operator routes: require X-Admin-Token.
    let admin = routes::admin_router()
        .layer(Extension(services))
        .layer(axum::middleware::from_fn_with_state(
            admin_state,
            middleware::admin_middleware,
        ));

    Router::new()
        .route("/health", get(routes::system::health))
        .merge(protected)
        .nest("/admin", admin)
        .layer(ServiceBuilder::new())
}

pub use services::AppServices;
