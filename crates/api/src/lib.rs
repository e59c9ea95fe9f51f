//! HTTP API: routing, caller identity, and request/response mapping.

pub mod app;
pub mod context;
pub mod middleware;
