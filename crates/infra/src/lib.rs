//! Infrastructure layer: job/cache storage, worker runtime, configuration.

pub mod cache;
pub mod config;
pub mod db;
pub mod jobs;
pub mod singleflight;
pub mod workers;

pub use config::{AssayConfig, ConfigError};

mod integration_tests;
