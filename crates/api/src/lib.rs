// API crate clippy configuration
#![allow(clippy::result_large_err)] // ApiError conversions take TaskError by value
// Test code patterns:
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! AIGC API Library
//!
//! HTTP surface of the generation backend: task creation, recall, provider
//! callbacks and health.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::{Config, ConfigError};
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
