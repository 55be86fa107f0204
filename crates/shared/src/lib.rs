#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! AIGC Shared
//!
//! Types and database plumbing shared by the billing, tasks, api and worker crates.

pub mod db;
pub mod types;

pub use db::{create_pool, create_worker_pool, run_migrations};
pub use types::{MediaKind, ParseEnumError, ProviderId, TaskStatus, TaskType};
