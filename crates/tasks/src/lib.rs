// Tasks crate clippy configuration
#![allow(clippy::result_large_err)] // TaskError wraps BillingError
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Generation task orchestration
//!
//! A task asks one or more models for media. It is split into one subtask
//! per model, each routed to an external provider, and paid for through a
//! credit reservation that is settled once submission ends.
//!
//! ## Features
//!
//! - **Orchestration**: Validate, price, persist, reserve, then run in the background
//! - **Providers**: fal.ai, kie.ai and OpenAI-Next behind one adapter trait
//! - **Webhooks**: Signed callback URLs and idempotent result ingestion
//! - **Aggregation**: Task status from subtask statuses, with refunds on failure
//! - **Recall**: Owner-initiated and scheduled polling of unfinished subtasks

pub mod aggregator;
pub mod catalog;
pub mod collaborators;
pub mod error;
pub mod model;
pub mod orchestrator;
pub mod params;
pub mod postgres;
pub mod providers;
pub mod store;
pub mod webhook;


pub use aggregator::StatusAggregator;
pub use catalog::ModelCatalog;
pub use collaborators::{
    AccountResolver, Catalogs, CreditCalculator, MediaPostProcessor, MemoryAccountResolver,
    PassthroughPostProcessor, ProviderRouter, SystemRequestResolver,
};
pub use error::{ProviderError, TaskError, TaskResult};
pub use model::{
    CreateTaskParams, MediaAsset, MediaResult, RecallState, SubTask, SubTaskRecall, Task,
    TaskMetadata, TaskRecallResult, TaskRequest, TaskResponse,
};
pub use orchestrator::{IngestOutcome, Settlement, TaskLaunch, TaskOrchestrator};
pub use postgres::PgTaskStore;
pub use providers::{
    FalAdapter, FalConfig, KieAiAdapter, KieAiConfig, OpenAiNextAdapter, OpenAiNextConfig,
    ProviderAdapter, ProviderRegistry,
};
pub use store::{MemoryTaskStore, TaskStore};
pub use webhook::WebhookSigner;
