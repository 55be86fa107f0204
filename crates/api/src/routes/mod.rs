//! HTTP routes

mod caller;
mod tasks;
mod webhooks;


use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::state::AppState;

pub use caller::CallerId;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/tasks", post(tasks::create_task))
        .route("/api/tasks/{task_id}", get(tasks::get_task))
        .route("/api/tasks/{task_id}/recall", post(tasks::recall_task))
        .route("/webhooks/fal/{sub_task_id}", post(webhooks::fal_webhook))
        .route("/webhooks/kie/{sub_task_id}", post(webhooks::kie_webhook))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
