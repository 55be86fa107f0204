//! Provider callback routes
//!
//! Each callback URL carries an HMAC token bound to its subtask, so a
//! payload can only ever land on the subtask it was issued for.

use aigc_shared::{ProviderId, TaskStatus};
use aigc_tasks::{IngestOutcome, TaskStore};
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WebhookQuery {
    pub token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_task_status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_status: Option<TaskStatus>,
}

pub async fn fal_webhook(
    State(state): State<AppState>,
    Path(sub_task_id): Path<Uuid>,
    Query(query): Query<WebhookQuery>,
    Json(payload): Json<Value>,
) -> ApiResult<Json<WebhookAck>> {
    ingest(&state, ProviderId::Fal, sub_task_id, query, payload).await
}

pub async fn kie_webhook(
    State(state): State<AppState>,
    Path(sub_task_id): Path<Uuid>,
    Query(query): Query<WebhookQuery>,
    Json(payload): Json<Value>,
) -> ApiResult<Json<WebhookAck>> {
    ingest(&state, ProviderId::KieAi, sub_task_id, query, payload).await
}

async fn ingest(
    state: &AppState,
    provider: ProviderId,
    sub_task_id: Uuid,
    query: WebhookQuery,
    payload: Value,
) -> ApiResult<Json<WebhookAck>> {
    let token = query.token.ok_or(ApiError::InvalidWebhookToken)?;
    if !state.signer.verify(sub_task_id, &token) {
        tracing::warn!(sub_task_id = %sub_task_id, provider = %provider, "Rejected webhook with bad token");
        return Err(ApiError::InvalidWebhookToken);
    }

    let sub_task = state
        .orchestrator
        .store()
        .get_sub_task(sub_task_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("subtask {}", sub_task_id)))?;
    if sub_task.provider != provider {
        tracing::warn!(
            sub_task_id = %sub_task_id,
            expected = %sub_task.provider,
            received = %provider,
            "Webhook arrived on another provider's route"
        );
        return Err(ApiError::NotFound(format!("subtask {}", sub_task_id)));
    }

    let outcome = state
        .orchestrator
        .ingest_webhook(sub_task_id, &payload, None)
        .await?;

    let ack = match outcome {
        IngestOutcome::Applied {
            sub_task_status,
            task_status,
        } => WebhookAck {
            status: "applied",
            sub_task_status: Some(sub_task_status),
            task_status: Some(task_status),
        },
        IngestOutcome::AlreadyCompleted => WebhookAck {
            status: "ignored",
            sub_task_status: None,
            task_status: None,
        },
    };
    Ok(Json(ack))
}
