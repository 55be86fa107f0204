//! Task routes

use aigc_shared::TaskType;
use aigc_tasks::{
    CreateTaskParams, Settlement, SubTask, Task, TaskLaunch, TaskMetadata, TaskRecallResult,
    TaskRequest, TaskStore,
};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::caller::CallerId;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateTaskBody {
    pub task_type: TaskType,
    #[serde(default = "default_public")]
    pub is_public: bool,
    pub request: TaskRequest,
    #[serde(default)]
    pub metadata: TaskMetadata,
}

fn default_public() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct TaskDetail {
    #[serde(flatten)]
    pub task: Task,
    pub sub_tasks: Vec<SubTask>,
}

/// Create a task and start it in the background
pub async fn create_task(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Json(body): Json<CreateTaskBody>,
) -> ApiResult<(StatusCode, Json<Task>)> {
    let params = CreateTaskParams {
        user_id,
        task_type: body.task_type,
        is_public: body.is_public,
        request: body.request,
        metadata: body.metadata,
    };

    let TaskLaunch { task, settlement } = state.orchestrator.create_and_run(params).await?;

    let task_id = task.id;
    tokio::spawn(async move {
        match settlement.await {
            Ok(Ok(Settlement::Confirmed { transaction_id })) => {
                tracing::info!(task_id = %task_id, transaction_id = %transaction_id, "Task charge confirmed");
            }
            Ok(Ok(Settlement::Cancelled {
                transaction_id,
                reason,
            })) => {
                tracing::warn!(
                    task_id = %task_id,
                    transaction_id = %transaction_id,
                    reason = %reason,
                    "Task charge released"
                );
            }
            Ok(Ok(Settlement::NotCharged)) => {
                tracing::debug!(task_id = %task_id, "Task ran without a charge");
            }
            Ok(Err(e)) => {
                tracing::error!(task_id = %task_id, error = %e, "Task settlement failed");
            }
            Err(e) => {
                tracing::error!(task_id = %task_id, error = %e, "Task settlement did not finish");
            }
        }
    });

    Ok((StatusCode::CREATED, Json(task)))
}

/// A task with its subtasks, visible to its owner only
pub async fn get_task(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Path(task_id): Path<Uuid>,
) -> ApiResult<Json<TaskDetail>> {
    let task = state.orchestrator.get_task(task_id).await?;
    if task.user_id != user_id {
        return Err(ApiError::Forbidden("task belongs to another user".into()));
    }

    let sub_tasks = state.orchestrator.store().list_sub_tasks(task_id).await?;
    Ok(Json(TaskDetail { task, sub_tasks }))
}

/// Poll providers for the task's unfinished subtasks
pub async fn recall_task(
    State(state): State<AppState>,
    CallerId(user_id): CallerId,
    Path(task_id): Path<Uuid>,
) -> ApiResult<Json<TaskRecallResult>> {
    let result = state.orchestrator.recall(task_id, user_id).await?;
    Ok(Json(result))
}
