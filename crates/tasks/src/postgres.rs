//! Postgres-backed task store

use aigc_shared::TaskStatus;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{TaskError, TaskResult};
use crate::model::{
    SubTask, SubTaskRequest, SubTaskResponse, Task, TaskMetadata, TaskRequest, TaskResponse,
};
use crate::store::TaskStore;

const TASK_COLUMNS: &str = r#"
    id, task_type, user_id, billing_user_id, is_public, request, system_request,
    metadata, status, credits, actual_credits, response, created_at, updated_at
"#;

const SUB_TASK_COLUMNS: &str = r#"
    id, task_id, model_code, provider, request, status, credits, response,
    created_at, updated_at
"#;

#[derive(Debug, sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    task_type: String,
    user_id: Uuid,
    billing_user_id: Option<Uuid>,
    is_public: bool,
    request: Json<TaskRequest>,
    system_request: Json<Value>,
    metadata: Json<TaskMetadata>,
    status: String,
    credits: i64,
    actual_credits: i64,
    response: Json<TaskResponse>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<TaskRow> for Task {
    type Error = TaskError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            task_type: row.task_type.parse()?,
            user_id: row.user_id,
            billing_user_id: row.billing_user_id,
            is_public: row.is_public,
            request: row.request.0,
            system_request: row.system_request.0,
            metadata: row.metadata.0,
            status: row.status.parse()?,
            credits: row.credits,
            actual_credits: row.actual_credits,
            response: row.response.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubTaskRow {
    id: Uuid,
    task_id: Uuid,
    model_code: String,
    provider: String,
    request: Json<SubTaskRequest>,
    status: String,
    credits: i64,
    response: Json<SubTaskResponse>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubTaskRow> for SubTask {
    type Error = TaskError;

    fn try_from(row: SubTaskRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            task_id: row.task_id,
            model_code: row.model_code,
            provider: row.provider.parse()?,
            request: row.request.0,
            status: row.status.parse()?,
            credits: row.credits,
            response: row.response.0,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn insert_task(&self, task: &Task, sub_tasks: &[SubTask]) -> TaskResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO tasks
                (id, task_type, user_id, billing_user_id, is_public, request, system_request,
                 metadata, status, credits, actual_credits, response, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(task.id)
        .bind(task.task_type.as_str())
        .bind(task.user_id)
        .bind(task.billing_user_id)
        .bind(task.is_public)
        .bind(Json(&task.request))
        .bind(Json(&task.system_request))
        .bind(Json(&task.metadata))
        .bind(task.status.as_str())
        .bind(task.credits)
        .bind(task.actual_credits)
        .bind(Json(&task.response))
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&mut *tx)
        .await?;

        for sub_task in sub_tasks {
            sqlx::query(
                r#"
                INSERT INTO sub_tasks
                    (id, task_id, model_code, provider, request, status, credits, response,
                     created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(sub_task.id)
            .bind(sub_task.task_id)
            .bind(&sub_task.model_code)
            .bind(sub_task.provider.as_str())
            .bind(Json(&sub_task.request))
            .bind(sub_task.status.as_str())
            .bind(sub_task.credits)
            .bind(Json(&sub_task.response))
            .bind(sub_task.created_at)
            .bind(sub_task.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> TaskResult<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1");
        let row = sqlx::query_as::<_, TaskRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(Task::try_from).transpose()
    }

    async fn get_sub_task(&self, id: Uuid) -> TaskResult<Option<SubTask>> {
        let sql = format!("SELECT {SUB_TASK_COLUMNS} FROM sub_tasks WHERE id = $1");
        let row = sqlx::query_as::<_, SubTaskRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(SubTask::try_from).transpose()
    }

    async fn list_sub_tasks(&self, task_id: Uuid) -> TaskResult<Vec<SubTask>> {
        let sql = format!(
            "SELECT {SUB_TASK_COLUMNS} FROM sub_tasks WHERE task_id = $1 ORDER BY created_at, id"
        );
        let rows = sqlx::query_as::<_, SubTaskRow>(&sql)
            .bind(task_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(SubTask::try_from).collect()
    }

    async fn transition_task(
        &self,
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        response: &TaskResponse,
    ) -> TaskResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = $3, response = $4, updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(Json(response))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn set_actual_credits(&self, id: Uuid, actual_credits: i64) -> TaskResult<()> {
        let result =
            sqlx::query("UPDATE tasks SET actual_credits = $2, updated_at = NOW() WHERE id = $1")
                .bind(id)
                .bind(actual_credits)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(TaskError::TaskNotFound(id));
        }
        Ok(())
    }

    async fn save_sub_task(&self, sub_task: &SubTask) -> TaskResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sub_tasks
            SET status = $2, response = $3, updated_at = $4
            WHERE id = $1 AND status <> 'COMPLETED'
            "#,
        )
        .bind(sub_task.id)
        .bind(sub_task.status.as_str())
        .bind(Json(&sub_task.response))
        .bind(sub_task.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_submission(
        &self,
        id: Uuid,
        tracking_id: &str,
        provider_meta: Option<&Value>,
    ) -> TaskResult<()> {
        // Merge into the stored JSON so a webhook that already landed keeps its outcome
        let result = sqlx::query(
            r#"
            UPDATE sub_tasks
            SET response = response || jsonb_strip_nulls(jsonb_build_object(
                    'tracking_id', $2::text,
                    'provider_meta', $3::jsonb
                )),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(tracking_id)
        .bind(provider_meta.map(Json))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(TaskError::SubTaskNotFound(id));
        }
        Ok(())
    }

    async fn list_stalled_sub_tasks(&self, before: OffsetDateTime) -> TaskResult<Vec<SubTask>> {
        let sql = format!(
            r#"
            SELECT {SUB_TASK_COLUMNS}
            FROM sub_tasks
            WHERE status = 'PROCESSING' AND updated_at < $1
            ORDER BY updated_at
            LIMIT 100
            "#
        );
        let rows = sqlx::query_as::<_, SubTaskRow>(&sql)
            .bind(before)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(SubTask::try_from).collect()
    }
}
