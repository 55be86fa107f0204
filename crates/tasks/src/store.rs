//! Task persistence
//!
//! Writes that can race (a webhook and a recall finishing the same subtask,
//! two aggregations of one task) are conditional, and report whether they
//! applied.

use std::collections::HashMap;
use std::sync::Arc;

use aigc_shared::TaskStatus;
use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{TaskError, TaskResult};
use crate::model::{SubTask, Task, TaskResponse};

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a task and all of its subtasks, or nothing
    async fn insert_task(&self, task: &Task, sub_tasks: &[SubTask]) -> TaskResult<()>;

    async fn get_task(&self, id: Uuid) -> TaskResult<Option<Task>>;

    async fn get_sub_task(&self, id: Uuid) -> TaskResult<Option<SubTask>>;

    /// Subtasks of a task in creation order
    async fn list_sub_tasks(&self, task_id: Uuid) -> TaskResult<Vec<SubTask>>;

    /// Set status and response only if the task is still in `from`
    async fn transition_task(
        &self,
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        response: &TaskResponse,
    ) -> TaskResult<bool>;

    async fn set_actual_credits(&self, id: Uuid, actual_credits: i64) -> TaskResult<()>;

    /// Write a subtask's status and response unless it is already COMPLETED
    async fn save_sub_task(&self, sub_task: &SubTask) -> TaskResult<bool>;

    /// Record the provider's tracking id without touching status or outcome
    async fn record_submission(
        &self,
        id: Uuid,
        tracking_id: &str,
        provider_meta: Option<&Value>,
    ) -> TaskResult<()>;

    /// Subtasks left PROCESSING since before `before`
    async fn list_stalled_sub_tasks(&self, before: OffsetDateTime) -> TaskResult<Vec<SubTask>>;
}

#[derive(Debug, Default)]
struct MemoryTables {
    tasks: HashMap<Uuid, Task>,
    sub_tasks: HashMap<Uuid, SubTask>,
}

/// Store held in process memory
#[derive(Debug, Clone, Default)]
pub struct MemoryTaskStore {
    tables: Arc<RwLock<MemoryTables>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn tasks(&self) -> Vec<Task> {
        self.tables.read().await.tasks.values().cloned().collect()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert_task(&self, task: &Task, sub_tasks: &[SubTask]) -> TaskResult<()> {
        let mut tables = self.tables.write().await;
        if tables.tasks.contains_key(&task.id) {
            return Err(TaskError::Database(format!("task {} already exists", task.id)));
        }
        tables.tasks.insert(task.id, task.clone());
        for sub_task in sub_tasks {
            tables.sub_tasks.insert(sub_task.id, sub_task.clone());
        }
        Ok(())
    }

    async fn get_task(&self, id: Uuid) -> TaskResult<Option<Task>> {
        Ok(self.tables.read().await.tasks.get(&id).cloned())
    }

    async fn get_sub_task(&self, id: Uuid) -> TaskResult<Option<SubTask>> {
        Ok(self.tables.read().await.sub_tasks.get(&id).cloned())
    }

    async fn list_sub_tasks(&self, task_id: Uuid) -> TaskResult<Vec<SubTask>> {
        let tables = self.tables.read().await;
        let mut subs: Vec<SubTask> = tables
            .sub_tasks
            .values()
            .filter(|s| s.task_id == task_id)
            .cloned()
            .collect();
        subs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(subs)
    }

    async fn transition_task(
        &self,
        id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
        response: &TaskResponse,
    ) -> TaskResult<bool> {
        let mut tables = self.tables.write().await;
        let task = tables.tasks.get_mut(&id).ok_or(TaskError::TaskNotFound(id))?;
        if task.status != from {
            return Ok(false);
        }
        task.status = to;
        task.response = response.clone();
        task.updated_at = OffsetDateTime::now_utc();
        Ok(true)
    }

    async fn set_actual_credits(&self, id: Uuid, actual_credits: i64) -> TaskResult<()> {
        let mut tables = self.tables.write().await;
        let task = tables.tasks.get_mut(&id).ok_or(TaskError::TaskNotFound(id))?;
        task.actual_credits = actual_credits;
        task.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn save_sub_task(&self, sub_task: &SubTask) -> TaskResult<bool> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .sub_tasks
            .get_mut(&sub_task.id)
            .ok_or(TaskError::SubTaskNotFound(sub_task.id))?;
        if stored.status == TaskStatus::Completed {
            return Ok(false);
        }
        stored.status = sub_task.status;
        stored.response = sub_task.response.clone();
        stored.updated_at = sub_task.updated_at;
        Ok(true)
    }

    async fn record_submission(
        &self,
        id: Uuid,
        tracking_id: &str,
        provider_meta: Option<&Value>,
    ) -> TaskResult<()> {
        let mut tables = self.tables.write().await;
        let stored = tables
            .sub_tasks
            .get_mut(&id)
            .ok_or(TaskError::SubTaskNotFound(id))?;
        stored.response.tracking_id = Some(tracking_id.to_string());
        if let Some(meta) = provider_meta {
            stored.response.provider_meta = Some(meta.clone());
        }
        stored.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn list_stalled_sub_tasks(&self, before: OffsetDateTime) -> TaskResult<Vec<SubTask>> {
        let tables = self.tables.read().await;
        let mut stalled: Vec<SubTask> = tables
            .sub_tasks
            .values()
            .filter(|s| s.status == TaskStatus::Processing && s.updated_at < before)
            .cloned()
            .collect();
        stalled.sort_by_key(|s| s.updated_at);
        Ok(stalled)
    }
}
