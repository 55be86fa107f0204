//! Task status aggregation and refund reconciliation
//!
//! A task's status is a pure function of its subtasks' statuses. Aggregation
//! may run any number of times per subtask update; only the call that wins
//! the status compare-and-set performs first-transition side effects.

use std::sync::Arc;

use aigc_billing::{CreditLedger, RefundReceipt};
use aigc_shared::TaskStatus;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{TaskError, TaskResult};
use crate::model::{StatusCounts, SubTask, SubTaskErrorSummary, Task, TaskResponse, RESPONSE_VERSION};
use crate::store::TaskStore;

/// Attempts before giving up on a task whose row keeps changing underneath us
const MAX_CAS_ATTEMPTS: usize = 5;

/// Task status implied by subtask counts
///
/// Any open subtask keeps the current status. Once all are terminal: all
/// completed is COMPLETED, some completed is PARTIALLY_COMPLETED, and none
/// completed is FAILED unless every subtask was uniformly ABORTED or
/// CANCELLED.
pub fn derive_status(current: TaskStatus, counts: &StatusCounts) -> TaskStatus {
    if counts.total == 0 || counts.pending + counts.processing > 0 {
        return current;
    }
    if counts.completed == counts.total {
        TaskStatus::Completed
    } else if counts.completed > 0 {
        TaskStatus::PartiallyCompleted
    } else if counts.aborted == counts.total {
        TaskStatus::Aborted
    } else if counts.cancelled == counts.total {
        TaskStatus::Cancelled
    } else {
        TaskStatus::Failed
    }
}

/// Recompute status and response for a task
pub fn summarize(task: &Task, sub_tasks: &[SubTask], now: OffsetDateTime) -> (TaskStatus, TaskResponse) {
    let counts = StatusCounts::tally(sub_tasks.iter().map(|s| &s.status));
    let status = derive_status(task.status, &counts);

    let mut response = task.response.clone();
    response.version = RESPONSE_VERSION;
    response.counts = counts;
    response.credits_consumed = sub_tasks
        .iter()
        .filter(|s| s.status == TaskStatus::Completed)
        .map(|s| s.credits)
        .sum();
    response.errors = sub_tasks
        .iter()
        .filter(|s| s.status.is_unsuccessful())
        .filter_map(|s| {
            s.response.error.as_ref().map(|e| SubTaskErrorSummary {
                sub_task_id: s.id,
                model_code: s.model_code.clone(),
                message: e.message.clone(),
            })
        })
        .collect();

    if status.is_terminal() && response.completed_at.is_none() {
        response.completed_at = Some(now);
        response.duration_ms = response
            .started_at
            .and_then(|started| i64::try_from((now - started).whole_milliseconds()).ok());
    }

    (status, response)
}

/// Credits the task should have had returned, given its current state
///
/// Unsuccessful subtasks are always owed back; subtasks still PENDING are
/// owed only once the task itself ended unsuccessfully. Never more than the
/// task was charged.
pub fn refund_due(task: &Task, sub_tasks: &[SubTask]) -> i64 {
    let unsuccessful: i64 = sub_tasks
        .iter()
        .filter(|s| s.status.is_unsuccessful())
        .map(|s| s.credits)
        .sum();
    let stranded: i64 = if task.status.is_unsuccessful() {
        sub_tasks
            .iter()
            .filter(|s| s.status == TaskStatus::Pending)
            .map(|s| s.credits)
            .sum()
    } else {
        0
    };
    (unsuccessful + stranded).min(task.credits)
}

#[derive(Clone)]
pub struct StatusAggregator {
    store: Arc<dyn TaskStore>,
    ledger: Arc<dyn CreditLedger>,
    /// Serializes refunds so two reconciliations never compute the same delta
    refund_gate: Arc<Mutex<()>>,
}

impl StatusAggregator {
    pub fn new(store: Arc<dyn TaskStore>, ledger: Arc<dyn CreditLedger>) -> Self {
        Self {
            store,
            ledger,
            refund_gate: Arc::new(Mutex::new(())),
        }
    }

    async fn load(&self, task_id: Uuid) -> TaskResult<(Task, Vec<SubTask>)> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or(TaskError::TaskNotFound(task_id))?;
        let sub_tasks = self.store.list_sub_tasks(task_id).await?;
        Ok((task, sub_tasks))
    }

    /// Recompute and persist a task's status, refunding on first entry into
    /// an adverse status
    #[tracing::instrument(skip(self))]
    pub async fn aggregate(&self, task_id: Uuid) -> TaskResult<TaskStatus> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (task, sub_tasks) = self.load(task_id).await?;
            let (status, response) = summarize(&task, &sub_tasks, OffsetDateTime::now_utc());

            if status == task.status && response == task.response {
                return Ok(status);
            }

            if !self
                .store
                .transition_task(task_id, task.status, status, &response)
                .await?
            {
                tracing::debug!(task_id = %task_id, "Task changed during aggregation, retrying");
                continue;
            }

            if status != task.status {
                tracing::info!(
                    task_id = %task_id,
                    from = %task.status,
                    to = %status,
                    completed = response.counts.completed,
                    total = response.counts.total,
                    "Task status changed"
                );
                if status.is_adverse() {
                    self.reconcile_refund(task_id).await?;
                }
            }
            return Ok(status);
        }

        Err(TaskError::Database(format!(
            "task {} kept changing during aggregation",
            task_id
        )))
    }

    /// Refund whatever the task is owed beyond what was already refunded
    ///
    /// Does nothing until the task is in an adverse status, the task was
    /// charged, and its deduction is confirmed. Refund failures are logged
    /// and returned.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile_refund(&self, task_id: Uuid) -> TaskResult<Option<RefundReceipt>> {
        let _gate = self.refund_gate.lock().await;

        let (task, sub_tasks) = self.load(task_id).await?;
        if task.credits == 0 || !task.status.is_adverse() {
            return Ok(None);
        }

        let Some(deduction) = self.ledger.find_task_deduction(task_id).await? else {
            tracing::debug!(task_id = %task_id, "No confirmed deduction yet, refund deferred");
            return Ok(None);
        };

        let due = refund_due(&task, &sub_tasks);
        let amount = (due - deduction.refund_amount).min(deduction.refundable());
        if amount <= 0 {
            return Ok(None);
        }

        let description = format!("task {} ended {}", task_id, task.status);
        let receipt = self
            .ledger
            .refund(deduction.id, amount, Some(&description))
            .await
            .map_err(|e| {
                tracing::error!(
                    task_id = %task_id,
                    transaction_id = %deduction.id,
                    amount = amount,
                    refunded_before = deduction.refund_amount,
                    error = %e,
                    "Task refund failed"
                );
                TaskError::from(e)
            })?;

        let actual_credits = receipt
            .task_actual_credits
            .map(|(_, credits)| credits)
            .unwrap_or(task.credits - receipt.transaction.refund_amount);
        self.store.set_actual_credits(task_id, actual_credits).await?;
        self.record_refunded(task_id, receipt.transaction.refund_amount)
            .await?;

        tracing::info!(
            task_id = %task_id,
            transaction_id = %deduction.id,
            refunded = receipt.refunded,
            actual_credits = actual_credits,
            "Refunded task credits"
        );
        Ok(Some(receipt))
    }

    async fn record_refunded(&self, task_id: Uuid, refunded: i64) -> TaskResult<()> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (task, _) = self.load(task_id).await?;
            let mut response = task.response.clone();
            response.credits_refunded = refunded;
            if self
                .store
                .transition_task(task_id, task.status, task.status, &response)
                .await?
            {
                return Ok(());
            }
        }
        Err(TaskError::Database(format!(
            "task {} kept changing while recording refund",
            task_id
        )))
    }
}
