//! Task orchestration
//!
//! `create` validates, prices, persists and reserves. `create_and_run` then
//! spawns the settlement continuation (`run`, then confirm or cancel the
//! reservation) and hands back its `JoinHandle`, so settlement failures are
//! observable instead of only logged. Results arrive through
//! `ingest_webhook`, either from provider callbacks, from `recall`, or inline
//! from providers that answer synchronously.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use aigc_billing::{BillingError, CreditLedger, CreditTransaction};
use aigc_shared::{MediaKind, TaskStatus};
use serde_json::Value;
use time::{Duration, OffsetDateTime};
use tokio::task::JoinHandle;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::aggregator::StatusAggregator;
use crate::collaborators::{
    AccountResolver, Catalogs, MediaPostProcessor, PassthroughPostProcessor, SubTaskPlan,
};
use crate::error::{ProviderError, TaskError, TaskResult};
use crate::model::{
    CreateTaskParams, RecallState, SubTask, SubTaskRecall, SubTaskRequest, SubTaskResponse, Task,
    TaskRecallResult, TaskResponse,
};
use crate::params;
use crate::providers::{ProviderRegistry, ProviderResult, RecallContext, RecallOutcome, SubmitContext};
use crate::store::TaskStore;
use crate::webhook::WebhookSigner;

/// Backoff for ledger settlement calls that hit a transient database error
fn settlement_backoff() -> impl Iterator<Item = StdDuration> {
    ExponentialBackoff::from_millis(10)
        .max_delay(StdDuration::from_secs(2))
        .map(jitter)
        .take(4)
}

/// How the credit hold of a launched task was settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// Every subtask was submitted; the reservation became a deduction
    Confirmed { transaction_id: Uuid },
    /// Submission stopped early; the reservation was released
    Cancelled { transaction_id: Uuid, reason: String },
    /// Zero-credit task, nothing was reserved
    NotCharged,
}

/// A created task and its running settlement continuation
#[derive(Debug)]
pub struct TaskLaunch {
    pub task: Task,
    pub settlement: JoinHandle<TaskResult<Settlement>>,
}

/// Effect of a webhook or recalled payload on its subtask
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Applied {
        sub_task_status: TaskStatus,
        task_status: TaskStatus,
    },
    /// The subtask had already completed; nothing changed
    AlreadyCompleted,
}

#[derive(Clone)]
pub struct TaskOrchestrator {
    store: Arc<dyn TaskStore>,
    ledger: Arc<dyn CreditLedger>,
    providers: ProviderRegistry,
    catalogs: Catalogs,
    accounts: Arc<dyn AccountResolver>,
    post_processor: Arc<dyn MediaPostProcessor>,
    signer: WebhookSigner,
    aggregator: StatusAggregator,
}

impl TaskOrchestrator {
    pub fn new(
        store: Arc<dyn TaskStore>,
        ledger: Arc<dyn CreditLedger>,
        providers: ProviderRegistry,
        catalogs: Catalogs,
        accounts: Arc<dyn AccountResolver>,
        signer: WebhookSigner,
    ) -> Self {
        let aggregator = StatusAggregator::new(store.clone(), ledger.clone());
        Self {
            store,
            ledger,
            providers,
            catalogs,
            accounts,
            post_processor: Arc::new(PassthroughPostProcessor),
            signer,
            aggregator,
        }
    }

    pub fn with_post_processor(mut self, post_processor: Arc<dyn MediaPostProcessor>) -> Self {
        self.post_processor = post_processor;
        self
    }

    pub fn aggregator(&self) -> &StatusAggregator {
        &self.aggregator
    }

    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    pub async fn get_task(&self, task_id: Uuid) -> TaskResult<Task> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or(TaskError::TaskNotFound(task_id))
    }

    fn plan_sub_tasks(&self, params: &CreateTaskParams, system_request: &Value) -> TaskResult<Vec<SubTaskPlan>> {
        if params.request.models.is_empty() {
            return Err(TaskError::Validation("at least one model is required".into()));
        }

        let mut seen = HashSet::new();
        let mut plans = Vec::with_capacity(params.request.models.len());
        for model_code in &params.request.models {
            if !seen.insert(model_code.as_str()) {
                return Err(TaskError::Validation(format!(
                    "model {} requested more than once",
                    model_code
                )));
            }

            let route = self.catalogs.router.route(
                model_code,
                params.task_type,
                &params.request,
                system_request,
            )?;
            let validated = params::validate(&route.parameters, &params.request.params_for(model_code))?;
            plans.push(SubTaskPlan {
                model_code: model_code.clone(),
                route,
                params: validated,
            });
        }
        Ok(plans)
    }

    /// Validate, price, persist and reserve; returns the reservation too
    async fn create_reserved(
        &self,
        params: CreateTaskParams,
    ) -> TaskResult<(Task, Option<CreditTransaction>)> {
        let system_request = self.catalogs.system_requests.resolve_system_request(
            params.task_type,
            &params.request,
            &params.metadata,
        )?;

        // Every subtask validates before anything is written
        let plans = self.plan_sub_tasks(&params, &system_request)?;

        let quote = self.catalogs.pricing.calculate_task_credits(
            params.task_type,
            &plans,
            &params.metadata,
            &system_request,
        )?;
        if quote.breakdown.len() != plans.len()
            || quote
                .breakdown
                .iter()
                .zip(&plans)
                .any(|(b, p)| b.model_code != p.model_code)
        {
            return Err(TaskError::Collaborator(
                "credit breakdown does not match the requested models".into(),
            ));
        }
        if quote.breakdown.iter().any(|b| b.credits < 0) {
            return Err(TaskError::Collaborator("negative credit price".into()));
        }

        let billing_user = self.accounts.get_or_create_billing_user(params.user_id).await?;
        if !params.is_public
            && !self
                .accounts
                .has_valid_private_task_permission(params.user_id)
                .await?
        {
            return Err(TaskError::PermissionDenied(
                "private tasks need an active subscription".into(),
            ));
        }

        let now = OffsetDateTime::now_utc();
        let task = Task {
            id: Uuid::new_v4(),
            task_type: params.task_type,
            user_id: params.user_id,
            billing_user_id: Some(billing_user.id),
            is_public: params.is_public,
            request: params.request,
            system_request,
            metadata: params.metadata,
            status: TaskStatus::Pending,
            credits: quote.total_credits,
            actual_credits: quote.total_credits,
            response: TaskResponse::default(),
            created_at: now,
            updated_at: now,
        };

        let media_kind = task.task_type.media_kind();
        let sub_tasks: Vec<SubTask> = plans
            .into_iter()
            .zip(quote.breakdown)
            .enumerate()
            .map(|(position, (plan, price))| {
                // Distinct timestamps keep submission in request order
                let created_at = now + Duration::microseconds(position as i64);
                SubTask {
                    id: Uuid::new_v4(),
                    task_id: task.id,
                    model_code: plan.model_code,
                    provider: plan.route.provider,
                    request: SubTaskRequest {
                        provider_model: plan.route.provider_model,
                        media_kind,
                        params: plan.params,
                    },
                    status: TaskStatus::Pending,
                    credits: price.credits,
                    response: SubTaskResponse::default(),
                    created_at,
                    updated_at: created_at,
                }
            })
            .collect();

        self.store.insert_task(&task, &sub_tasks).await?;

        tracing::info!(
            task_id = %task.id,
            user_id = %task.user_id,
            task_type = %task.task_type,
            sub_tasks = sub_tasks.len(),
            credits = task.credits,
            "Created task"
        );

        if task.credits == 0 {
            return Ok((task, None));
        }

        // A failed reservation leaves the task row in place
        let reservation = self
            .ledger
            .reserve(&billing_user.account(), task.credits, Some(task.id))
            .await
            .map_err(|e| {
                tracing::warn!(
                    task_id = %task.id,
                    credits = task.credits,
                    error = %e,
                    "Credit reservation failed"
                );
                TaskError::from(e)
            })?;

        Ok((task, Some(reservation)))
    }

    /// Create a task and reserve its credits without running it
    #[tracing::instrument(skip(self, params), fields(user_id = %params.user_id, task_type = %params.task_type))]
    pub async fn create(&self, params: CreateTaskParams) -> TaskResult<Task> {
        let (task, _) = self.create_reserved(params).await?;
        Ok(task)
    }

    /// Create a task and start running it in the background
    #[tracing::instrument(skip(self, params), fields(user_id = %params.user_id, task_type = %params.task_type))]
    pub async fn create_and_run(&self, params: CreateTaskParams) -> TaskResult<TaskLaunch> {
        let (task, reservation) = self.create_reserved(params).await?;

        let this = self.clone();
        let launched = task.clone();
        let settlement = tokio::spawn(async move { this.settle(launched, reservation).await });

        Ok(TaskLaunch { task, settlement })
    }

    async fn settle(&self, task: Task, reservation: Option<CreditTransaction>) -> TaskResult<Settlement> {
        let outcome = self.run(&task).await;

        match (outcome, reservation) {
            (Ok(()), Some(reservation)) => {
                self.settle_with_retry(reservation.id, true).await?;
                tracing::info!(
                    task_id = %task.id,
                    transaction_id = %reservation.id,
                    "Confirmed task credits"
                );
                // Results that arrived before confirmation could not be refunded yet
                self.aggregator.reconcile_refund(task.id).await?;
                Ok(Settlement::Confirmed {
                    transaction_id: reservation.id,
                })
            }
            (Ok(()), None) => Ok(Settlement::NotCharged),
            (Err(run_error), reservation) => {
                tracing::warn!(task_id = %task.id, error = %run_error, "Task run stopped early");

                let settlement = match reservation {
                    Some(reservation) => {
                        self.settle_with_retry(reservation.id, false).await?;
                        self.store.set_actual_credits(task.id, 0).await?;
                        tracing::info!(
                            task_id = %task.id,
                            transaction_id = %reservation.id,
                            "Released task credits"
                        );
                        Settlement::Cancelled {
                            transaction_id: reservation.id,
                            reason: run_error.to_string(),
                        }
                    }
                    None => Settlement::NotCharged,
                };

                self.abort_unattempted(task.id).await?;
                Ok(settlement)
            }
        }
    }

    async fn settle_with_retry(&self, transaction_id: Uuid, confirm: bool) -> TaskResult<()> {
        let ledger = self.ledger.clone();
        RetryIf::spawn(
            settlement_backoff(),
            || {
                let ledger = ledger.clone();
                async move {
                    if confirm {
                        ledger.confirm(transaction_id).await
                    } else {
                        ledger.cancel(transaction_id).await
                    }
                }
            },
            |e: &BillingError| {
                tracing::warn!(transaction_id = %transaction_id, error = %e, "Ledger settlement failed");
                e.is_transient()
            },
        )
        .await
        .map_err(|e| {
            tracing::error!(
                transaction_id = %transaction_id,
                confirm = confirm,
                error = %e,
                "Giving up on ledger settlement"
            );
            TaskError::from(e)
        })
    }

    /// Mark subtasks that were never submitted as ABORTED
    async fn abort_unattempted(&self, task_id: Uuid) -> TaskResult<()> {
        let now = OffsetDateTime::now_utc();
        for mut sub_task in self.store.list_sub_tasks(task_id).await? {
            if sub_task.status != TaskStatus::Pending {
                continue;
            }
            sub_task.status = TaskStatus::Aborted;
            sub_task.response.completed_at = Some(now);
            sub_task.updated_at = now;
            self.store.save_sub_task(&sub_task).await?;
            tracing::info!(task_id = %task_id, sub_task_id = %sub_task.id, "Aborted unsubmitted subtask");
        }
        self.aggregator.aggregate(task_id).await?;
        Ok(())
    }

    /// Submit every pending subtask, in order, stopping at the first failure
    #[tracing::instrument(skip(self, task), fields(task_id = %task.id))]
    pub async fn run(&self, task: &Task) -> TaskResult<()> {
        let mut response = task.response.clone();
        response.started_at = Some(OffsetDateTime::now_utc());
        if !self
            .store
            .transition_task(task.id, TaskStatus::Pending, TaskStatus::Processing, &response)
            .await?
        {
            let current = self.get_task(task.id).await?;
            return Err(TaskError::NotRunnable {
                task_id: task.id,
                status: current.status,
            });
        }

        for mut sub_task in self.store.list_sub_tasks(task.id).await? {
            if sub_task.status == TaskStatus::Pending {
                self.submit_sub_task(&mut sub_task).await?;
            }
        }
        Ok(())
    }

    async fn submit_sub_task(&self, sub_task: &mut SubTask) -> TaskResult<()> {
        let adapter = match self.providers.get(sub_task.provider) {
            Ok(adapter) => adapter,
            Err(e) => return self.fail_submission(sub_task, e).await,
        };

        let now = OffsetDateTime::now_utc();
        sub_task.status = TaskStatus::Processing;
        sub_task.response.submitted_at = Some(now);
        sub_task.updated_at = now;
        self.store.save_sub_task(sub_task).await?;

        let ctx = SubmitContext {
            sub_task_id: sub_task.id,
            request: sub_task.request.clone(),
            webhook_url: adapter
                .webhook_path()
                .map(|path| self.signer.callback_url(path, sub_task.id)),
        };

        let outcome = match adapter.submit(&ctx).await {
            Ok(outcome) => outcome,
            Err(e) => return self.fail_submission(sub_task, e).await,
        };

        tracing::info!(
            task_id = %sub_task.task_id,
            sub_task_id = %sub_task.id,
            provider = %sub_task.provider,
            tracking_id = %outcome.tracking_id,
            "Submitted subtask"
        );

        // A fast webhook may already have settled the subtask; keep its status
        self.store
            .record_submission(
                sub_task.id,
                &outcome.tracking_id,
                outcome.provider_meta.as_ref(),
            )
            .await?;
        *sub_task = self
            .store
            .get_sub_task(sub_task.id)
            .await?
            .ok_or(TaskError::SubTaskNotFound(sub_task.id))?;

        if let Some(payload) = outcome.immediate {
            match self.ingest_webhook(sub_task.id, &payload, None).await {
                Ok(_) => {}
                // An unreadable inline result must not leave the subtask PROCESSING
                Err(TaskError::Provider(e)) => return self.fail_submission(sub_task, e).await,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn fail_submission(&self, sub_task: &mut SubTask, error: ProviderError) -> TaskResult<()> {
        tracing::error!(
            task_id = %sub_task.task_id,
            sub_task_id = %sub_task.id,
            provider = %sub_task.provider,
            error = %error,
            "Subtask submission failed"
        );

        let code = match &error {
            ProviderError::Api { status, .. } => Some(status.to_string()),
            _ => None,
        };
        sub_task.fail(error.to_string(), code, OffsetDateTime::now_utc());
        self.store.save_sub_task(sub_task).await?;

        if let Err(e) = self.aggregator.aggregate(sub_task.task_id).await {
            tracing::error!(task_id = %sub_task.task_id, error = %e, "Aggregation after failed submit failed");
        }
        Err(error.into())
    }

    /// Apply a provider payload to a subtask
    ///
    /// `result_kind` overrides the media kind the subtask was created with.
    #[tracing::instrument(skip(self, payload))]
    pub async fn ingest_webhook(
        &self,
        sub_task_id: Uuid,
        payload: &Value,
        result_kind: Option<MediaKind>,
    ) -> TaskResult<IngestOutcome> {
        let mut sub_task = self
            .store
            .get_sub_task(sub_task_id)
            .await?
            .ok_or(TaskError::SubTaskNotFound(sub_task_id))?;

        if sub_task.status == TaskStatus::Completed {
            tracing::debug!(sub_task_id = %sub_task_id, "Subtask already completed, ignoring payload");
            return Ok(IngestOutcome::AlreadyCompleted);
        }

        let adapter = self.providers.get(sub_task.provider)?;
        let kind = result_kind.unwrap_or(sub_task.request.media_kind);
        let normalized = adapter.normalize(payload, kind).map_err(|e| {
            tracing::warn!(sub_task_id = %sub_task_id, error = %e, "Unreadable provider payload");
            e
        })?;

        let now = OffsetDateTime::now_utc();
        match normalized {
            ProviderResult::Success {
                result,
                provider_meta,
            } => {
                sub_task.status = TaskStatus::Completed;
                sub_task.response.result = Some(result);
                sub_task.response.error = None;
                if provider_meta.is_some() {
                    sub_task.response.provider_meta = provider_meta;
                }
                sub_task.response.completed_at = Some(now);
                sub_task.updated_at = now;
            }
            ProviderResult::Failure { message, code } => {
                sub_task.fail(message, code, now);
            }
        }

        if !self.store.save_sub_task(&sub_task).await? {
            return Ok(IngestOutcome::AlreadyCompleted);
        }

        tracing::info!(
            task_id = %sub_task.task_id,
            sub_task_id = %sub_task.id,
            status = %sub_task.status,
            "Ingested provider result"
        );

        if sub_task.status == TaskStatus::Completed {
            let post_processor = self.post_processor.clone();
            let completed = sub_task.clone();
            tokio::spawn(async move {
                if let Err(e) = post_processor.post_process(&completed).await {
                    tracing::error!(sub_task_id = %completed.id, error = %e, "Media post-processing failed");
                }
            });
        }

        let task_status = self.aggregator.aggregate(sub_task.task_id).await?;
        Ok(IngestOutcome::Applied {
            sub_task_status: sub_task.status,
            task_status,
        })
    }

    /// Poll providers for a user's unfinished subtasks
    #[tracing::instrument(skip(self))]
    pub async fn recall(&self, task_id: Uuid, user_id: Uuid) -> TaskResult<TaskRecallResult> {
        let task = self.get_task(task_id).await?;
        if task.user_id != user_id {
            return Err(TaskError::PermissionDenied(format!(
                "task {} belongs to another user",
                task_id
            )));
        }
        if task.status == TaskStatus::Completed {
            return Err(TaskError::RecallNotAllowed {
                task_id,
                status: task.status,
                reason: "task already completed",
            });
        }

        let open: Vec<SubTask> = self
            .store
            .list_sub_tasks(task_id)
            .await?
            .into_iter()
            .filter(|s| s.status.is_open())
            .collect();
        if open.is_empty() {
            return Err(TaskError::RecallNotAllowed {
                task_id,
                status: task.status,
                reason: "no pending or processing subtasks",
            });
        }

        let mut sub_tasks = Vec::with_capacity(open.len());
        for sub_task in &open {
            sub_tasks.push(self.recall_sub_task(sub_task).await);
        }

        let task = self.get_task(task_id).await?;
        Ok(TaskRecallResult {
            task_id,
            status: task.status,
            sub_tasks,
        })
    }

    /// Recall subtasks left PROCESSING for longer than `older_than`
    #[tracing::instrument(skip(self))]
    pub async fn recall_stalled(&self, older_than: Duration) -> TaskResult<Vec<SubTaskRecall>> {
        let before = OffsetDateTime::now_utc() - older_than;
        let stalled = self.store.list_stalled_sub_tasks(before).await?;

        let mut recalled = Vec::with_capacity(stalled.len());
        for sub_task in &stalled {
            recalled.push(self.recall_sub_task(sub_task).await);
        }

        if !recalled.is_empty() {
            let finished = recalled
                .iter()
                .filter(|r| matches!(r.state, RecallState::Completed | RecallState::Failed))
                .count();
            tracing::info!(stalled = recalled.len(), finished = finished, "Recalled stalled subtasks");
        }
        Ok(recalled)
    }

    async fn recall_sub_task(&self, sub_task: &SubTask) -> SubTaskRecall {
        let report = |state: RecallState, message: Option<String>| SubTaskRecall {
            sub_task_id: sub_task.id,
            state,
            message,
        };

        let Some(tracking_id) = sub_task.response.tracking_id.clone() else {
            return report(RecallState::RecallFailed, Some("subtask was never submitted".into()));
        };
        let adapter = match self.providers.get(sub_task.provider) {
            Ok(adapter) => adapter,
            Err(e) => return report(RecallState::RecallFailed, Some(e.to_string())),
        };

        let ctx = RecallContext {
            sub_task_id: sub_task.id,
            tracking_id,
            request: sub_task.request.clone(),
        };
        match adapter.recall(&ctx).await {
            RecallOutcome::Pending => report(RecallState::StillRunning, None),
            RecallOutcome::Failed(message) => {
                tracing::warn!(sub_task_id = %sub_task.id, error = %message, "Recall poll failed");
                report(RecallState::RecallFailed, Some(message))
            }
            RecallOutcome::Ready(payload) => match self.ingest_webhook(sub_task.id, &payload, None).await {
                Ok(IngestOutcome::AlreadyCompleted)
                | Ok(IngestOutcome::Applied {
                    sub_task_status: TaskStatus::Completed,
                    ..
                }) => report(RecallState::Completed, None),
                Ok(IngestOutcome::Applied { .. }) => {
                    let message = self
                        .store
                        .get_sub_task(sub_task.id)
                        .await
                        .ok()
                        .flatten()
                        .and_then(|s| s.response.error)
                        .map(|e| e.message);
                    report(RecallState::Failed, message)
                }
                Err(e) => {
                    tracing::warn!(sub_task_id = %sub_task.id, error = %e, "Recalled result could not be applied");
                    report(RecallState::RecallFailed, Some(e.to_string()))
                }
            },
        }
    }
}
