//! Services the orchestrator depends on but does not own
//!
//! Pricing, routing and template resolution are pure lookups (implemented by
//! [`crate::catalog::ModelCatalog`]). Account resolution and media
//! post-processing do I/O.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use aigc_billing::{BillingUser, BillingUserDirectory};
use aigc_shared::{ProviderId, TaskType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::TaskResult;
use crate::model::{SubTask, TaskMetadata, TaskRequest};
use crate::params::ParameterSpec;

/// Where one model code runs
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRoute {
    pub provider: ProviderId,
    pub provider_model: String,
    pub parameters: Vec<ParameterSpec>,
}

/// One model's validated share of a task, before credits are known
#[derive(Debug, Clone, PartialEq)]
pub struct SubTaskPlan {
    pub model_code: String,
    pub route: ModelRoute,
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditBreakdown {
    pub model_code: String,
    pub credits: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditQuote {
    pub total_credits: i64,
    pub breakdown: Vec<CreditBreakdown>,
}

pub trait SystemRequestResolver: Send + Sync {
    fn resolve_system_request(
        &self,
        task_type: TaskType,
        request: &TaskRequest,
        metadata: &TaskMetadata,
    ) -> TaskResult<Value>;
}

pub trait ProviderRouter: Send + Sync {
    fn route(
        &self,
        model_code: &str,
        task_type: TaskType,
        request: &TaskRequest,
        system_request: &Value,
    ) -> TaskResult<ModelRoute>;
}

pub trait CreditCalculator: Send + Sync {
    /// Price every planned subtask; the breakdown follows `plans` order
    fn calculate_task_credits(
        &self,
        task_type: TaskType,
        plans: &[SubTaskPlan],
        metadata: &TaskMetadata,
        system_request: &Value,
    ) -> TaskResult<CreditQuote>;
}

#[async_trait]
pub trait AccountResolver: Send + Sync {
    async fn get_or_create_billing_user(&self, user_id: Uuid) -> TaskResult<BillingUser>;

    async fn has_valid_private_task_permission(&self, user_id: Uuid) -> TaskResult<bool>;
}

#[async_trait]
impl AccountResolver for BillingUserDirectory {
    async fn get_or_create_billing_user(&self, user_id: Uuid) -> TaskResult<BillingUser> {
        Ok(self.get_or_create_by_user_id(user_id).await?)
    }

    async fn has_valid_private_task_permission(&self, user_id: Uuid) -> TaskResult<bool> {
        Ok(BillingUserDirectory::has_valid_private_task_permission(self, user_id).await?)
    }
}

/// Billing users kept in memory
#[derive(Debug, Default)]
pub struct MemoryAccountResolver {
    users: Mutex<HashMap<Uuid, BillingUser>>,
    private_allowed: Mutex<HashSet<Uuid>>,
}

impl MemoryAccountResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user ahead of time, e.g. to attach a team or fund grants
    pub async fn insert(&self, user: BillingUser) {
        self.users.lock().await.insert(user.user_id, user);
    }

    pub async fn allow_private_tasks(&self, user_id: Uuid) {
        self.private_allowed.lock().await.insert(user_id);
    }
}

#[async_trait]
impl AccountResolver for MemoryAccountResolver {
    async fn get_or_create_billing_user(&self, user_id: Uuid) -> TaskResult<BillingUser> {
        let mut users = self.users.lock().await;
        let user = users.entry(user_id).or_insert_with(|| BillingUser {
            id: Uuid::new_v4(),
            user_id,
            team_id: None,
            created_at: OffsetDateTime::now_utc(),
        });
        Ok(user.clone())
    }

    async fn has_valid_private_task_permission(&self, user_id: Uuid) -> TaskResult<bool> {
        Ok(self.private_allowed.lock().await.contains(&user_id))
    }
}

/// Re-hosts generated media into durable storage once a subtask completes
#[async_trait]
pub trait MediaPostProcessor: Send + Sync {
    async fn post_process(&self, sub_task: &SubTask) -> TaskResult<()>;
}

/// Keeps provider URLs as they are
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughPostProcessor;

#[async_trait]
impl MediaPostProcessor for PassthroughPostProcessor {
    async fn post_process(&self, sub_task: &SubTask) -> TaskResult<()> {
        let assets = sub_task
            .response
            .result
            .as_ref()
            .map(|r| r.assets().len())
            .unwrap_or(0);
        tracing::debug!(
            sub_task_id = %sub_task.id,
            assets = assets,
            "Keeping provider media URLs"
        );
        Ok(())
    }
}

/// Bundle of the pure lookup collaborators
#[derive(Clone)]
pub struct Catalogs {
    pub system_requests: Arc<dyn SystemRequestResolver>,
    pub router: Arc<dyn ProviderRouter>,
    pub pricing: Arc<dyn CreditCalculator>,
}

impl Catalogs {
    /// Use one object for all three lookups
    pub fn from_single<C>(catalog: Arc<C>) -> Self
    where
        C: SystemRequestResolver + ProviderRouter + CreditCalculator + 'static,
    {
        Self {
            system_requests: catalog.clone(),
            router: catalog.clone(),
            pricing: catalog,
        }
    }
}
