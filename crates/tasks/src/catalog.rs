//! JSON model catalog
//!
//! Declares every model the platform can run: its provider, the provider's
//! model path, the task types it serves, its pricing rule and its parameter
//! schema. Prompt templates live alongside and supply the system request.

use std::collections::HashMap;
use std::path::Path;

use aigc_shared::{ProviderId, TaskType};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::collaborators::{
    CreditBreakdown, CreditCalculator, CreditQuote, ModelRoute, ProviderRouter, SubTaskPlan,
    SystemRequestResolver,
};
use crate::error::{ProviderError, TaskError, TaskResult};
use crate::model::{TaskMetadata, TaskRequest};
use crate::params::ParameterSpec;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PricingRule {
    /// Fixed price per subtask
    Flat { credits: i64 },
    /// Price times a count parameter, e.g. `num_images`
    PerUnit { credits: i64, param: String },
    /// Price per started second of a duration parameter
    PerSecond { credits_per_second: i64, param: String },
}

impl PricingRule {
    pub fn price(&self, params: &Map<String, Value>) -> i64 {
        match self {
            PricingRule::Flat { credits } => *credits,
            PricingRule::PerUnit { credits, param } => {
                let units = params.get(param).and_then(Value::as_i64).unwrap_or(1).max(1);
                credits * units
            }
            PricingRule::PerSecond {
                credits_per_second,
                param,
            } => {
                let seconds = params
                    .get(param)
                    .and_then(Value::as_f64)
                    .unwrap_or(1.0)
                    .max(0.0)
                    .ceil() as i64;
                credits_per_second * seconds.max(1)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    pub code: String,
    pub provider: ProviderId,
    pub provider_model: String,
    pub task_types: Vec<TaskType>,
    pub pricing: PricingRule,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateEntry {
    pub id: String,
    pub system_request: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    models: Vec<ModelEntry>,
    #[serde(default)]
    templates: Vec<TemplateEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct ModelCatalog {
    models: HashMap<String, ModelEntry>,
    templates: HashMap<String, Value>,
}

impl ModelCatalog {
    pub fn from_json(json: &str) -> TaskResult<Self> {
        let file: CatalogFile = serde_json::from_str(json)
            .map_err(|e| TaskError::Validation(format!("invalid model catalog: {}", e)))?;

        let mut catalog = Self::default();
        for model in file.models {
            if catalog.models.contains_key(&model.code) {
                return Err(TaskError::Validation(format!(
                    "duplicate model code in catalog: {}",
                    model.code
                )));
            }
            catalog.models.insert(model.code.clone(), model);
        }
        for template in file.templates {
            catalog.templates.insert(template.id, template.system_request);
        }

        tracing::info!(
            models = catalog.models.len(),
            templates = catalog.templates.len(),
            "Loaded model catalog"
        );
        Ok(catalog)
    }

    pub fn load(path: impl AsRef<Path>) -> TaskResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            TaskError::Validation(format!("cannot read catalog {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    pub fn model(&self, code: &str) -> Option<&ModelEntry> {
        self.models.get(code)
    }
}

impl SystemRequestResolver for ModelCatalog {
    fn resolve_system_request(
        &self,
        _task_type: TaskType,
        _request: &TaskRequest,
        metadata: &TaskMetadata,
    ) -> TaskResult<Value> {
        match &metadata.template_id {
            None => Ok(Value::Object(Map::new())),
            Some(id) => self
                .templates
                .get(id)
                .cloned()
                .ok_or_else(|| TaskError::Validation(format!("unknown template: {}", id))),
        }
    }
}

impl ProviderRouter for ModelCatalog {
    fn route(
        &self,
        model_code: &str,
        task_type: TaskType,
        _request: &TaskRequest,
        _system_request: &Value,
    ) -> TaskResult<ModelRoute> {
        let model = self
            .models
            .get(model_code)
            .ok_or_else(|| ProviderError::UnknownModel(model_code.to_string()))?;

        if !model.task_types.contains(&task_type) {
            return Err(TaskError::Validation(format!(
                "model {} does not support {}",
                model_code, task_type
            )));
        }

        Ok(ModelRoute {
            provider: model.provider,
            provider_model: model.provider_model.clone(),
            parameters: model.parameters.clone(),
        })
    }
}

impl CreditCalculator for ModelCatalog {
    fn calculate_task_credits(
        &self,
        _task_type: TaskType,
        plans: &[SubTaskPlan],
        _metadata: &TaskMetadata,
        _system_request: &Value,
    ) -> TaskResult<CreditQuote> {
        let mut breakdown = Vec::with_capacity(plans.len());
        for plan in plans {
            let model = self
                .models
                .get(&plan.model_code)
                .ok_or_else(|| ProviderError::UnknownModel(plan.model_code.clone()))?;
            breakdown.push(CreditBreakdown {
                model_code: plan.model_code.clone(),
                credits: model.pricing.price(&plan.params),
            });
        }

        Ok(CreditQuote {
            total_credits: breakdown.iter().map(|b| b.credits).sum(),
            breakdown,
        })
    }
}
