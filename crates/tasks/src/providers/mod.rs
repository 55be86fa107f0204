//! Generation provider adapters
//!
//! Every provider is reached through [`ProviderAdapter`]: submit a subtask,
//! poll it by tracking id, and turn the provider's payload (webhook body,
//! poll result or synchronous response) into a [`ProviderResult`]. Adapters
//! are looked up by [`ProviderId`] in a [`ProviderRegistry`], so adding a
//! provider never touches the orchestrator.

pub mod fal;
pub mod kie;
pub mod openai_next;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use aigc_shared::{MediaKind, ProviderId};
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::error::ProviderError;
use crate::model::{MediaAsset, MediaResult, SubTaskRequest};

pub use fal::{FalAdapter, FalConfig};
pub use kie::{KieAiAdapter, KieAiConfig};
pub use openai_next::{OpenAiNextAdapter, OpenAiNextConfig};

/// Per-request timeout for provider HTTP calls
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct SubmitContext {
    pub sub_task_id: Uuid,
    pub request: SubTaskRequest,
    /// Signed callback URL, for providers that deliver results by webhook
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubmitOutcome {
    pub tracking_id: String,
    /// Result payload for providers that answer synchronously
    pub immediate: Option<Value>,
    pub provider_meta: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct RecallContext {
    pub sub_task_id: Uuid,
    pub tracking_id: String,
    pub request: SubTaskRequest,
}

/// Result of polling a provider
#[derive(Debug, Clone, PartialEq)]
pub enum RecallOutcome {
    /// Finished; the payload goes through `normalize`
    Ready(Value),
    /// Still queued or generating
    Pending,
    /// The poll itself failed; subtask state is left alone
    Failed(String),
}

/// A provider payload in platform terms
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderResult {
    Success {
        result: MediaResult,
        provider_meta: Option<Value>,
    },
    Failure {
        message: String,
        code: Option<String>,
    },
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn id(&self) -> ProviderId;

    /// Path segment of this provider's webhook route, if it calls back
    fn webhook_path(&self) -> Option<&'static str>;

    async fn submit(&self, ctx: &SubmitContext) -> Result<SubmitOutcome, ProviderError>;

    /// Never errors; problems are reported as [`RecallOutcome::Failed`]
    async fn recall(&self, ctx: &RecallContext) -> RecallOutcome;

    fn normalize(&self, payload: &Value, kind: MediaKind) -> Result<ProviderResult, ProviderError>;
}

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    adapters: HashMap<ProviderId, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        tracing::info!(provider = %adapter.id(), "Registered provider adapter");
        self.adapters.insert(adapter.id(), adapter);
    }

    pub fn with(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn get(&self, id: ProviderId) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
        self.adapters
            .get(&id)
            .cloned()
            .ok_or_else(|| ProviderError::NotConfigured(format!("no adapter for {}", id)))
    }

    /// Adapter serving a webhook path segment
    pub fn by_webhook_path(&self, path: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters
            .values()
            .find(|a| a.webhook_path() == Some(path))
            .cloned()
    }

    pub fn providers(&self) -> Vec<ProviderId> {
        self.adapters.keys().copied().collect()
    }
}

/// Read an error body for logging without failing on it
pub(crate) async fn error_body(response: reqwest::Response) -> String {
    response
        .text()
        .await
        .unwrap_or_else(|e| format!("<unreadable body: {}>", e))
}

/// Parse `{url, content_type, width, height, ...}` objects or bare URL strings
pub(crate) fn parse_asset(value: &Value) -> Option<MediaAsset> {
    match value {
        Value::String(url) => Some(MediaAsset::from_url(url.clone())),
        Value::Object(obj) => {
            let url = obj.get("url").and_then(Value::as_str)?;
            Some(MediaAsset {
                url: url.to_string(),
                content_type: obj
                    .get("content_type")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                width: obj.get("width").and_then(Value::as_u64).map(|w| w as u32),
                height: obj.get("height").and_then(Value::as_u64).map(|h| h as u32),
                duration_secs: obj.get("duration").and_then(Value::as_f64),
                file_size: obj.get("file_size").and_then(Value::as_u64),
            })
        }
        _ => None,
    }
}

/// Collect assets from an array, a single object, or nothing
pub(crate) fn collect_assets(value: Option<&Value>) -> Vec<MediaAsset> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(parse_asset).collect(),
        Some(single) => parse_asset(single).into_iter().collect(),
        None => Vec::new(),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable adapter for orchestrator tests

    use super::*;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    #[derive(Debug, Clone)]
    pub enum ScriptedSubmit {
        Accept,
        AcceptImmediately(Value),
        Reject(String),
    }

    pub struct ScriptedAdapter {
        pub id: ProviderId,
        pub submits: Mutex<VecDeque<ScriptedSubmit>>,
        pub recalls: Mutex<VecDeque<RecallOutcome>>,
        pub submitted: Mutex<Vec<SubmitContext>>,
    }

    impl ScriptedAdapter {
        pub fn new(id: ProviderId) -> Self {
            Self {
                id,
                submits: Mutex::new(VecDeque::new()),
                recalls: Mutex::new(VecDeque::new()),
                submitted: Mutex::new(Vec::new()),
            }
        }

        pub async fn on_submit(&self, step: ScriptedSubmit) {
            self.submits.lock().await.push_back(step);
        }

        pub async fn on_recall(&self, outcome: RecallOutcome) {
            self.recalls.lock().await.push_back(outcome);
        }

        pub async fn submitted_count(&self) -> usize {
            self.submitted.lock().await.len()
        }

        /// Webhook body in this adapter's own format
        pub fn success_payload(url: &str) -> Value {
            serde_json::json!({ "ok": true, "urls": [url] })
        }

        pub fn failure_payload(message: &str) -> Value {
            serde_json::json!({ "ok": false, "error": message })
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        fn id(&self) -> ProviderId {
            self.id
        }

        fn webhook_path(&self) -> Option<&'static str> {
            Some("scripted")
        }

        async fn submit(&self, ctx: &SubmitContext) -> Result<SubmitOutcome, ProviderError> {
            self.submitted.lock().await.push(ctx.clone());
            let step = self
                .submits
                .lock()
                .await
                .pop_front()
                .unwrap_or(ScriptedSubmit::Accept);
            match step {
                ScriptedSubmit::Accept => Ok(SubmitOutcome {
                    tracking_id: format!("req-{}", ctx.sub_task_id),
                    immediate: None,
                    provider_meta: None,
                }),
                ScriptedSubmit::AcceptImmediately(payload) => Ok(SubmitOutcome {
                    tracking_id: format!("req-{}", ctx.sub_task_id),
                    immediate: Some(payload),
                    provider_meta: None,
                }),
                ScriptedSubmit::Reject(message) => Err(ProviderError::Api {
                    status: 422,
                    message,
                }),
            }
        }

        async fn recall(&self, _ctx: &RecallContext) -> RecallOutcome {
            self.recalls
                .lock()
                .await
                .pop_front()
                .unwrap_or(RecallOutcome::Pending)
        }

        fn normalize(&self, payload: &Value, kind: MediaKind) -> Result<ProviderResult, ProviderError> {
            match payload.get("ok").and_then(Value::as_bool) {
                Some(true) => Ok(ProviderResult::Success {
                    result: MediaResult::new(kind, collect_assets(payload.get("urls"))),
                    provider_meta: None,
                }),
                Some(false) => Ok(ProviderResult::Failure {
                    message: payload
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("failed")
                        .to_string(),
                    code: None,
                }),
                None => Err(ProviderError::InvalidPayload("missing ok flag".into())),
            }
        }
    }
}
