//! kie.ai jobs API
//!
//! Every response is wrapped as `{code, msg, data}`. Job records (from the
//! callback or from `recordInfo`) carry `state` and, on success, a
//! `resultJson` string holding `resultUrls`.

use aigc_shared::{MediaKind, ProviderId};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    collect_assets, error_body, ProviderAdapter, ProviderResult, RecallContext, RecallOutcome,
    SubmitContext, SubmitOutcome, REQUEST_TIMEOUT,
};
use crate::error::ProviderError;
use crate::model::MediaResult;

pub const DEFAULT_BASE_URL: &str = "https://api.kie.ai";

#[derive(Debug, Clone)]
pub struct KieAiConfig {
    pub api_key: String,
    pub base_url: String,
}

impl KieAiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    msg: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedJob {
    task_id: String,
}

pub struct KieAiAdapter {
    config: KieAiConfig,
    client: reqwest::Client,
}

impl KieAiAdapter {
    pub fn new(config: KieAiConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

/// Job record from either a callback body or a `recordInfo` response
fn job_record(payload: &Value) -> &Value {
    payload.get("data").unwrap_or(payload)
}

#[async_trait]
impl ProviderAdapter for KieAiAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::KieAi
    }

    fn webhook_path(&self) -> Option<&'static str> {
        Some("kie")
    }

    async fn submit(&self, ctx: &SubmitContext) -> Result<SubmitOutcome, ProviderError> {
        if self.config.api_key.is_empty() {
            return Err(ProviderError::NotConfigured("kie.ai API key not configured".into()));
        }

        let mut body = json!({
            "model": ctx.request.provider_model,
            "input": ctx.request.params,
        });
        if let Some(webhook_url) = &ctx.webhook_url {
            body["callBackUrl"] = Value::String(webhook_url.clone());
        }

        let response = self
            .client
            .post(self.url("/api/v1/jobs/createTask"))
            .bearer_auth(&self.config.api_key)
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = error_body(response).await;
            tracing::error!(
                sub_task_id = %ctx.sub_task_id,
                status = %status,
                error_body = %body,
                "kie.ai createTask failed"
            );
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let envelope: Envelope<CreatedJob> = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidPayload(format!("kie.ai createTask response: {}", e)))?;

        // kie.ai reports business errors with HTTP 200 and a non-200 code
        let job = match (envelope.code, envelope.data) {
            (200, Some(job)) => job,
            (code, _) => {
                let message = envelope.msg.unwrap_or_else(|| "createTask rejected".into());
                tracing::error!(
                    sub_task_id = %ctx.sub_task_id,
                    code = code,
                    message = %message,
                    "kie.ai rejected job"
                );
                return Err(ProviderError::Api {
                    status: u16::try_from(code).unwrap_or(500),
                    message,
                });
            }
        };

        tracing::info!(
            sub_task_id = %ctx.sub_task_id,
            kie_task_id = %job.task_id,
            "Created kie.ai job"
        );

        Ok(SubmitOutcome {
            tracking_id: job.task_id,
            immediate: None,
            provider_meta: None,
        })
    }

    async fn recall(&self, ctx: &RecallContext) -> RecallOutcome {
        let response = match self
            .client
            .get(self.url("/api/v1/jobs/recordInfo"))
            .query(&[("taskId", &ctx.tracking_id)])
            .bearer_auth(&self.config.api_key)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return RecallOutcome::Failed(format!("kie.ai recordInfo failed: {}", e)),
        };

        if !response.status().is_success() {
            return RecallOutcome::Failed(format!(
                "kie.ai recordInfo returned {}",
                response.status()
            ));
        }

        let body: Value = match response.json().await {
            Ok(body) => body,
            Err(e) => return RecallOutcome::Failed(format!("kie.ai recordInfo was not JSON: {}", e)),
        };

        match job_record(&body).get("state").and_then(Value::as_str) {
            Some("success") | Some("fail") => RecallOutcome::Ready(body),
            Some(_) => RecallOutcome::Pending,
            None => RecallOutcome::Failed("kie.ai record has no state".into()),
        }
    }

    fn normalize(&self, payload: &Value, kind: MediaKind) -> Result<ProviderResult, ProviderError> {
        let record = job_record(payload);
        let state = record
            .get("state")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::InvalidPayload("kie.ai record has no state".into()))?;

        match state {
            "success" => {
                let raw = record
                    .get("resultJson")
                    .and_then(Value::as_str)
                    .ok_or_else(|| ProviderError::InvalidPayload("kie.ai record has no resultJson".into()))?;
                let parsed: Value = serde_json::from_str(raw)
                    .map_err(|e| ProviderError::InvalidPayload(format!("kie.ai resultJson: {}", e)))?;

                let assets = collect_assets(parsed.get("resultUrls"));
                if assets.is_empty() {
                    return Err(ProviderError::InvalidPayload("kie.ai result has no urls".into()));
                }
                Ok(ProviderResult::Success {
                    result: MediaResult::new(kind, assets),
                    provider_meta: Some(json!({
                        "taskId": record.get("taskId"),
                        "costTime": record.get("costTime"),
                    })),
                })
            }
            "fail" => Ok(ProviderResult::Failure {
                message: record
                    .get("failMsg")
                    .and_then(Value::as_str)
                    .filter(|m| !m.is_empty())
                    .unwrap_or("kie.ai job failed")
                    .to_string(),
                code: record.get("failCode").and_then(|c| match c {
                    Value::String(s) if !s.is_empty() => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                }),
            }),
            other => Err(ProviderError::InvalidPayload(format!(
                "kie.ai job not finished: {}",
                other
            ))),
        }
    }
}
