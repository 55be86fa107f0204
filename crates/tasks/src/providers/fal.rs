//! fal.ai queue API
//!
//! Requests are queued with a `fal_webhook` callback. Webhook bodies look like
//! `{request_id, status: "OK" | "ERROR", payload, error}`; polling reads the
//! request status and then the stored result, and wraps it in the same
//! envelope so both paths share `normalize`.

use aigc_shared::{MediaKind, ProviderId};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    collect_assets, error_body, ProviderAdapter, ProviderResult, RecallContext, RecallOutcome,
    SubmitContext, SubmitOutcome, REQUEST_TIMEOUT,
};
use crate::error::ProviderError;
use crate::model::MediaResult;

pub const DEFAULT_BASE_URL: &str = "https://queue.fal.run";

#[derive(Debug, Clone)]
pub struct FalConfig {
    pub api_key: String,
    pub base_url: String,
}

impl FalConfig {
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
struct QueueSubmitResponse {
    request_id: String,
    #[serde(default)]
    status_url: Option<String>,
    #[serde(default)]
    response_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueueStatusResponse {
    status: String,
}

pub struct FalAdapter {
    config: FalConfig,
    client: reqwest::Client,
}

impl FalAdapter {
    pub fn new(config: FalConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn auth_header(&self) -> String {
        format!("Key {}", self.config.api_key)
    }

    /// Queue paths use the app id (`owner/app`), not the full endpoint path
    fn requests_url(&self, provider_model: &str, request_id: &str) -> String {
        let app_id: Vec<&str> = provider_model.split('/').take(2).collect();
        format!(
            "{}/{}/requests/{}",
            self.config.base_url.trim_end_matches('/'),
            app_id.join("/"),
            request_id
        )
    }

    async fn fetch_result(&self, ctx: &RecallContext) -> RecallOutcome {
        let url = self.requests_url(&ctx.request.provider_model, &ctx.tracking_id);
        let response = match self
            .client
            .get(&url)
            .header("Authorization", self.auth_header())
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return RecallOutcome::Failed(format!("fal result request failed: {}", e)),
        };

        let status = response.status();
        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNPROCESSABLE_ENTITY {
            // The request ran and failed; report it like an ERROR webhook
            let body = error_body(response).await;
            return RecallOutcome::Ready(json!({
                "request_id": ctx.tracking_id,
                "status": "ERROR",
                "error": body,
            }));
        }
        if !status.is_success() {
            // Auth, rate limit and lookup errors say nothing about the generation
            return RecallOutcome::Failed(format!("fal result endpoint returned {}", status));
        }

        match response.json::<Value>().await {
            Ok(payload) => RecallOutcome::Ready(json!({
                "request_id": ctx.tracking_id,
                "status": "OK",
                "payload": payload,
            })),
            Err(e) => RecallOutcome::Failed(format!("fal result was not JSON: {}", e)),
        }
    }
}

#[async_trait]
impl ProviderAdapter for FalAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::Fal
    }

    fn webhook_path(&self) -> Option<&'static str> {
        Some("fal")
    }

    async fn submit(&self, ctx: &SubmitContext) -> Result<SubmitOutcome, ProviderError> {
        if self.config.api_key.is_empty() {
            return Err(ProviderError::NotConfigured("fal API key not configured".into()));
        }

        let url = format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            ctx.request.provider_model
        );
        let mut request = self
            .client
            .post(&url)
            .header("Authorization", self.auth_header())
            .timeout(REQUEST_TIMEOUT)
            .json(&ctx.request.params);
        if let Some(webhook_url) = &ctx.webhook_url {
            request = request.query(&[("fal_webhook", webhook_url)]);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = error_body(response).await;
            tracing::error!(
                sub_task_id = %ctx.sub_task_id,
                status = %status,
                error_body = %body,
                "fal queue submit failed"
            );
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let queued: QueueSubmitResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidPayload(format!("fal submit response: {}", e)))?;

        tracing::info!(
            sub_task_id = %ctx.sub_task_id,
            request_id = %queued.request_id,
            "Queued fal request"
        );

        Ok(SubmitOutcome {
            tracking_id: queued.request_id,
            immediate: None,
            provider_meta: Some(json!({
                "status_url": queued.status_url,
                "response_url": queued.response_url,
            })),
        })
    }

    async fn recall(&self, ctx: &RecallContext) -> RecallOutcome {
        let url = format!(
            "{}/status",
            self.requests_url(&ctx.request.provider_model, &ctx.tracking_id)
        );
        let response = match self
            .client
            .get(&url)
            .header("Authorization", self.auth_header())
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return RecallOutcome::Failed(format!("fal status request failed: {}", e)),
        };

        if !response.status().is_success() {
            return RecallOutcome::Failed(format!(
                "fal status endpoint returned {}",
                response.status()
            ));
        }

        let status = match response.json::<QueueStatusResponse>().await {
            Ok(status) => status.status,
            Err(e) => return RecallOutcome::Failed(format!("fal status was not JSON: {}", e)),
        };

        match status.as_str() {
            "IN_QUEUE" | "IN_PROGRESS" => RecallOutcome::Pending,
            "COMPLETED" => self.fetch_result(ctx).await,
            other => RecallOutcome::Failed(format!("unexpected fal status: {}", other)),
        }
    }

    fn normalize(&self, payload: &Value, kind: MediaKind) -> Result<ProviderResult, ProviderError> {
        let status = payload
            .get("status")
            .and_then(Value::as_str)
            .ok_or_else(|| ProviderError::InvalidPayload("fal payload has no status".into()))?;

        match status {
            "OK" => {
                let body = payload.get("payload").unwrap_or(&Value::Null);
                let assets = match kind {
                    MediaKind::Image => collect_assets(body.get("images")),
                    MediaKind::Video => collect_assets(body.get("video").or_else(|| body.get("videos"))),
                    MediaKind::Audio => collect_assets(
                        body.get("audio")
                            .or_else(|| body.get("audio_file"))
                            .or_else(|| body.get("audios")),
                    ),
                };
                if assets.is_empty() {
                    return Err(ProviderError::InvalidPayload(format!(
                        "fal payload has no {} output",
                        kind
                    )));
                }
                Ok(ProviderResult::Success {
                    result: MediaResult::new(kind, assets),
                    provider_meta: Some(json!({
                        "request_id": payload.get("request_id"),
                        "seed": body.get("seed"),
                    })),
                })
            }
            "ERROR" => {
                let message = payload
                    .get("error")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or_else(|| {
                        payload
                            .pointer("/payload/detail/0/msg")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                    })
                    .unwrap_or_else(|| "fal reported an error".to_string());
                Ok(ProviderResult::Failure {
                    message,
                    code: None,
                })
            }
            other => Err(ProviderError::InvalidPayload(format!(
                "unknown fal status: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SubTaskRequest;
    use mockito::Matcher;
    use uuid::Uuid;

    fn request(model: &str) -> SubTaskRequest {
        SubTaskRequest {
            provider_model: model.to_string(),
            media_kind: MediaKind::Image,
            params: json!({ "prompt": "a fox" }).as_object().cloned().unwrap(),
        }
    }

    fn adapter(base_url: &str) -> FalAdapter {
        FalAdapter::new(FalConfig::new("fal-key").with_base_url(base_url))
    }

    #[tokio::test]
    async fn test_submit_queues_with_webhook() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/fal-ai/flux/dev")
            .match_header("authorization", "Key fal-key")
            .match_query(Matcher::UrlEncoded(
                "fal_webhook".into(),
                "https://app.example.com/webhooks/fal/1?token=t".into(),
            ))
            .match_body(Matcher::PartialJson(json!({ "prompt": "a fox" })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"request_id":"req-123","status_url":"s","response_url":"r"}"#)
            .create_async()
            .await;

        let outcome = adapter(&server.url())
            .submit(&SubmitContext {
                sub_task_id: Uuid::new_v4(),
                request: request("fal-ai/flux/dev"),
                webhook_url: Some("https://app.example.com/webhooks/fal/1?token=t".into()),
            })
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(outcome.tracking_id, "req-123");
        assert!(outcome.immediate.is_none());
    }

    #[tokio::test]
    async fn test_submit_surfaces_api_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/fal-ai/flux/dev")
            .with_status(422)
            .with_body(r#"{"detail":"bad prompt"}"#)
            .create_async()
            .await;

        let err = adapter(&server.url())
            .submit(&SubmitContext {
                sub_task_id: Uuid::new_v4(),
                request: request("fal-ai/flux/dev"),
                webhook_url: None,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ProviderError::Api { status: 422, .. }));
    }

    #[tokio::test]
    async fn test_recall_completed_fetches_result() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/fal-ai/flux/requests/req-1/status")
            .with_status(200)
            .with_body(r#"{"status":"COMPLETED"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/fal-ai/flux/requests/req-1")
            .with_status(200)
            .with_body(r#"{"images":[{"url":"https://fal.media/1.png","width":1024,"height":768}]}"#)
            .create_async()
            .await;

        let fal = adapter(&server.url());
        let outcome = fal
            .recall(&RecallContext {
                sub_task_id: Uuid::new_v4(),
                tracking_id: "req-1".into(),
                request: request("fal-ai/flux/dev"),
            })
            .await;

        let RecallOutcome::Ready(payload) = outcome else {
            panic!("expected a ready result, got {:?}", outcome);
        };
        let ProviderResult::Success { result, .. } = fal.normalize(&payload, MediaKind::Image).unwrap() else {
            panic!("expected success");
        };
        assert_eq!(result.assets()[0].width, Some(1024));
    }

    #[tokio::test]
    async fn test_recall_in_progress_is_pending() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/fal-ai/flux/requests/req-2/status")
            .with_status(200)
            .with_body(r#"{"status":"IN_PROGRESS"}"#)
            .create_async()
            .await;

        let outcome = adapter(&server.url())
            .recall(&RecallContext {
                sub_task_id: Uuid::new_v4(),
                tracking_id: "req-2".into(),
                request: request("fal-ai/flux/dev"),
            })
            .await;
        assert_eq!(outcome, RecallOutcome::Pending);
    }

    #[tokio::test]
    async fn test_recall_server_error_is_failed_not_ready() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/fal-ai/flux/requests/req-3/status")
            .with_status(503)
            .create_async()
            .await;

        let outcome = adapter(&server.url())
            .recall(&RecallContext {
                sub_task_id: Uuid::new_v4(),
                tracking_id: "req-3".into(),
                request: request("fal-ai/flux/dev"),
            })
            .await;
        assert!(matches!(outcome, RecallOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_recall_rate_limited_result_is_failed() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/fal-ai/flux/requests/req-4/status")
            .with_status(200)
            .with_body(r#"{"status":"COMPLETED"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/fal-ai/flux/requests/req-4")
            .with_status(429)
            .with_body("rate limited")
            .create_async()
            .await;

        let outcome = adapter(&server.url())
            .recall(&RecallContext {
                sub_task_id: Uuid::new_v4(),
                tracking_id: "req-4".into(),
                request: request("fal-ai/flux/dev"),
            })
            .await;
        assert!(matches!(outcome, RecallOutcome::Failed(ref msg) if msg.contains("429")));
    }

    #[tokio::test]
    async fn test_recall_rejected_result_is_error_payload() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/fal-ai/flux/requests/req-5/status")
            .with_status(200)
            .with_body(r#"{"status":"COMPLETED"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/fal-ai/flux/requests/req-5")
            .with_status(422)
            .with_body(r#"{"detail":[{"msg":"prompt flagged"}]}"#)
            .create_async()
            .await;

        let fal = adapter(&server.url());
        let outcome = fal
            .recall(&RecallContext {
                sub_task_id: Uuid::new_v4(),
                tracking_id: "req-5".into(),
                request: request("fal-ai/flux/dev"),
            })
            .await;

        let RecallOutcome::Ready(payload) = outcome else {
            panic!("expected a ready result, got {:?}", outcome);
        };
        assert!(matches!(
            fal.normalize(&payload, MediaKind::Image).unwrap(),
            ProviderResult::Failure { .. }
        ));
    }

    #[test]
    fn test_normalize_webhook_shapes() {
        let fal = FalAdapter::new(FalConfig::new("k"));

        let video = json!({
            "request_id": "r",
            "status": "OK",
            "payload": { "video": { "url": "https://fal.media/v.mp4" } }
        });
        assert!(matches!(
            fal.normalize(&video, MediaKind::Video).unwrap(),
            ProviderResult::Success { result: MediaResult::Videos(ref v), .. } if v.len() == 1
        ));

        let failed = json!({ "request_id": "r", "status": "ERROR", "error": "NSFW content detected" });
        assert_eq!(
            fal.normalize(&failed, MediaKind::Image).unwrap(),
            ProviderResult::Failure {
                message: "NSFW content detected".into(),
                code: None
            }
        );

        let empty = json!({ "request_id": "r", "status": "OK", "payload": {} });
        assert!(matches!(
            fal.normalize(&empty, MediaKind::Image),
            Err(ProviderError::InvalidPayload(_))
        ));
    }
}
