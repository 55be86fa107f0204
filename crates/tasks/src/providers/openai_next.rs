//! OpenAI-compatible image generation gateway
//!
//! Generation is synchronous: the submit response already holds the images,
//! so there is no callback and nothing to poll.

use aigc_shared::{MediaKind, ProviderId};
use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::{
    error_body, parse_asset, ProviderAdapter, ProviderResult, RecallContext, RecallOutcome,
    SubmitContext, SubmitOutcome,
};
use crate::error::ProviderError;
use crate::model::{MediaAsset, MediaResult};

pub const DEFAULT_BASE_URL: &str = "https://api.openai-next.com";

/// Generation is synchronous, so this is longer than the queue submit timeout
const GENERATION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(180);

#[derive(Debug, Clone)]
pub struct OpenAiNextConfig {
    pub api_key: String,
    pub base_url: String,
}

impl OpenAiNextConfig {
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

pub struct OpenAiNextAdapter {
    config: OpenAiNextConfig,
    client: reqwest::Client,
}

impl OpenAiNextAdapter {
    pub fn new(config: OpenAiNextConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

fn image_asset(item: &Value) -> Option<MediaAsset> {
    if let Some(asset) = parse_asset(item) {
        return Some(asset);
    }
    let b64 = item.get("b64_json").and_then(Value::as_str)?;
    let mut asset = MediaAsset::from_url(format!("data:image/png;base64,{}", b64));
    asset.content_type = Some("image/png".into());
    Some(asset)
}

#[async_trait]
impl ProviderAdapter for OpenAiNextAdapter {
    fn id(&self) -> ProviderId {
        ProviderId::OpenAiNext
    }

    fn webhook_path(&self) -> Option<&'static str> {
        None
    }

    async fn submit(&self, ctx: &SubmitContext) -> Result<SubmitOutcome, ProviderError> {
        if self.config.api_key.is_empty() {
            return Err(ProviderError::NotConfigured("openai-next API key not configured".into()));
        }
        if ctx.request.media_kind != MediaKind::Image {
            return Err(ProviderError::NotConfigured(format!(
                "openai-next cannot generate {}",
                ctx.request.media_kind
            )));
        }

        let mut body = Map::new();
        body.insert("model".into(), Value::String(ctx.request.provider_model.clone()));
        for (key, value) in &ctx.request.params {
            body.insert(key.clone(), value.clone());
        }

        let response = self
            .client
            .post(format!(
                "{}/v1/images/generations",
                self.config.base_url.trim_end_matches('/')
            ))
            .bearer_auth(&self.config.api_key)
            .timeout(GENERATION_TIMEOUT)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() {
            let body = error_body(response).await;
            tracing::error!(
                sub_task_id = %ctx.sub_task_id,
                status = %status,
                error_body = %body,
                "openai-next generation failed"
            );
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        // 4xx bodies carry an `error` object that `normalize` turns into a failure
        let payload: Value = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidPayload(format!("openai-next response: {}", e)))?;

        tracing::info!(
            sub_task_id = %ctx.sub_task_id,
            status = %status,
            "openai-next generation returned"
        );

        Ok(SubmitOutcome {
            tracking_id: format!("openai-next-{}", ctx.sub_task_id),
            immediate: Some(payload),
            provider_meta: None,
        })
    }

    async fn recall(&self, _ctx: &RecallContext) -> RecallOutcome {
        RecallOutcome::Failed("openai-next results are synchronous; nothing to poll".into())
    }

    fn normalize(&self, payload: &Value, kind: MediaKind) -> Result<ProviderResult, ProviderError> {
        if let Some(error) = payload.get("error") {
            return Ok(ProviderResult::Failure {
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("openai-next generation failed")
                    .to_string(),
                code: error.get("code").and_then(Value::as_str).map(str::to_string),
            });
        }

        let assets: Vec<MediaAsset> = payload
            .get("data")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(image_asset).collect())
            .unwrap_or_default();
        if assets.is_empty() {
            return Err(ProviderError::InvalidPayload("openai-next response has no images".into()));
        }

        Ok(ProviderResult::Success {
            result: MediaResult::new(kind, assets),
            provider_meta: payload.get("created").map(|c| json!({ "created": c })),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SubTaskRequest;
    use mockito::Matcher;
    use uuid::Uuid;

    fn context(kind: MediaKind) -> SubmitContext {
        SubmitContext {
            sub_task_id: Uuid::new_v4(),
            request: SubTaskRequest {
                provider_model: "gpt-image-1".into(),
                media_kind: kind,
                params: json!({ "prompt": "a red bicycle", "size": "1024x1024" })
                    .as_object()
                    .cloned()
                    .unwrap(),
            },
            webhook_url: None,
        }
    }

    #[tokio::test]
    async fn test_submit_returns_immediate_result() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/images/generations")
            .match_header("authorization", "Bearer next-key")
            .match_body(Matcher::PartialJson(json!({
                "model": "gpt-image-1",
                "prompt": "a red bicycle"
            })))
            .with_status(200)
            .with_body(r#"{"created":1700000000,"data":[{"url":"https://img.example/1.png"}]}"#)
            .create_async()
            .await;

        let adapter =
            OpenAiNextAdapter::new(OpenAiNextConfig::new("next-key").with_base_url(server.url()));
        let outcome = adapter.submit(&context(MediaKind::Image)).await.unwrap();
        mock.assert_async().await;

        let payload = outcome.immediate.expect("synchronous result");
        let ProviderResult::Success { result, .. } =
            adapter.normalize(&payload, MediaKind::Image).unwrap()
        else {
            panic!("expected success");
        };
        assert_eq!(result.assets()[0].url, "https://img.example/1.png");
    }

    #[tokio::test]
    async fn test_client_error_becomes_failure_payload() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/images/generations")
            .with_status(400)
            .with_body(r#"{"error":{"message":"prompt rejected by safety system","code":"content_policy_violation"}}"#)
            .create_async()
            .await;

        let adapter =
            OpenAiNextAdapter::new(OpenAiNextConfig::new("next-key").with_base_url(server.url()));
        let outcome = adapter.submit(&context(MediaKind::Image)).await.unwrap();
        let payload = outcome.immediate.unwrap();

        assert_eq!(
            adapter.normalize(&payload, MediaKind::Image).unwrap(),
            ProviderResult::Failure {
                message: "prompt rejected by safety system".into(),
                code: Some("content_policy_violation".into()),
            }
        );
    }

    #[tokio::test]
    async fn test_rejects_non_image_work() {
        let adapter = OpenAiNextAdapter::new(OpenAiNextConfig::new("next-key"));
        assert!(matches!(
            adapter.submit(&context(MediaKind::Video)).await,
            Err(ProviderError::NotConfigured(_))
        ));
    }

    #[test]
    fn test_b64_images_become_data_urls() {
        let adapter = OpenAiNextAdapter::new(OpenAiNextConfig::new("k"));
        let payload = json!({ "data": [{ "b64_json": "aGVsbG8=" }] });
        let ProviderResult::Success { result, .. } =
            adapter.normalize(&payload, MediaKind::Image).unwrap()
        else {
            panic!("expected success");
        };
        assert_eq!(result.assets()[0].url, "data:image/png;base64,aGVsbG8=");
    }
}
