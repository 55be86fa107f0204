//! Task and subtask records
//!
//! Request, metadata and response payloads are typed and versioned; they are
//! stored as JSON columns but never indexed ad hoc.

use std::collections::HashMap;

use aigc_shared::{MediaKind, ProviderId, TaskStatus, TaskType};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;
use uuid::Uuid;

pub const RESPONSE_VERSION: u32 = 1;

fn response_version() -> u32 {
    RESPONSE_VERSION
}

/// What the caller asked for
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Model codes to run; one subtask each
    pub models: Vec<String>,
    /// Parameters shared by every model (prompt, image urls, ...)
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Per-model overrides, keyed by model code
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub model_params: HashMap<String, Map<String, Value>>,
}

impl TaskRequest {
    /// Shared params with the model's overrides applied on top
    pub fn params_for(&self, model_code: &str) -> Map<String, Value> {
        let mut merged = self.params.clone();
        if let Some(overrides) = self.model_params.get(model_code) {
            for (key, value) in overrides {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    /// Prompt template the request was built from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    /// Caller supplied correlation id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_reference: Option<String>,
}

/// Subtask counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub aborted: usize,
}

impl StatusCounts {
    pub fn tally<'a>(statuses: impl IntoIterator<Item = &'a TaskStatus>) -> Self {
        let mut counts = Self::default();
        for status in statuses {
            counts.total += 1;
            match status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Processing => counts.processing += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Cancelled => counts.cancelled += 1,
                TaskStatus::Aborted => counts.aborted += 1,
                // never a subtask status
                TaskStatus::PartiallyCompleted => {}
            }
        }
        counts
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTaskErrorSummary {
    pub sub_task_id: Uuid,
    pub model_code: String,
    pub message: String,
}

/// Aggregate view of a task's subtasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    #[serde(default = "response_version")]
    pub version: u32,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub counts: StatusCounts,
    /// Credits of subtasks that delivered a result
    #[serde(default)]
    pub credits_consumed: i64,
    #[serde(default)]
    pub credits_refunded: i64,
    #[serde(default)]
    pub errors: Vec<SubTaskErrorSummary>,
}

impl Default for TaskResponse {
    fn default() -> Self {
        Self {
            version: RESPONSE_VERSION,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            counts: StatusCounts::default(),
            credits_consumed: 0,
            credits_refunded: 0,
            errors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub task_type: TaskType,
    pub user_id: Uuid,
    pub billing_user_id: Option<Uuid>,
    pub is_public: bool,
    pub request: TaskRequest,
    pub system_request: Value,
    pub metadata: TaskMetadata,
    pub status: TaskStatus,
    /// Credits reserved when the task was created
    pub credits: i64,
    /// Credits finally charged after refunds or cancellation
    pub actual_credits: i64,
    pub response: TaskResponse,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// The slice of a task one provider call needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTaskRequest {
    /// Provider-side model path, e.g. `fal-ai/flux/dev`
    pub provider_model: String,
    pub media_kind: MediaKind,
    /// Parameters after schema validation
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaAsset {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
}

impl MediaAsset {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            content_type: None,
            width: None,
            height: None,
            duration_secs: None,
            file_size: None,
        }
    }
}

/// Generated media, keyed by kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaResult {
    Images(Vec<MediaAsset>),
    Videos(Vec<MediaAsset>),
    Audios(Vec<MediaAsset>),
}

impl MediaResult {
    pub fn new(kind: MediaKind, assets: Vec<MediaAsset>) -> Self {
        match kind {
            MediaKind::Image => MediaResult::Images(assets),
            MediaKind::Video => MediaResult::Videos(assets),
            MediaKind::Audio => MediaResult::Audios(assets),
        }
    }

    pub fn kind(&self) -> MediaKind {
        match self {
            MediaResult::Images(_) => MediaKind::Image,
            MediaResult::Videos(_) => MediaKind::Video,
            MediaResult::Audios(_) => MediaKind::Audio,
        }
    }

    pub fn assets(&self) -> &[MediaAsset] {
        match self {
            MediaResult::Images(a) | MediaResult::Videos(a) | MediaResult::Audios(a) => a,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTaskError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTaskResponse {
    #[serde(default = "response_version")]
    pub version: u32,
    /// Provider request id used for webhooks and recall
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<MediaResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SubTaskError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_meta: Option<Value>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub submitted_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
}

impl Default for SubTaskResponse {
    fn default() -> Self {
        Self {
            version: RESPONSE_VERSION,
            tracking_id: None,
            result: None,
            error: None,
            provider_meta: None,
            submitted_at: None,
            completed_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubTask {
    pub id: Uuid,
    pub task_id: Uuid,
    pub model_code: String,
    pub provider: ProviderId,
    pub request: SubTaskRequest,
    pub status: TaskStatus,
    pub credits: i64,
    pub response: SubTaskResponse,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl SubTask {
    pub(crate) fn fail(&mut self, message: impl Into<String>, code: Option<String>, now: OffsetDateTime) {
        self.status = TaskStatus::Failed;
        self.response.error = Some(SubTaskError {
            message: message.into(),
            code,
        });
        self.response.completed_at = Some(now);
        self.updated_at = now;
    }
}

/// Input to task creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskParams {
    pub user_id: Uuid,
    pub task_type: TaskType,
    #[serde(default = "default_public")]
    pub is_public: bool,
    pub request: TaskRequest,
    #[serde(default)]
    pub metadata: TaskMetadata,
}

fn default_public() -> bool {
    true
}

/// What happened to one subtask during a recall
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecallState {
    Completed,
    Failed,
    StillRunning,
    RecallFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTaskRecall {
    pub sub_task_id: Uuid,
    pub state: RecallState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecallResult {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub sub_tasks: Vec<SubTaskRecall>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_model_overrides_win() {
        let request: TaskRequest = serde_json::from_value(json!({
            "models": ["flux-dev", "seedream"],
            "params": { "prompt": "a fox", "num_images": 1 },
            "model_params": { "seedream": { "num_images": 2 } }
        }))
        .unwrap();

        assert_eq!(request.params_for("seedream")["num_images"], json!(2));
        assert_eq!(request.params_for("flux-dev")["num_images"], json!(1));
        assert_eq!(request.params_for("seedream")["prompt"], json!("a fox"));
    }

    #[test]
    fn test_media_result_is_keyed_by_kind() {
        let result = MediaResult::new(MediaKind::Video, vec![MediaAsset::from_url("https://v/1.mp4")]);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["videos"][0]["url"], json!("https://v/1.mp4"));
        assert_eq!(result.kind(), MediaKind::Video);
    }

    #[test]
    fn test_legacy_response_without_version_parses() {
        let response: SubTaskResponse = serde_json::from_value(json!({ "tracking_id": "req-1" })).unwrap();
        assert_eq!(response.version, RESPONSE_VERSION);
        assert_eq!(response.tracking_id.as_deref(), Some("req-1"));
    }

    #[test]
    fn test_status_counts_tally() {
        let counts = StatusCounts::tally(&[
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Pending,
            TaskStatus::Completed,
        ]);
        assert_eq!(counts.total, 4);
        assert_eq!(counts.completed, 2);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.pending, 1);
    }
}
