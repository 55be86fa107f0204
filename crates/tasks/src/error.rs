//! Task and provider error types

use aigc_billing::BillingError;
use aigc_shared::{ParseEnumError, TaskStatus};
use uuid::Uuid;

pub type TaskResult<T> = Result<T, TaskError>;

/// Failure talking to, or interpreting, a generation provider
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("Unknown model: {0}")]
    UnknownModel(String),

    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Provider API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid provider payload: {0}")]
    InvalidPayload(String),
}

impl ProviderError {
    pub(crate) fn invalid_parameter(name: &str, reason: impl Into<String>) -> Self {
        ProviderError::InvalidParameter {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Network(err.to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Invalid task request: {0}")]
    Validation(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("Subtask not found: {0}")]
    SubTaskNotFound(Uuid),

    #[error("Task {task_id} cannot be recalled while {status}: {reason}")]
    RecallNotAllowed {
        task_id: Uuid,
        status: TaskStatus,
        reason: &'static str,
    },

    #[error("Task {task_id} cannot run while {status}")]
    NotRunnable { task_id: Uuid, status: TaskStatus },

    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("Collaborator error: {0}")]
    Collaborator(String),

    #[error("Stored task data is malformed: {0}")]
    Corrupt(String),

    #[error("Database error: {0}")]
    Database(String),
}

impl TaskError {
    /// Rejections caused by the caller's input, never by system state
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            TaskError::Validation(_)
                | TaskError::Provider(ProviderError::UnknownModel(_))
                | TaskError::Provider(ProviderError::InvalidParameter { .. })
        )
    }
}

impl From<sqlx::Error> for TaskError {
    fn from(err: sqlx::Error) -> Self {
        TaskError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        TaskError::Corrupt(err.to_string())
    }
}

impl From<ParseEnumError> for TaskError {
    fn from(err: ParseEnumError) -> Self {
        TaskError::Corrupt(err.to_string())
    }
}
