//! HTTP error mapping

use aigc_billing::BillingError;
use aigc_tasks::{ProviderError, TaskError};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Invalid webhook token")]
    InvalidWebhookToken,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Insufficient credits: requested {requested}, available {available}")]
    InsufficientCredits { requested: i64, available: i64 },

    #[error("Internal server error")]
    Internal,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized | ApiError::InvalidWebhookToken => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "UNAUTHORIZED",
            ApiError::InvalidWebhookToken => "INVALID_WEBHOOK_TOKEN",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::Conflict(_) => "CONFLICT",
            ApiError::InsufficientCredits { .. } => "INSUFFICIENT_CREDITS",
            ApiError::Internal => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.to_string(),
            code: self.code(),
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<TaskError> for ApiError {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::Validation(msg) => ApiError::Validation(msg),
            TaskError::Provider(
                e @ (ProviderError::UnknownModel(_)
                | ProviderError::InvalidParameter { .. }
                | ProviderError::InvalidPayload(_)),
            ) => ApiError::Validation(e.to_string()),
            TaskError::PermissionDenied(msg) => ApiError::Forbidden(msg),
            TaskError::TaskNotFound(id) => ApiError::NotFound(format!("task {}", id)),
            TaskError::SubTaskNotFound(id) => ApiError::NotFound(format!("subtask {}", id)),
            e @ (TaskError::RecallNotAllowed { .. } | TaskError::NotRunnable { .. }) => {
                ApiError::Conflict(e.to_string())
            }
            TaskError::Billing(BillingError::InsufficientCredits {
                requested,
                available,
            }) => ApiError::InsufficientCredits {
                requested,
                available,
            },
            other => {
                tracing::error!(error = %other, "Request failed");
                ApiError::Internal
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aigc_shared::TaskStatus;
    use uuid::Uuid;

    #[test]
    fn test_task_errors_map_to_statuses() {
        let cases = [
            (TaskError::Validation("bad".into()), StatusCode::BAD_REQUEST),
            (
                TaskError::Provider(ProviderError::UnknownModel("x".into())),
                StatusCode::BAD_REQUEST,
            ),
            (TaskError::PermissionDenied("no".into()), StatusCode::FORBIDDEN),
            (TaskError::TaskNotFound(Uuid::nil()), StatusCode::NOT_FOUND),
            (
                TaskError::RecallNotAllowed {
                    task_id: Uuid::nil(),
                    status: TaskStatus::Completed,
                    reason: "task already completed",
                },
                StatusCode::CONFLICT,
            ),
            (
                TaskError::Billing(BillingError::InsufficientCredits {
                    requested: 5,
                    available: 1,
                }),
                StatusCode::PAYMENT_REQUIRED,
            ),
            (
                TaskError::Provider(ProviderError::Network("reset".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (TaskError::Database("down".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, expected) in cases {
            let label = err.to_string();
            assert_eq!(ApiError::from(err).status(), expected, "{}", label);
        }
    }

    #[test]
    fn test_internal_error_hides_detail() {
        let err = ApiError::from(TaskError::Database("password=hunter2".into()));
        assert_eq!(err.to_string(), "Internal server error");
    }
}
