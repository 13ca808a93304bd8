//! Application error type mapping to HTTP status codes and envelope format.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use agentflow_core::workflow::approval::ApprovalError;
use agentflow_core::workflow::cron::CronError;
use agentflow_core::workflow::definition::DefinitionError;
use agentflow_core::workflow::executor::ExecutorError;
use agentflow_core::workflow::schedule::ScheduleError;
use agentflow_types::error::RepositoryError;

use crate::http::response::ApiResponse;

/// Application-level error that maps to HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Approval(#[from] ApprovalError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Cron(#[from] CronError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    /// Missing entity not covered by a domain error.
    #[error("{0}")]
    NotFound(String),

    /// Authentication failure.
    #[error("{0}")]
    Unauthorized(String),

    /// Validation error.
    #[error("{0}")]
    Validation(String),

    /// Generic internal error.
    #[error("{0}")]
    Internal(String),
}

impl AppError {
    /// Status code and machine-readable error code.
    fn classify(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Definition(DefinitionError::Io(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
            AppError::Definition(_) => (StatusCode::BAD_REQUEST, "INVALID_DEFINITION"),

            AppError::Executor(ExecutorError::WorkflowNotFound(_)) => {
                (StatusCode::NOT_FOUND, "WORKFLOW_NOT_FOUND")
            }
            AppError::Executor(ExecutorError::ExecutionNotFound(_)) => {
                (StatusCode::NOT_FOUND, "EXECUTION_NOT_FOUND")
            }
            AppError::Executor(ExecutorError::InvalidDefinition { .. }) => {
                (StatusCode::BAD_REQUEST, "INVALID_DEFINITION")
            }
            AppError::Executor(ExecutorError::NotWaiting(_)) => (StatusCode::CONFLICT, "NOT_WAITING"),
            AppError::Executor(_) => (StatusCode::INTERNAL_SERVER_ERROR, "EXECUTOR_ERROR"),

            AppError::Approval(ApprovalError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, "APPROVAL_NOT_FOUND")
            }
            AppError::Approval(ApprovalError::NotPending(_)) => {
                (StatusCode::CONFLICT, "APPROVAL_RESOLVED")
            }
            AppError::Approval(ApprovalError::AlreadyResponded(_)) => {
                (StatusCode::CONFLICT, "ALREADY_RESPONDED")
            }
            AppError::Approval(ApprovalError::NotApprover(_)) => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            AppError::Approval(ApprovalError::NoApprovers(_)) => {
                (StatusCode::BAD_REQUEST, "VALIDATION_ERROR")
            }
            AppError::Approval(ApprovalError::Repository(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "APPROVAL_ERROR")
            }

            AppError::Schedule(ScheduleError::InvalidCron(_)) | AppError::Cron(_) => {
                (StatusCode::BAD_REQUEST, "INVALID_CRON")
            }
            AppError::Schedule(ScheduleError::NotFound(_)) => {
                (StatusCode::NOT_FOUND, "SCHEDULE_NOT_FOUND")
            }
            AppError::Schedule(ScheduleError::Registration(_)) => {
                (StatusCode::BAD_GATEWAY, "SCHEDULE_REGISTRATION_FAILED")
            }
            AppError::Schedule(ScheduleError::Substrate(_)) => (StatusCode::BAD_GATEWAY, "SUBSTRATE_ERROR"),
            AppError::Schedule(ScheduleError::Repository(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "SCHEDULE_ERROR")
            }

            AppError::Repository(RepositoryError::NotFound) | AppError::NotFound(_) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND")
            }
            AppError::Repository(RepositoryError::Conflict(_)) => (StatusCode::CONFLICT, "CONFLICT"),
            AppError::Repository(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR"),

            AppError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.classify();
        let message = self.to_string();
        if status.is_server_error() {
            tracing::error!(code, error = %message, "request failed");
        }

        let envelope = ApiResponse::error(code, &message, uuid::Uuid::now_v7().to_string());
        let body = serde_json::to_string(&envelope).unwrap_or_else(|_| {
            r#"{"data":null,"errors":[{"code":"SERIALIZATION_ERROR","message":"Failed to serialize response"}]}"#.to_string()
        });

        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response()
    }
}
