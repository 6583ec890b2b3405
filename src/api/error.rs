use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::error::SchedulerError;

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    dependents: Vec<String>,
}

/// An error answer of the HTTP API
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub dependents: Vec<String>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            dependents: Vec::new(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        let status = match &err {
            SchedulerError::Validation(_) => StatusCode::BAD_REQUEST,
            SchedulerError::Conflict { .. } => StatusCode::FORBIDDEN,
            SchedulerError::JobNotFound(_) => StatusCode::NOT_FOUND,
            SchedulerError::AtCapacity | SchedulerError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
            SchedulerError::InvalidTransition { .. } | SchedulerError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let dependents = match &err {
            SchedulerError::Conflict { dependents, .. } => {
                dependents.iter().map(|id| id.to_string()).collect()
            }
            _ => Vec::new(),
        };
        Self {
            status,
            message: err.to_string(),
            dependents,
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(rejection.status(), rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, error = %self.message, "Request failed");
        }
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
                dependents: self.dependents,
            }),
        )
            .into_response()
    }
}
