use crate::services::{storage_gateway::StorageError, upload_service::UploadError};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// Error returned by every handler; renders as
/// `{"error": message, "code": kind, "status": http}`.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", msg)
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "FORBIDDEN", msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(code = self.code, "{}", self.message);
        }
        let body = Json(json!({
            "error": self.message,
            "code": self.code,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        let status = match &err {
            UploadError::Validation(_) => StatusCode::BAD_REQUEST,
            UploadError::QuotaExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            UploadError::SessionNotFound(_) | UploadError::ObjectNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            UploadError::SessionExpired(_) => StatusCode::GONE,
            UploadError::SessionTerminalConflict { .. } => StatusCode::CONFLICT,
            UploadError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            UploadError::IntegrityFailure(_) => StatusCode::UNPROCESSABLE_ENTITY,
            UploadError::PartialCleanupFailure(_) | UploadError::Database(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err.code(), err.to_string())
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidGrant(msg) => Self::forbidden(msg),
            StorageError::NotFound(key) => Self::not_found(format!("object `{key}` not found")),
            other => UploadError::from(other).into(),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}
