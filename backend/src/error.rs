use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Server-wide error type. Each variant maps to the status code and JSON
/// body shape used throughout the HTTP surface.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited")]
    RateLimited,

    #[error("payload too large")]
    PayloadTooLarge,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("server not configured for encryption")]
    EncryptionNotConfigured,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<fleet_core::CoreError> for AppError {
    fn from(e: fleet_core::CoreError) -> Self {
        AppError::Internal(e.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::Internal(format!("database error: {e}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::BadRequest(format!("invalid JSON: {e}"))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
            AppError::Forbidden(m) => (StatusCode::FORBIDDEN, m.clone()),
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            AppError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded".to_string()),
            AppError::PayloadTooLarge => (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large".to_string()),
            AppError::DecryptionFailed => (StatusCode::BAD_REQUEST, "Decryption failed".to_string()),
            AppError::EncryptionNotConfigured => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Server not configured for encryption".to_string())
            }
            AppError::Internal(m) => {
                tracing::error!(error = %m, "internal_error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let mut extra = json!({"error": message});
        if matches!(self, AppError::DecryptionFailed | AppError::EncryptionNotConfigured) {
            extra["e2ee_verified"] = json!(false);
        }
        (status, Json(extra)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
