use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::chat::controller::ChatError;
use crate::dify::DifyError;
use crate::sessions::store::SessionError;

/// Application-level error type.
/// Implements `IntoResponse` so Axum handlers can return `Result<T, AppError>`.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Login required")]
    LoginRequired,

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Dify error: {0}")]
    Dify(#[from] DifyError),
}

impl From<ChatError> for AppError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::LoginRequired => AppError::LoginRequired,
            ChatError::Busy => AppError::Conflict(err.to_string()),
            ChatError::NothingToSend
            | ChatError::UnsupportedFile(_)
            | ChatError::InvalidLinkedinUrl(_) => AppError::Validation(err.to_string()),
            ChatError::NoConversation(_) | ChatError::Session(SessionError::NotFound(_)) => {
                AppError::NotFound(err.to_string())
            }
            ChatError::Dify(e) => AppError::Dify(e),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            AppError::LoginRequired => (
                StatusCode::UNAUTHORIZED,
                "LOGIN_REQUIRED",
                "Sign in to continue".to_string(),
            ),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
            AppError::Dify(DifyError::Config(e)) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "CONFIG_ERROR",
                e.to_string(),
            ),
            AppError::Dify(DifyError::Auth { body }) => {
                tracing::error!("Dify rejected the API key: {body}");
                (
                    StatusCode::BAD_GATEWAY,
                    "DIFY_AUTH_ERROR",
                    "Dify rejected the API key; check DIFY_API_KEY".to_string(),
                )
            }
            AppError::Dify(DifyError::UploadValidation(msg)) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "UPLOAD_VALIDATION_ERROR",
                msg.clone(),
            ),
            AppError::Dify(DifyError::Aborted) => (
                StatusCode::CONFLICT,
                "ABORTED",
                "The request was cancelled".to_string(),
            ),
            AppError::Dify(e) => {
                tracing::error!("Dify error: {e}");
                (
                    StatusCode::BAD_GATEWAY,
                    "UPSTREAM_ERROR",
                    "Could not reach the Dify API".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));

        (status, body).into_response()
    }
}
