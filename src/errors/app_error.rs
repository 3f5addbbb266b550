use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::core::feedback::StoreError;
use crate::errors::ErrorKind;

/// Errors surfaced by the HTTP status routes.
///
/// The realtime path never touches this type; it exists so the operator
/// surface maps store and catalog failures onto proper HTTP responses.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("unknown policy variant '{0}'")]
    UnknownVariant(String),
    #[error("feedback store unavailable: {0}")]
    Store(#[from] StoreError),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::UnknownVariant(_) => StatusCode::NOT_FOUND,
            AppError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> ErrorKind {
        match self {
            AppError::UnknownVariant(_) => ErrorKind::Validation,
            AppError::Store(_) => ErrorKind::Persistence,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        tracing::warn!("status route error: {self}");
        let body = Json(json!({
            "error": self.to_string(),
            "code": self.kind().code(),
            "status": status.as_u16(),
        }));
        (status, body).into_response()
    }
}

// Result type alias for convenience
pub type AppResult<T> = Result<T, AppError>;
