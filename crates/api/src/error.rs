//! HTTP error mapping.
//!
//! Every failure leaves the API as `{ "error": <message>, "code": <CODE> }`.
//! Engine faults (missing metadata, extraction failures, internal errors)
//! are logged and reported with a generic message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use rigger_core::error::CoreError;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type AppResult<T> = Result<T, AppError>;

/// Status, machine-readable code and client-facing message.
type Classified = (StatusCode, &'static str, String);

const GENERIC_MESSAGE: &str = "An internal error occurred";

fn internal() -> Classified {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        GENERIC_MESSAGE.to_string(),
    )
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Core(core) => classify_core_error(core),
            AppError::Database(err) => classify_sqlx_error(err),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::InternalError(msg) => {
                tracing::error!(error = %msg, "Request failed");
                internal()
            }
        };

        (status, axum::Json(json!({ "error": message, "code": code }))).into_response()
    }
}

fn classify_core_error(err: &CoreError) -> Classified {
    match err {
        CoreError::NotFound { entity, id } => (
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("{entity} with id {id} not found"),
        ),
        CoreError::TemplateNotFound(_) => {
            (StatusCode::NOT_FOUND, "TEMPLATE_NOT_FOUND", err.to_string())
        }
        CoreError::Render { .. } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            "RENDER_ERROR",
            err.to_string(),
        ),
        CoreError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
        CoreError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
        CoreError::MetadataKeyNotFound { .. }
        | CoreError::UnsupportedEntity(_)
        | CoreError::Extraction(_)
        | CoreError::Internal(_) => {
            tracing::error!(error = %err, "Engine error surfaced to the API");
            internal()
        }
    }
}

/// `RowNotFound` is a 404; any other database failure is hidden behind a
/// generic 500.
fn classify_sqlx_error(err: &sqlx::Error) -> Classified {
    match err {
        sqlx::Error::RowNotFound => (
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "Resource not found".to_string(),
        ),
        other => {
            tracing::error!(error = %other, "Database error");
            internal()
        }
    }
}
