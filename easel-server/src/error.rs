//! Unified server error type.
//!
//! Handlers return `Result<T, ServerError>`; the [`IntoResponse`] impl turns
//! errors into a JSON `{"error": ...}` body with a matching status code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use easel_core::EaselError;
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ServerError {
    /// The caller referenced a model or file that does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller sent an invalid or malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The requested model family cannot run in this build.
    #[error("unsupported engine: {0}")]
    UnsupportedEngine(String),

    /// The generation itself failed; the message is reported to the caller.
    #[error("generation failed: {0}")]
    Generation(String),

    /// An unclassified internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, client_message) = match &self {
            ServerError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            ServerError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ServerError::UnsupportedEngine(m) => (StatusCode::NOT_IMPLEMENTED, m.clone()),
            ServerError::Generation(m) => {
                error!(message = %m, "generation failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Failed to generate image: {m}"),
                )
            }
            ServerError::Internal(m) => {
                error!(message = %m, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_owned(),
                )
            }
        };
        (status, Json(json!({ "error": client_message }))).into_response()
    }
}

impl From<EaselError> for ServerError {
    fn from(e: EaselError) -> Self {
        match e {
            EaselError::NotFound(m) => ServerError::NotFound(m),
            EaselError::InvalidInput(m) => ServerError::BadRequest(m),
            EaselError::UnsupportedEngine(m) => ServerError::UnsupportedEngine(m),
            other => ServerError::Generation(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for ServerError {
    fn from(e: anyhow::Error) -> Self {
        error!(error = ?e, "converting anyhow error to ServerError::Internal");
        ServerError::Internal(e.to_string())
    }
}
