use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use thiserror::Error;

use crate::error::IntakeError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Intake(#[from] IntakeError),

    #[error("Bad Request: {0}")]
    BadRequest(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Intake(e) => match e {
                IntakeError::QuotaExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                IntakeError::ChecksumMismatch { .. }
                | IntakeError::SessionClosed { .. }
                | IntakeError::FileClosed { .. } => StatusCode::CONFLICT,
                IntakeError::SessionExpired(_) => StatusCode::GONE,
                IntakeError::OutOfRange { .. } | IntakeError::InvalidRequest(_) => {
                    StatusCode::BAD_REQUEST
                }
                IntakeError::InvalidFormat { .. }
                | IntakeError::InvalidDimensions { .. }
                | IntakeError::FileTooLarge { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                IntakeError::SessionNotFound(_) | IntakeError::FileNotFound { .. } => {
                    StatusCode::NOT_FOUND
                }
                IntakeError::Unauthorized { .. } => StatusCode::FORBIDDEN,
                IntakeError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                IntakeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (message, code, details) = match self {
            AppError::BadRequest(msg) => (msg, "INVALID_REQUEST", Value::Null),
            AppError::Intake(IntakeError::Internal(e)) => {
                tracing::error!("Internal error: {:?}", e);
                ("Internal Server Error".to_string(), "INTERNAL", Value::Null)
            }
            AppError::Intake(e) => {
                if let IntakeError::StorageUnavailable(msg) = &e {
                    tracing::error!("Storage unavailable: {}", msg);
                }
                (e.to_string(), e.code(), e.details())
            }
        };

        let body = Json(json!({
            "error": message,
            "code": code,
            "details": details,
        }));

        (status, body).into_response()
    }
}
