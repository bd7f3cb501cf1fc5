//! Unified error handling.
//!
//! Route handlers return `Result<T, AppError>`; the `IntoResponse` impl maps
//! each variant to a status code and the JSON error envelope. Internal
//! failures are logged and never leak details to the client.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// One invalid field in a request payload.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FieldError {
    pub path: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum AppError {
    /// Request is well-formed but violates a business rule.
    #[error("{0}")]
    BadRequest(String),

    /// Request payload failed field validation.
    #[error("Validation failed")]
    Validation(Vec<FieldError>),

    /// Missing or unusable credentials.
    #[error("{0}")]
    Unauthenticated(String),

    /// Authenticated, but not allowed to do this.
    #[error("{0}")]
    Forbidden(String),

    /// Resource does not exist (or is hidden from the caller).
    #[error("{0} not found")]
    NotFound(&'static str),

    /// State conflict: duplicate resource or illegal transition.
    #[error("{0}")]
    Conflict(String),

    /// Anything we cannot blame the caller for.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn unauthenticated(msg: impl Into<String>) -> Self {
        Self::Unauthenticated(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn from_validation(errors: validator::ValidationErrors) -> Self {
        let mut fields = Vec::new();
        for (path, errs) in errors.field_errors() {
            for err in errs {
                let message = err
                    .message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| err.code.to_string());
                fields.push(FieldError {
                    path: path.to_string(),
                    message,
                });
            }
        }
        Self::Validation(fields)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let Self::Internal(msg) = &self {
            tracing::error!(error = %msg, "request failed");
        }

        let status = match &self {
            Self::BadRequest(_) | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Don't expose internal error details to clients
        let body = match &self {
            Self::Internal(_) => json!({
                "status": "error",
                "message": "Internal server error",
            }),
            Self::Validation(fields) => json!({
                "status": "error",
                "message": self.to_string(),
                "details": fields,
            }),
            _ => json!({
                "status": "error",
                "message": self.to_string(),
            }),
        };

        (status, Json(body)).into_response()
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        if is_unique_violation(&err) {
            return Self::Conflict("Resource already exists".into());
        }
        Self::Internal(err.to_string())
    }
}

impl From<bcrypt::BcryptError> for AppError {
    fn from(err: bcrypt::BcryptError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

/// Postgres unique-constraint violation (SQLSTATE 23505).
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

pub type Result<T> = std::result::Result<T, AppError>;
