//! Service error taxonomy
//!
//! Errors surfaced through the public contracts, with a stable mapping to
//! HTTP statuses and WebSocket close codes.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use serde_json::json;

use crate::repository::RepositoryError;

/// Error taxonomy for all public chat operations
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ChatError {
    /// Machine-readable code used in HTTP bodies and WebSocket error frames.
    pub fn code(&self) -> &'static str {
        match self {
            ChatError::InvalidArgument(_) => "invalid_argument",
            ChatError::Unauthenticated(_) => "unauthenticated",
            ChatError::PermissionDenied(_) => "permission_denied",
            ChatError::NotFound(_) => "not_found",
            ChatError::Conflict(_) => "conflict",
            ChatError::ResourceExhausted(_) => "resource_exhausted",
            ChatError::Unavailable(_) => "unavailable",
            ChatError::Internal(_) => "internal",
        }
    }

    /// Whether the failure is safe to report to a WebSocket client before
    /// continuing the session.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ChatError::InvalidArgument(_)
                | ChatError::PermissionDenied(_)
                | ChatError::NotFound(_)
                | ChatError::Conflict(_)
                | ChatError::ResourceExhausted(_)
        )
    }
}

impl ResponseError for ChatError {
    fn status_code(&self) -> StatusCode {
        match self {
            ChatError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            ChatError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            ChatError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            ChatError::NotFound(_) => StatusCode::NOT_FOUND,
            ChatError::Conflict(_) => StatusCode::CONFLICT,
            ChatError::ResourceExhausted(_) => StatusCode::TOO_MANY_REQUESTS,
            ChatError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ChatError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({
            "error": self.code(),
            "message": self.to_string(),
        }))
    }
}

impl From<RepositoryError> for ChatError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound => ChatError::NotFound("resource not found".to_string()),
            RepositoryError::UniqueViolation(detail) => ChatError::Conflict(detail),
            RepositoryError::IntegrityViolation(detail) => ChatError::Conflict(detail),
            RepositoryError::Backend(detail) => ChatError::Unavailable(detail),
        }
    }
}
