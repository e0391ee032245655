use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::types::ApiErrorResponse;

/// Application error codes following the pattern E{area}{sequence}
///
/// Ranges:
/// - E0xxx: Shared/infrastructure errors
/// - E1xxx: Credential errors
/// - E4xxx: Messaging errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Shared (E0xxx)
    InternalError,
    ValidationError,
    NotFound,
    Unauthorized,
    Forbidden,
    ServiceUnavailable,
    BadRequest,
    PayloadTooLarge,

    // Credentials (E1xxx)
    TokenExpired,
    TokenInvalid,

    // Messaging (E4xxx)
    ConversationNotFound,
    NotParticipant,
    MessageNotFound,
    GroupNameRequired,
    NotApproved,
    ScopeViolation,
    CorrespondentNotAllowed,
    AlreadyResponded,
    InvalidParticipants,
    NotInRoom,
}

impl ErrorCode {
    pub fn code(&self) -> &'static str {
        match self {
            // Shared
            Self::InternalError => "E0001",
            Self::ValidationError => "E0002",
            Self::NotFound => "E0003",
            Self::Unauthorized => "E0004",
            Self::Forbidden => "E0005",
            Self::ServiceUnavailable => "E0007",
            Self::BadRequest => "E0008",
            Self::PayloadTooLarge => "E0009",

            // Credentials
            Self::TokenExpired => "E1004",
            Self::TokenInvalid => "E1005",

            // Messaging
            Self::ConversationNotFound => "E4001",
            Self::NotParticipant => "E4002",
            Self::MessageNotFound => "E4003",
            Self::GroupNameRequired => "E4004",
            Self::NotApproved => "E4005",
            Self::ScopeViolation => "E4006",
            Self::CorrespondentNotAllowed => "E4007",
            Self::AlreadyResponded => "E4008",
            Self::InvalidParticipants => "E4009",
            Self::NotInRoom => "E4010",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::ValidationError | Self::BadRequest | Self::GroupNameRequired
            | Self::InvalidParticipants => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::NotFound | Self::ConversationNotFound | Self::MessageNotFound => StatusCode::NOT_FOUND,
            Self::Unauthorized | Self::TokenExpired | Self::TokenInvalid => StatusCode::UNAUTHORIZED,
            Self::Forbidden | Self::NotParticipant | Self::ScopeViolation
            | Self::CorrespondentNotAllowed | Self::NotInRoom => StatusCode::FORBIDDEN,
            Self::NotApproved | Self::AlreadyResponded => StatusCode::CONFLICT,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{message}")]
    Known {
        code: ErrorCode,
        message: String,
        details: Option<serde_json::Value>,
    },

    #[error("internal server error")]
    Internal(#[from] anyhow::Error),

    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

impl AppError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Known {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(code: ErrorCode, message: impl Into<String>, details: serde_json::Value) -> Self {
        Self::Known {
            code,
            message: message.into(),
            details: Some(details),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadRequest, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn conversation_not_found() -> Self {
        Self::new(ErrorCode::ConversationNotFound, "conversation not found")
    }

    pub fn not_participant() -> Self {
        Self::new(ErrorCode::NotParticipant, "you are not a participant of this conversation")
    }

    pub fn not_approved() -> Self {
        Self::new(ErrorCode::NotApproved, "this conversation has not been approved")
    }

    /// Cross-tenant access. Always a programming or security fault, so it is
    /// logged at error level where it is raised, before it reaches the caller.
    pub fn scope_violation(message: impl Into<String>) -> Self {
        let message = message.into();
        tracing::error!(message = %message, "tenant scope violation");
        Self::new(ErrorCode::ScopeViolation, message)
    }

    /// Error code carried by this error, if it is a known application error.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            AppError::Known { code, .. } => Some(*code),
            AppError::Validation(_) => Some(ErrorCode::ValidationError),
            AppError::Database(diesel::result::Error::NotFound) => Some(ErrorCode::NotFound),
            AppError::Internal(_) | AppError::Database(_) => None,
        }
    }

    pub fn is(&self, code: ErrorCode) -> bool {
        self.code() == Some(code)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_response) = match &self {
            AppError::Known { code, message, details } => {
                let status = code.status_code();
                let mut resp = ApiErrorResponse::new(code.code(), message);
                if let Some(d) = details {
                    resp = resp.with_details(d.clone());
                }
                (status, resp)
            }
            AppError::Internal(err) => {
                tracing::error!(error = %err, "internal server error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiErrorResponse::new("E0001", "internal server error"),
                )
            }
            AppError::Database(err) => {
                tracing::error!(error = %err, "database error");
                match err {
                    diesel::result::Error::NotFound => (
                        StatusCode::NOT_FOUND,
                        ApiErrorResponse::new("E0003", "resource not found"),
                    ),
                    _ => (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        ApiErrorResponse::new("E0001", "database error"),
                    ),
                }
            }
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                ApiErrorResponse::new("E0002", msg),
            ),
        };

        (status, Json(error_response)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(err: AppError) -> serde_json::Value {
        let response = err.into_response();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn known_error_envelope() {
        let value = body_json(AppError::not_approved()).await;
        assert_eq!(value["success"], false);
        assert_eq!(value["error"]["code"], "E4005");
        assert_eq!(value["error"]["message"], "this conversation has not been approved");
    }

    #[tokio::test]
    async fn scope_violation_is_forbidden() {
        let response = AppError::scope_violation("tenant mismatch").into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn database_not_found_maps_to_404() {
        let response = AppError::Database(diesel::result::Error::NotFound).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn code_lookup() {
        assert!(AppError::not_participant().is(ErrorCode::NotParticipant));
        assert!(AppError::Validation("x".into()).is(ErrorCode::ValidationError));
        assert_eq!(AppError::Internal(anyhow::anyhow!("boom")).code(), None);
    }
}
