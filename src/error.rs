// src/error.rs

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// Global Application Error Enum.
/// Every failure a live-session operation can report, mapped to HTTP below.
/// All of them are terminal for the request that triggered them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    // 500 Internal Server Error
    InternalServerError(String),

    // 400 Bad Request
    BadRequest(String),

    // 401 Missing or invalid credentials
    AuthError(String),

    // 403 Caller is known but lacks ownership/role
    Unauthorized(String),

    // 404 Session, participant or question absent
    NotFound(String),

    // 409 State machine precondition violated (includes lost CAS races)
    InvalidTransition(String),

    // 409 Second submission for the same (session, question, participant)
    DuplicateAnswer,

    // 409 Answer targets a question that is not the current one
    StaleQuestion,

    // 410 Joining a finished session
    SessionEnded,

    // 409 Answering while the session is not ACTIVE
    SessionNotActive,

    // 403 Only students may answer
    InvalidRole,

    // 503 No free PIN found within the attempt budget
    PinExhausted,
}

impl AppError {
    /// Stable machine-readable code sent alongside the message.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::InternalServerError(_) => "internal",
            AppError::BadRequest(_) => "bad_request",
            AppError::AuthError(_) => "auth_error",
            AppError::Unauthorized(_) => "unauthorized",
            AppError::NotFound(_) => "not_found",
            AppError::InvalidTransition(_) => "invalid_transition",
            AppError::DuplicateAnswer => "duplicate_answer",
            AppError::StaleQuestion => "stale_question",
            AppError::SessionEnded => "session_ended",
            AppError::SessionNotActive => "session_not_active",
            AppError::InvalidRole => "invalid_role",
            AppError::PinExhausted => "pin_exhausted",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::AuthError(_) => StatusCode::UNAUTHORIZED,
            AppError::Unauthorized(_) | AppError::InvalidRole => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidTransition(_)
            | AppError::DuplicateAnswer
            | AppError::StaleQuestion
            | AppError::SessionNotActive => StatusCode::CONFLICT,
            AppError::SessionEnded => StatusCode::GONE,
            AppError::PinExhausted => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn message(&self) -> String {
        match self {
            AppError::InternalServerError(_) => "Internal Server Error".to_string(),
            AppError::BadRequest(msg)
            | AppError::AuthError(msg)
            | AppError::Unauthorized(msg)
            | AppError::NotFound(msg)
            | AppError::InvalidTransition(msg) => msg.clone(),
            AppError::DuplicateAnswer => "An answer for this question was already submitted".to_string(),
            AppError::StaleQuestion => "This question is no longer open for answers".to_string(),
            AppError::SessionEnded => "This session has ended".to_string(),
            AppError::SessionNotActive => "This session is not running".to_string(),
            AppError::InvalidRole => "Only students can submit answers".to_string(),
            AppError::PinExhausted => "Could not allocate a free session PIN".to_string(),
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::InternalServerError(msg) => write!(f, "internal error: {}", msg),
            other => write!(f, "{}: {}", other.code(), other.message()),
        }
    }
}

impl std::error::Error for AppError {}

/// Implements `IntoResponse` for `AppError`.
/// Converts the error into a JSON response with appropriate HTTP status code.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::InternalServerError(msg) = &self {
            tracing::error!("Internal Server Error: {}", msg);
        }
        let body = Json(json!({
            "error": self.message(),
            "code": self.code(),
        }));

        (self.status(), body).into_response()
    }
}

/// Converts `sqlx::Error` into `AppError::InternalServerError`.
/// Allows using `?` operator on database queries.
impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::InternalServerError(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::BadRequest(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_map_to_conflict() {
        for err in [
            AppError::InvalidTransition("x".into()),
            AppError::DuplicateAnswer,
            AppError::StaleQuestion,
            AppError::SessionNotActive,
        ] {
            assert_eq!(err.status(), StatusCode::CONFLICT, "{}", err.code());
        }
    }

    #[test]
    fn internal_message_is_not_leaked() {
        let err = AppError::InternalServerError("connection refused at 10.0.0.3".into());
        assert_eq!(err.message(), "Internal Server Error");
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn ended_session_is_gone() {
        assert_eq!(AppError::SessionEnded.status(), StatusCode::GONE);
        assert_eq!(AppError::SessionEnded.code(), "session_ended");
    }
}
