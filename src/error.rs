use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

/// Classification every component error is folded into before it reaches a caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input, fixable by the client.
    Validation,
    /// Duplicate email, already verified, already settled.
    Conflict,
    /// Bad credentials, invalid or expired token, unverified account.
    Auth,
    NotFound,
    /// Hashing, signing or storage failure.
    Internal,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::Auth => StatusCode::UNAUTHORIZED,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// Error returned by HTTP handlers.
#[derive(Debug)]
pub struct AppError {
    pub kind: ErrorKind,
    pub message: String,
}

impl AppError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Builds an error from any classified component error. Internal details are
    /// logged here and never sent to the client.
    pub fn classify<E>(err: E) -> Self
    where
        E: std::fmt::Display + Classify,
    {
        let kind = err.kind();
        if kind == ErrorKind::Internal {
            error!(error = %err, "internal error");
            return Self::new(kind, "Something bad happened");
        }
        Self::new(kind, err.to_string())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for AppError {}

/// Implemented by every component error so it can be mapped onto [`ErrorKind`].
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}

impl<E> From<E> for AppError
where
    E: std::fmt::Display + Classify,
{
    fn from(err: E) -> Self {
        AppError::classify(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = if self.kind == ErrorKind::Internal {
            "error"
        } else {
            "fail"
        };
        (
            self.kind.status(),
            Json(json!({ "status": status, "message": self.message })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("db exploded: secret detail")]
    struct Boom;

    impl Classify for Boom {
        fn kind(&self) -> ErrorKind {
            ErrorKind::Internal
        }
    }

    #[test]
    fn internal_errors_hide_details() {
        let err = AppError::classify(Boom);
        assert_eq!(err.kind, ErrorKind::Internal);
        assert!(!err.message.contains("secret"));
    }

    #[test]
    fn kinds_map_to_http_statuses() {
        assert_eq!(ErrorKind::Validation.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorKind::Conflict.status(), StatusCode::CONFLICT);
        assert_eq!(ErrorKind::Auth.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorKind::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ErrorKind::Internal.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
