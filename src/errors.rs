use crate::services::upload_service::SessionError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use std::fmt;

/// HTTP-facing error. Renders as `{"error", "status"}` JSON, plus a
/// machine-readable `code` and structured `details` when present.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    pub code: Option<&'static str>,
    pub details: Option<Value>,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            code: None,
            details: None,
        }
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, msg)
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, msg)
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = self.status.as_u16(), "{}", self.message);
        }

        let mut body = json!({
            "error": self.message,
            "status": self.status.as_u16()
        });
        if let Some(code) = self.code {
            body["code"] = json!(code);
        }
        if let Some(details) = self.details {
            body["details"] = details;
        }

        (self.status, Json(body)).into_response()
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        let message = err.to_string();
        match err {
            SessionError::InvalidRequest(_) => {
                AppError::bad_request(message).with_code("invalid_request")
            }
            SessionError::InvalidIndex { index, chunk_count } => AppError::bad_request(message)
                .with_code("invalid_index")
                .with_details(json!({ "chunkIndex": index, "chunkCount": chunk_count })),
            SessionError::NotFound => AppError::not_found(message).with_code("not_found"),
            SessionError::Forbidden => AppError::forbidden(message).with_code("forbidden"),
            SessionError::ChecksumConflict {
                index,
                expected,
                received,
            } => AppError::conflict(message)
                .with_code("checksum_conflict")
                .with_details(json!({
                    "chunkIndex": index,
                    "expected": expected,
                    "received": received
                })),
            SessionError::IncompleteUpload { received, expected } => AppError::conflict(message)
                .with_code("incomplete_upload")
                .with_details(json!({ "received": received, "expected": expected })),
            SessionError::NotReady { status } => AppError::conflict(message)
                .with_code("not_ready")
                .with_details(json!({ "status": status })),
            SessionError::Provider(_) => {
                AppError::new(StatusCode::BAD_GATEWAY, message).with_code("provider_error")
            }
            SessionError::Repository(_) => {
                AppError::internal(message).with_code("repository_error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::session::{ProviderKind, SessionStatus};
    use crate::providers::ProviderError;

    #[test]
    fn session_errors_map_to_http_status() {
        let cases = [
            (SessionError::InvalidRequest("x".into()), StatusCode::BAD_REQUEST),
            (
                SessionError::InvalidIndex {
                    index: 4,
                    chunk_count: 2,
                },
                StatusCode::BAD_REQUEST,
            ),
            (SessionError::NotFound, StatusCode::NOT_FOUND),
            (SessionError::Forbidden, StatusCode::FORBIDDEN),
            (
                SessionError::IncompleteUpload {
                    received: 1,
                    expected: 2,
                },
                StatusCode::CONFLICT,
            ),
            (
                SessionError::NotReady {
                    status: SessionStatus::Uploading,
                },
                StatusCode::CONFLICT,
            ),
            (
                SessionError::Provider(ProviderError::NotConfigured(ProviderKind::R2)),
                StatusCode::BAD_GATEWAY,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }

    #[test]
    fn conflict_reports_both_checksums() {
        let err = AppError::from(SessionError::ChecksumConflict {
            index: 0,
            expected: "abc".into(),
            received: "xyz".into(),
        });
        assert_eq!(err.status, StatusCode::CONFLICT);
        assert_eq!(err.code, Some("checksum_conflict"));
        let details = err.details.unwrap();
        assert_eq!(details["expected"], "abc");
        assert_eq!(details["received"], "xyz");
    }
}
