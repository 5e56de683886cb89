//! # Proxy errors
//!
//! Handlers return [`AppResult`]. Each [`AppError`] variant belongs to an
//! [`ErrorCode`], which picks the HTTP status:
//!
//! | code | status | raised for |
//! |---|---|---|
//! | `protocol_violation` | 400 | bad `Content-Type`, truncated body, unsafe path |
//! | `not_found` | 404 | no local file and no `link` to fetch it from |
//! | `update_forbidden` | 403 | re-upload into a package locked against updates |
//! | `checksum_conflict` | 417 | declared and received MD5 differ |
//! | `upstream_error` | 502 | index page or transload source unavailable |
//! | `internal_error` | 500 | local I/O and everything else |
//!
//! The body is JSON:
//!
//! ```json
//! {"error": "Checksum conflict for foo-1.0.tar.gz: ...", "code": "checksum_conflict",
//!  "details": {"filename": "foo-1.0.tar.gz", "declared": "...", "computed": "..."},
//!  "timestamp": "2024-01-01T12:00:00+00:00"}
//! ```
//!
//! Malformed form fields and failing crawl pages are not errors at this level;
//! they are logged and skipped where they occur.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};

/// JSON body of an error response.
#[derive(Serialize, Debug)]
pub struct ApiErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// RFC 3339
    pub timestamp: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ProtocolViolation,
    NotFound,
    UpdateForbidden,
    ChecksumConflict,
    UpstreamError,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProtocolViolation => "protocol_violation",
            Self::NotFound => "not_found",
            Self::UpdateForbidden => "update_forbidden",
            Self::ChecksumConflict => "checksum_conflict",
            Self::UpstreamError => "upstream_error",
            Self::InternalError => "internal_error",
        }
    }

    pub fn http_status(self) -> StatusCode {
        match self {
            Self::ProtocolViolation => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::UpdateForbidden => StatusCode::FORBIDDEN,
            Self::ChecksumConflict => StatusCode::EXPECTATION_FAILED,
            Self::UpstreamError => StatusCode::BAD_GATEWAY,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crawl cache encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("Form value is not UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Updating package {0} is not allowed")]
    UpdateForbidden(String),

    #[error("Checksum conflict for {filename}: declared {declared}, received {computed}")]
    ChecksumMismatch {
        filename: String,
        declared: String,
        computed: String,
    },

    #[error("Upstream request failed: {0}")]
    Upstream(String),

    #[error("{0}")]
    InternalError(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AppError {
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::BadRequest(_) | Self::Utf8(_) => ErrorCode::ProtocolViolation,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::UpdateForbidden(_) => ErrorCode::UpdateForbidden,
            Self::ChecksumMismatch { .. } => ErrorCode::ChecksumConflict,
            Self::Upstream(_) => ErrorCode::UpstreamError,
            Self::Io(_) | Self::Json(_) | Self::Yaml(_) | Self::InternalError(_) | Self::Anyhow(_) => {
                ErrorCode::InternalError
            }
        }
    }

    /// Structured context for the response body.
    pub fn details(&self) -> Option<Value> {
        match self {
            Self::ChecksumMismatch {
                filename,
                declared,
                computed,
            } => Some(json!({
                "filename": filename,
                "declared": declared,
                "computed": computed,
            })),
            Self::UpdateForbidden(package) => Some(json!({ "package": package })),
            Self::Anyhow(e) => Some(json!({ "cause": format!("{:#}", e) })),
            _ => None,
        }
    }

    pub fn to_error_response(&self) -> ApiErrorResponse {
        ApiErrorResponse {
            error: self.to_string(),
            code: self.error_code().as_str().to_string(),
            details: self.details(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = self.error_code();
        let status = code.http_status();
        if status.is_server_error() {
            tracing::error!(code = code.as_str(), error = %self, "Request failed");
        } else {
            tracing::warn!(code = code.as_str(), error = %self, "Request rejected");
        }

        (status, axum::Json(self.to_error_response())).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AppError::BadRequest("no boundary".into())
                .error_code()
                .http_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::UpdateForbidden("foo".into())
                .error_code()
                .http_status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::Upstream("timeout".into())
                .error_code()
                .http_status(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_checksum_mismatch_details() {
        let err = AppError::ChecksumMismatch {
            filename: "foo-1.0.tar.gz".into(),
            declared: "aaa".into(),
            computed: "bbb".into(),
        };
        assert_eq!(err.error_code(), ErrorCode::ChecksumConflict);
        assert_eq!(err.error_code().http_status(), StatusCode::EXPECTATION_FAILED);

        let response = err.to_error_response();
        assert_eq!(response.code, "checksum_conflict");
        let details = response.details.expect("mismatch should carry details");
        assert_eq!(details["declared"], "aaa");
        assert_eq!(details["computed"], "bbb");
    }

    #[test]
    fn test_details_omitted_when_absent() {
        let body = serde_json::to_value(AppError::NotFound("gone".into()).to_error_response())
            .expect("serialize");
        assert_eq!(body["code"], "not_found");
        assert!(body.get("details").is_none());
    }
}
