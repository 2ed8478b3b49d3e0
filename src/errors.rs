use crate::services::error::BlobError;
use axum::{
    Json,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use tracing::error;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    /// Extra response headers, e.g. `Content-Range` on a 416.
    pub headers: HeaderMap,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            headers: HeaderMap::new(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    /// Stable machine-readable tag, used for per-item outcomes.
    pub fn tag(&self) -> &'static str {
        match self.status {
            StatusCode::NOT_FOUND => "NotFound",
            StatusCode::BAD_REQUEST => "BadRequest",
            StatusCode::FORBIDDEN => "Forbidden",
            StatusCode::CONFLICT => "InvalidUploadState",
            StatusCode::RANGE_NOT_SATISFIABLE => "RangeNotSatisfiable",
            _ => "UpstreamStorageFailure",
        }
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
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, self.headers, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<BlobError> for AppError {
    fn from(err: BlobError) -> Self {
        match &err {
            BlobError::NotFound { .. } | BlobError::ObjectNotFound(_) | BlobError::UploadNotFound(_) => {
                AppError::not_found(err.to_string())
            }
            BlobError::BadRequest(msg) => AppError::bad_request(msg.clone()),
            BlobError::Forbidden(msg) => AppError::new(StatusCode::FORBIDDEN, msg.clone()),
            BlobError::InvalidUploadState { .. } | BlobError::AlreadyExists(_) => {
                AppError::new(StatusCode::CONFLICT, err.to_string())
            }
            BlobError::RangeNotSatisfiable { size } => {
                let mut app = AppError::new(StatusCode::RANGE_NOT_SATISFIABLE, err.to_string());
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                    app.headers.insert(header::CONTENT_RANGE, value);
                }
                app
            }
            BlobError::Sqlx(_) | BlobError::Io(_) | BlobError::Json(_) => {
                error!(error = %err, "storage failure");
                AppError::internal("storage failure")
            }
        }
    }
}
