use crate::models::upload::UploadState;
use std::io::{self, ErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob `{name}` not found in workspace `{workspace}`")]
    NotFound { workspace: String, name: String },
    #[error("object `{0}` not found in bucket")]
    ObjectNotFound(String),
    #[error("upload `{0}` not found")]
    UploadNotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("object `{0}` already exists")]
    AlreadyExists(String),
    #[error("upload `{upload_id}` is {state}")]
    InvalidUploadState {
        upload_id: String,
        state: UploadState,
    },
    #[error("range not satisfiable for object of {size} bytes")]
    RangeNotSatisfiable { size: u64 },
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type BlobResult<T> = Result<T, BlobError>;

impl BlobError {
    pub fn not_found(workspace: &str, name: &str) -> Self {
        Self::NotFound {
            workspace: workspace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    /// Whether retrying the same idempotent operation may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            BlobError::Sqlx(err) => is_transient_sqlx(err),
            BlobError::Io(err) => is_transient_io(err),
            _ => false,
        }
    }
}

fn is_transient_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db_err) => {
            let message = db_err.message().to_ascii_lowercase();
            message.contains("locked") || message.contains("busy")
        }
        _ => false,
    }
}

fn is_transient_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::Interrupted
            | ErrorKind::TimedOut
            | ErrorKind::WouldBlock
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_transient_failures() {
        assert!(BlobError::Sqlx(sqlx::Error::PoolTimedOut).is_transient());
        assert!(BlobError::Io(io::Error::from(ErrorKind::TimedOut)).is_transient());
        assert!(!BlobError::Io(io::Error::from(ErrorKind::NotFound)).is_transient());
        assert!(!BlobError::Sqlx(sqlx::Error::RowNotFound).is_transient());
        assert!(!BlobError::not_found("ws", "a.txt").is_transient());
    }
}
