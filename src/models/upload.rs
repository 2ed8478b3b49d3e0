//! Upload sessions for multipart and signed uploads.

use super::data::Location;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// Which protocol a session follows.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum UploadKind {
    /// Bucket-native multipart upload driven through this service.
    Multipart,
    /// Client writes straight to the bucket with a pre-signed URL.
    Signed,
}

/// Session lifecycle: `created -> completing -> completed` or
/// `created -> aborting -> aborted`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum UploadState {
    Created,
    Completing,
    Completed,
    Aborting,
    Aborted,
}

impl fmt::Display for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UploadState::Created => "created",
            UploadState::Completing => "completing",
            UploadState::Completed => "completed",
            UploadState::Aborting => "aborting",
            UploadState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Minimal persisted state needed to resume or finish an upload.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadSession {
    /// Opaque identifier handed to the client.
    pub upload_id: String,

    pub kind: UploadKind,

    pub workspace: String,

    pub name: String,

    pub location: Location,

    /// Reserved object key inside the location's bucket.
    pub filename: String,

    pub content_type: String,

    pub state: UploadState,

    pub created_at: DateTime<Utc>,

    /// Signed sessions only: when the write authorization lapses.
    pub expires_at: Option<DateTime<Utc>>,
}

impl UploadSession {
    /// Whether the session targets `workspace/name`.
    pub fn targets(&self, workspace: &str, name: &str) -> bool {
        self.workspace == workspace && self.name == name
    }
}
