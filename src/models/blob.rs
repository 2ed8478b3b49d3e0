//! Name-addressed blob records and the metadata views built from them.

use super::data::{ContentHash, Location};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A workspace-scoped name pointing at content.
///
/// Re-uploading under the same name repoints `hash`/`location`; deletion only
/// flips `deleted`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct Blob {
    /// Tenant namespace.
    pub workspace: String,

    /// Logical name inside the workspace.
    pub name: String,

    pub hash: ContentHash,

    pub location: Location,

    /// Soft-delete flag. Deleted blobs are invisible to every read path.
    pub deleted: bool,

    pub updated_at: DateTime<Utc>,
}

impl Blob {
    /// A live pointer from `workspace/name` to `(hash, location)`.
    pub fn active(workspace: &str, name: &str, hash: ContentHash, location: Location) -> Self {
        Self {
            workspace: workspace.to_string(),
            name: name.to_string(),
            hash,
            location,
            deleted: false,
            updated_at: Utc::now(),
        }
    }
}

/// An active blob joined with the data row it resolves to.
#[derive(Clone, FromRow, Debug)]
pub struct ResolvedBlob {
    pub workspace: String,
    pub name: String,
    pub hash: ContentHash,
    pub location: Location,
    pub filename: String,
    #[sqlx(rename = "type")]
    pub content_type: String,
    pub size: i64,
}

/// Metadata returned to callers after an upload or listing.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BlobMetadata {
    pub name: String,
    /// Content hash; identical payloads share it.
    pub etag: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub content_type: String,
}

impl From<&ResolvedBlob> for BlobMetadata {
    fn from(blob: &ResolvedBlob) -> Self {
        Self {
            name: blob.name.clone(),
            etag: blob.hash.to_string(),
            size: blob.size.max(0) as u64,
            content_type: blob.content_type.clone(),
        }
    }
}

/// Everything a read response needs besides the bytes.
#[derive(Clone, Debug, PartialEq)]
pub struct BlobInfo {
    pub name: String,
    pub hash: ContentHash,
    /// Full object size.
    pub size: u64,
    pub content_type: String,
    /// Entity tag reported by the bucket for the physical object.
    pub etag: String,
    pub last_modified: DateTime<Utc>,
}
