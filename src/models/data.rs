//! Content-addressed payload records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// Identity of a payload: the first 16 bytes of its SHA-256 digest, shaped as a UUID.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct ContentHash(pub Uuid);

impl ContentHash {
    /// Derive the identifier from a full SHA-256 digest.
    pub fn from_digest(digest: &[u8; 32]) -> Self {
        let mut head = [0u8; 16];
        head.copy_from_slice(&digest[..16]);
        Self(Uuid::from_bytes(head))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A storage shard. Every location owns exactly one bucket.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct Location(pub String);

impl Location {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One physical object holding a distinct payload at a location.
///
/// Rows are written once and never updated. A second insert for the same
/// `(hash, location)` is ignored rather than rejected.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct Data {
    /// Content identifier.
    pub hash: ContentHash,

    /// Shard holding the physical object.
    pub location: Location,

    /// Opaque object key inside the location's bucket.
    pub filename: String,

    /// MIME type recorded at first ingestion.
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub content_type: String,

    /// Payload size in bytes.
    pub size: i64,

    pub created_at: DateTime<Utc>,
}
