//! Hooks into the media-processing collaborator.

use super::error::BlobResult;
use crate::models::data::Location;
use async_trait::async_trait;
use tracing::debug;

/// A freshly ingested object the media pipeline may copy from.
#[derive(Clone, Debug, PartialEq)]
pub struct MediaSource {
    pub workspace: String,
    pub name: String,
    pub location: Location,
    pub filename: String,
    pub content_type: String,
}

/// Streaming-media content families get an extra copy into the media pipeline.
pub fn is_streaming_media(content_type: &str) -> bool {
    content_type
        .trim()
        .get(..6)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case("video/"))
}

/// Collaborator that transcodes media and owns derived renditions.
#[async_trait]
pub trait MediaProcessor: Send + Sync {
    /// Copy a newly stored object into the media pipeline.
    async fn copy(&self, source: MediaSource) -> BlobResult<()>;

    /// Drop renditions derived from `workspace/name`.
    async fn delete_derived(&self, workspace: &str, name: &str) -> BlobResult<()>;
}

/// Used when no media pipeline is configured.
pub struct NoMediaProcessor;

#[async_trait]
impl MediaProcessor for NoMediaProcessor {
    async fn copy(&self, source: MediaSource) -> BlobResult<()> {
        debug!(workspace = %source.workspace, name = %source.name, "no media processor configured");
        Ok(())
    }

    async fn delete_derived(&self, _workspace: &str, _name: &str) -> BlobResult<()> {
        Ok(())
    }
}
