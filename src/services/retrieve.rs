//! Reads, deletes and listings.

use super::{
    BlobService,
    bucket::{ByteRange, ByteStream, ObjectHead},
    cache::CachedBlob,
    error::{BlobError, BlobResult},
    hasher::collect_bounded,
    location::Shard,
    range::RangeSpec,
};
use crate::models::blob::{BlobInfo, BlobMetadata, ResolvedBlob};
use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info};

/// Upper bound on a listing page.
pub const MAX_LIST_LIMIT: usize = 1000;

/// Payload of a read: fully buffered when it came from (or went into) the
/// cache, streamed from the bucket otherwise.
pub enum BlobBody {
    Buffered(Bytes),
    Stream(ByteStream<'static>),
}

pub struct BlobContent {
    pub info: BlobInfo,
    /// Set for partial responses only.
    pub range: Option<ByteRange>,
    pub body: BlobBody,
}

impl BlobContent {
    /// Bytes this response carries.
    pub fn content_length(&self) -> u64 {
        self.range.map_or(self.info.size, |r| r.len())
    }

    pub async fn into_bytes(self) -> BlobResult<Bytes> {
        match self.body {
            BlobBody::Buffered(bytes) => Ok(bytes),
            BlobBody::Stream(stream) => collect_bounded(stream, u64::MAX).await,
        }
    }
}

/// One page of a workspace listing.
#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BlobPage {
    pub blobs: Vec<BlobMetadata>,
    /// Name to pass as `cursor` for the next page; absent on the last one.
    pub cursor: Option<String>,
}

fn blob_info(stored: &ResolvedBlob, head: &ObjectHead) -> BlobInfo {
    BlobInfo {
        name: stored.name.clone(),
        hash: stored.hash,
        size: stored.size.max(0) as u64,
        content_type: stored.content_type.clone(),
        etag: head.etag.clone(),
        last_modified: head.last_modified,
    }
}

impl BlobService {
    async fn resolve(&self, workspace: &str, name: &str) -> BlobResult<(ResolvedBlob, &Shard)> {
        let stored = self
            .settings
            .retry
            .run("resolve blob", || self.db.resolve_blob(workspace, name))
            .await?
            .ok_or_else(|| BlobError::not_found(workspace, name))?;
        let shard = self.shard(&stored.location)?;
        Ok((stored, shard))
    }

    /// Read `workspace/name`, optionally a single byte range of it.
    ///
    /// A range covering the whole object is served as a full response.
    pub async fn get(
        &self,
        workspace: &str,
        name: &str,
        range: Option<RangeSpec>,
    ) -> BlobResult<BlobContent> {
        if range.is_none() {
            if let Some(hit) = self.cache.get(workspace, name) {
                debug!(workspace, name, "served from cache");
                return Ok(BlobContent {
                    info: hit.info,
                    range: None,
                    body: BlobBody::Buffered(hit.body),
                });
            }
        }

        let ticket = self.cache.ticket();
        let (stored, shard) = self.resolve(workspace, name).await?;
        let size = stored.size.max(0) as u64;
        let byte_range = range
            .map(|spec| spec.resolve(size))
            .transpose()?
            .filter(|r| r.len() < size);

        let object = self
            .settings
            .retry
            .run("get object", || shard.bucket.get(&stored.filename, byte_range))
            .await?
            .ok_or_else(|| BlobError::ObjectNotFound(stored.filename.clone()))?;
        let info = blob_info(&stored, &object.head);

        if range.is_none() && self.cache.admits(size) {
            let body = collect_bounded(object.stream, size).await?;
            self.cache.insert(
                workspace,
                name,
                ticket,
                CachedBlob {
                    info: info.clone(),
                    body: body.clone(),
                },
            );
            return Ok(BlobContent {
                info,
                range: None,
                body: BlobBody::Buffered(body),
            });
        }

        Ok(BlobContent {
            info,
            range: byte_range,
            body: BlobBody::Stream(object.stream),
        })
    }

    pub async fn head(&self, workspace: &str, name: &str) -> BlobResult<BlobInfo> {
        if let Some(hit) = self.cache.get(workspace, name) {
            return Ok(hit.info);
        }
        let (stored, shard) = self.resolve(workspace, name).await?;
        let head = self
            .settings
            .retry
            .run("head object", || shard.bucket.head(&stored.filename))
            .await?
            .ok_or_else(|| BlobError::ObjectNotFound(stored.filename.clone()))?;
        Ok(blob_info(&stored, &head))
    }

    /// Whole payload of `workspace/name` in memory.
    pub async fn get_blob(&self, workspace: &str, name: &str) -> BlobResult<Bytes> {
        self.get(workspace, name, None).await?.into_bytes().await
    }

    /// Soft-delete `workspace/name`. The content stays until the sweep finds
    /// it unreferenced.
    pub async fn delete(&self, workspace: &str, name: &str) -> BlobResult<()> {
        let deleted = self
            .settings
            .retry
            .run("delete blob", || self.db.delete_blob(workspace, name))
            .await?;
        self.cache.invalidate(workspace, name);
        if !deleted {
            return Err(BlobError::not_found(workspace, name));
        }
        self.spawn_media_delete(workspace, name);
        info!(workspace, name, "deleted blob");
        Ok(())
    }

    /// Active blobs of `workspace` in name order, after `cursor`.
    pub async fn list(
        &self,
        workspace: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> BlobResult<BlobPage> {
        let limit = limit.clamp(1, MAX_LIST_LIMIT);
        let mut rows = self
            .settings
            .retry
            .run("list blobs", || self.db.list_blobs(workspace, cursor, limit + 1))
            .await?;
        let cursor = if rows.len() > limit {
            rows.truncate(limit);
            rows.last().map(|r| r.name.clone())
        } else {
            None
        };
        Ok(BlobPage {
            blobs: rows.iter().map(BlobMetadata::from).collect(),
            cursor,
        })
    }
}
