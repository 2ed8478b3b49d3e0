//! Turning objects written outside the ingestion path into blobs.
//!
//! Signed and multipart uploads land in the bucket without passing through
//! the hasher. The reconciler takes the content hash from the bucket's
//! SHA-256 checksum when there is one and otherwise hashes the object by
//! reading it back, then records it exactly like a large-path ingestion.

use super::{
    BlobService,
    error::{BlobError, BlobResult},
    hasher::{hash_from_checksum, hash_stream},
    location::Shard,
};
use crate::models::{
    blob::{BlobMetadata, ResolvedBlob},
    data::{ContentHash, Data},
};
use chrono::Utc;
use tracing::{debug, info};

impl BlobService {
    /// Record the object at `key` in `workspace`'s location as `workspace/name`.
    ///
    /// Safe to repeat: completing an already-recorded object leaves it in place.
    pub async fn reconcile(&self, workspace: &str, name: &str, key: &str) -> BlobResult<BlobMetadata> {
        let shard = self.locations.select(workspace);
        let stored = self.reconcile_at(workspace, name, shard, key).await?;
        Ok(BlobMetadata::from(&stored))
    }

    pub(crate) async fn reconcile_at(
        &self,
        workspace: &str,
        name: &str,
        shard: &Shard,
        key: &str,
    ) -> BlobResult<ResolvedBlob> {
        let head = self
            .settings
            .retry
            .run("head object", || shard.bucket.head(key))
            .await?
            .ok_or_else(|| BlobError::ObjectNotFound(key.to_string()))?;

        let (hash, size) = match head.checksum_sha256.as_deref().and_then(hash_from_checksum) {
            Some(hash) => (hash, head.size),
            None => self.rehash_object(shard, key).await?,
        };

        let data = Data {
            hash,
            location: shard.location.clone(),
            filename: key.to_string(),
            content_type: head.content_type,
            size: size as i64,
            created_at: Utc::now(),
        };
        let stored = self.settle_object(workspace, name, shard, data).await?;
        self.after_write(&stored);
        info!(
            workspace,
            name,
            key,
            hash = %stored.hash,
            deduplicated = stored.filename != key,
            "reconciled object"
        );
        Ok(stored)
    }

    async fn rehash_object(&self, shard: &Shard, key: &str) -> BlobResult<(ContentHash, u64)> {
        debug!(bucket = shard.bucket.name(), key, "no checksum recorded, hashing object");
        let object = shard
            .bucket
            .get(key, None)
            .await?
            .ok_or_else(|| BlobError::ObjectNotFound(key.to_string()))?;
        let digest = hash_stream(object.stream).await?;
        Ok((digest.hash, digest.size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        bucket::{PutOptions, body},
        hasher::Hasher,
        testing::harness,
    };
    use bytes::Bytes;

    #[tokio::test]
    async fn uses_bucket_checksum() {
        let h = harness().await;
        let bucket = h.bucket("ws");
        bucket
            .put("direct-key", body("signed bytes"), PutOptions::new("text/plain"))
            .await
            .unwrap();

        let meta = h.service.reconcile("ws", "doc.txt", "direct-key").await.unwrap();

        let mut hasher = Hasher::new();
        hasher.update(b"signed bytes");
        assert_eq!(meta.etag, hasher.finish().hash.to_string());
        assert_eq!(meta.size, 12);
        assert_eq!(meta.content_type, "text/plain");
        assert_eq!(
            h.service.get_blob("ws", "doc.txt").await.unwrap(),
            Bytes::from_static(b"signed bytes")
        );
    }

    #[tokio::test]
    async fn hashes_objects_without_checksum() {
        let h = harness().await;
        let bucket = h.bucket("ws");
        // Assembled multipart objects carry no whole-object checksum.
        let upload_id = bucket.create_multipart("mp-key", "text/plain").await.unwrap();
        let part = bucket
            .upload_part("mp-key", &upload_id, 1, body("hello-huly"))
            .await
            .unwrap();
        let head = bucket
            .complete_multipart("mp-key", &upload_id, &[part])
            .await
            .unwrap();
        assert!(head.checksum_sha256.is_none());

        let direct = h
            .service
            .put_blob("ws", "direct.txt", Bytes::from_static(b"hello-huly"), "text/plain")
            .await
            .unwrap();
        let reconciled = h.service.reconcile("ws", "mp.txt", "mp-key").await.unwrap();
        h.service.wait_background().await;

        // Same content, same hash: the multipart object was a duplicate.
        assert_eq!(reconciled.etag, direct.etag);
        assert_eq!(h.data_rows().await, 1);
        assert!(bucket.head("mp-key").await.unwrap().is_none());
        assert_eq!(
            h.service.get_blob("ws", "mp.txt").await.unwrap(),
            Bytes::from_static(b"hello-huly")
        );
    }

    #[tokio::test]
    async fn repeated_reconcile_keeps_the_object() {
        let h = harness().await;
        let bucket = h.bucket("ws");
        bucket
            .put("k", body("payload"), PutOptions::new("application/pdf"))
            .await
            .unwrap();

        let first = h.service.reconcile("ws", "a.pdf", "k").await.unwrap();
        let second = h.service.reconcile("ws", "a.pdf", "k").await.unwrap();
        h.service.wait_background().await;

        assert_eq!(first, second);
        assert!(bucket.head("k").await.unwrap().is_some());
        assert_eq!(h.data_rows().await, 1);
    }

    #[tokio::test]
    async fn missing_object_is_reported() {
        let h = harness().await;
        let err = h.service.reconcile("ws", "n", "nope").await.unwrap_err();
        assert!(matches!(err, BlobError::ObjectNotFound(_)));
        assert_eq!(h.blob_rows().await, 0);
    }
}
