//! Content-addressed ingestion.
//!
//! Payloads whose declared size fits under the small-blob threshold are hashed
//! in full before anything is uploaded, so duplicates never reach the bucket.
//! Larger or unsized payloads are uploaded under a fresh key while the hash is
//! computed from the same stream; if the content turns out to exist already,
//! the fresh object is deleted after the blob has been pointed at the old one.

use super::{
    BlobService, ensure_target, resolved,
    bucket::PutOptions,
    error::BlobResult,
    hasher::{TEE_BUFFER_CHUNKS, collect_bounded, hash_stream, tee},
    location::Shard,
    new_object_key,
};
use crate::models::{
    blob::{Blob, BlobMetadata, ResolvedBlob},
    data::Data,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, stream};
use std::io;
use tracing::{debug, info};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

fn content_type_or_default(content_type: &str) -> String {
    let content_type = content_type.trim();
    if content_type.is_empty() {
        DEFAULT_CONTENT_TYPE.to_string()
    } else {
        content_type.to_string()
    }
}

impl BlobService {
    /// Store a streamed payload under `workspace/name`.
    ///
    /// `declared_size` picks the ingestion path; `None` is treated as large.
    pub async fn ingest<'a, S>(
        &self,
        workspace: &str,
        name: &str,
        body: S,
        declared_size: Option<u64>,
        content_type: &str,
        last_modified: Option<DateTime<Utc>>,
    ) -> BlobResult<BlobMetadata>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'a,
    {
        ensure_target(workspace, name)?;
        let shard = self.locations.select(workspace);
        let options = PutOptions {
            content_type: content_type_or_default(content_type),
            last_modified,
            if_absent: false,
        };

        let threshold = self.settings.small_blob_threshold;
        let stored = match declared_size {
            Some(size) if size <= threshold => {
                self.ingest_small(workspace, name, shard, body, size, options)
                    .await?
            }
            _ => self.ingest_large(workspace, name, shard, body, options).await?,
        };

        self.after_write(&stored);
        info!(
            workspace,
            name,
            hash = %stored.hash,
            location = %stored.location,
            size = stored.size,
            "stored blob"
        );
        Ok(BlobMetadata::from(&stored))
    }

    /// Store an in-memory payload. Convenience over [`BlobService::ingest`].
    pub async fn put_blob(
        &self,
        workspace: &str,
        name: &str,
        payload: Bytes,
        content_type: &str,
    ) -> BlobResult<BlobMetadata> {
        let size = payload.len() as u64;
        let body = stream::once(async move { Ok::<Bytes, io::Error>(payload) });
        self.ingest(workspace, name, body, Some(size), content_type, None)
            .await
    }

    async fn ingest_small<'a, S>(
        &self,
        workspace: &str,
        name: &str,
        shard: &Shard,
        body: S,
        limit: u64,
        options: PutOptions,
    ) -> BlobResult<ResolvedBlob>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'a,
    {
        let (driver, hash_branch, body_branch) = tee(body, TEE_BUFFER_CHUNKS);
        let (_, digest, payload) = tokio::join!(
            driver,
            hash_stream(hash_branch),
            collect_bounded(body_branch, limit)
        );
        let payload = payload?;
        let digest = digest?;

        let blob = Blob::active(workspace, name, digest.hash, shard.location.clone());
        if let Some(existing) = self.find_data(&digest.hash, &shard.location).await? {
            if self.link(&blob).await? {
                debug!(workspace, name, hash = %digest.hash, "content already stored, skipped upload");
                return Ok(resolved(&blob, &existing));
            }
        }

        let filename = new_object_key();
        let content_type = options.content_type.clone();
        shard
            .bucket
            .put(
                &filename,
                Box::pin(stream::iter([Ok::<Bytes, io::Error>(payload)])),
                options,
            )
            .await?;

        let data = Data {
            hash: digest.hash,
            location: shard.location.clone(),
            filename,
            content_type,
            size: digest.size as i64,
            created_at: Utc::now(),
        };
        self.settle_uploaded(workspace, name, shard, data).await
    }

    async fn ingest_large<'a, S>(
        &self,
        workspace: &str,
        name: &str,
        shard: &Shard,
        body: S,
        options: PutOptions,
    ) -> BlobResult<ResolvedBlob>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'a,
    {
        let filename = new_object_key();
        let content_type = options.content_type.clone();
        let (driver, hash_branch, upload_branch) = tee(body, TEE_BUFFER_CHUNKS);
        let (_, digest, put) = tokio::join!(
            driver,
            hash_stream(hash_branch),
            shard.bucket.put(&filename, upload_branch, options)
        );
        let digest = match (digest, put) {
            (Ok(digest), Ok(_)) => digest,
            (Err(err), Ok(_)) => {
                self.spawn_cleanup(shard, filename, "incomplete upload");
                return Err(err.into());
            }
            (_, Err(err)) => return Err(err),
        };

        let data = Data {
            hash: digest.hash,
            location: shard.location.clone(),
            filename,
            content_type,
            size: digest.size as i64,
            created_at: Utc::now(),
        };
        self.settle_uploaded(workspace, name, shard, data).await
    }

    /// Record a freshly uploaded object; on failure the object is an orphan
    /// nobody will ever reference, so it is removed.
    async fn settle_uploaded(
        &self,
        workspace: &str,
        name: &str,
        shard: &Shard,
        data: Data,
    ) -> BlobResult<ResolvedBlob> {
        let filename = data.filename.clone();
        match self.settle_object(workspace, name, shard, data).await {
            Ok(stored) => Ok(stored),
            Err(err) => {
                self.spawn_cleanup(shard, filename, "metadata write failed");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        error::{BlobError, BlobResult},
        media::{MediaProcessor, MediaSource},
        testing::{harness, harness_with, small_settings},
    };
    use async_trait::async_trait;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    fn chunked(payload: &[u8], chunk: usize) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        let parts: Vec<io::Result<Bytes>> = payload
            .chunks(chunk)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        stream::iter(parts)
    }

    #[tokio::test]
    async fn identical_content_is_stored_once() {
        let h = harness().await;
        let svc = &h.service;

        let a = svc
            .put_blob("ws", "a.txt", Bytes::from_static(b"hello-huly"), "text/plain")
            .await
            .unwrap();
        let b = svc
            .put_blob("ws", "b.txt", Bytes::from_static(b"hello-huly"), "text/plain")
            .await
            .unwrap();
        svc.wait_background().await;

        assert_eq!(a.etag, b.etag);
        assert_eq!(a.size, 10);
        assert_eq!(b.name, "b.txt");
        assert_eq!(b.content_type, "text/plain");
        assert_eq!(h.data_rows().await, 1);
        assert_eq!(h.blob_rows().await, 2);
        assert_eq!(h.object_files(), 1);
    }

    #[tokio::test]
    async fn small_and_large_paths_agree_at_threshold() {
        let h = harness().await;
        let svc = &h.service;
        let at = vec![b'x'; 64];
        let over = vec![b'y'; 65];

        for (name, payload) in [("at-1", &at), ("at-2", &at), ("over-1", &over), ("over-2", &over)] {
            let size = payload.len() as u64;
            svc.ingest("ws", name, chunked(payload, 7), Some(size), "", None)
                .await
                .unwrap();
        }
        // Unsized payloads always take the large path.
        svc.ingest("ws", "at-unsized", chunked(&at, 64), None, "", None)
            .await
            .unwrap();
        svc.wait_background().await;

        assert_eq!(h.data_rows().await, 2);
        assert_eq!(h.object_files(), 2);
        let unsized_path = svc.head("ws", "at-unsized").await.unwrap();
        let sized = svc.head("ws", "at-1").await.unwrap();
        assert_eq!(unsized_path.hash, sized.hash);
        assert_eq!(sized.content_type, "application/octet-stream");
    }

    #[tokio::test]
    async fn concurrent_identical_uploads_leave_one_object() {
        let h = harness().await;
        let svc = &h.service;
        let payload = vec![7u8; 1000];

        let uploads = (0..4).map(|i| {
            let name = format!("copy-{i}");
            let body = chunked(&payload, 100);
            async move { svc.ingest("ws", &name, body, None, "application/zip", None).await }
        });
        let results = futures::future::join_all(uploads).await;
        svc.wait_background().await;

        let etags: Vec<_> = results.into_iter().map(|r| r.unwrap().etag).collect();
        assert!(etags.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(h.data_rows().await, 1);
        assert_eq!(h.blob_rows().await, 4);
        assert_eq!(h.object_files(), 1);
    }

    #[tokio::test]
    async fn concurrent_identical_small_uploads_leave_one_object() {
        let h = harness().await;
        let svc = &h.service;
        let payload = vec![3u8; 50];

        let uploads = (0..4).map(|i| {
            let name = format!("small-{i}");
            let body = chunked(&payload, 10);
            let size = payload.len() as u64;
            async move { svc.ingest("ws", &name, body, Some(size), "text/plain", None).await }
        });
        let results = futures::future::join_all(uploads).await;
        svc.wait_background().await;

        let etags: Vec<_> = results.into_iter().map(|r| r.unwrap().etag).collect();
        assert!(etags.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(h.data_rows().await, 1);
        assert_eq!(h.blob_rows().await, 4);
        assert_eq!(h.object_files(), 1);
        for i in 0..4 {
            let name = format!("small-{i}");
            assert_eq!(svc.get_blob("ws", &name).await.unwrap(), Bytes::from(payload.clone()));
        }
    }

    #[tokio::test]
    async fn reupload_repoints_the_name() {
        let h = harness().await;
        let svc = &h.service;
        svc.put_blob("ws", "n", Bytes::from_static(b"one"), "text/plain")
            .await
            .unwrap();
        let second = svc
            .put_blob("ws", "n", Bytes::from_static(b"two"), "text/plain")
            .await
            .unwrap();

        assert_eq!(svc.get_blob("ws", "n").await.unwrap(), Bytes::from_static(b"two"));
        assert_eq!(svc.head("ws", "n").await.unwrap().hash.to_string(), second.etag);
        assert_eq!(h.data_rows().await, 2);
    }

    #[tokio::test]
    async fn failed_stream_leaves_nothing_behind() {
        let h = harness_with(&["weur"], small_settings(4)).await;
        let svc = &h.service;
        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"partial payload")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away")),
        ]);

        let err = svc
            .ingest("ws", "broken", body, None, "text/plain", None)
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::Io(_)));
        svc.wait_background().await;

        assert_eq!(h.blob_rows().await, 0);
        assert_eq!(h.data_rows().await, 0);
        assert_eq!(h.object_files(), 0);
    }

    #[tokio::test]
    async fn small_payload_larger_than_declared_is_rejected() {
        let h = harness_with(&["weur"], small_settings(4)).await;
        let err = h
            .service
            .ingest("ws", "liar", chunked(b"too long", 3), Some(2), "", None)
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::BadRequest(_)));

        // Still under the threshold, but longer than what was declared.
        let err = h
            .service
            .ingest("ws", "liar", chunked(b"abc", 3), Some(2), "", None)
            .await
            .unwrap_err();
        assert!(matches!(&err, BlobError::BadRequest(msg) if msg.contains("larger than 2 bytes")));
        assert_eq!(h.object_files(), 0);
        assert_eq!(h.blob_rows().await, 0);
    }

    #[tokio::test]
    async fn rejects_missing_names() {
        let h = harness().await;
        for (ws, name) in [("", "n"), ("ws", ""), ("ws", "a\u{7}b")] {
            let err = h
                .service
                .put_blob(ws, name, Bytes::from_static(b"x"), "")
                .await
                .unwrap_err();
            assert!(matches!(err, BlobError::BadRequest(_)));
        }
    }

    struct FailingMedia {
        copies: AtomicUsize,
    }

    #[async_trait]
    impl MediaProcessor for FailingMedia {
        async fn copy(&self, _source: MediaSource) -> BlobResult<()> {
            self.copies.fetch_add(1, Ordering::SeqCst);
            Err(BlobError::Io(io::Error::other("transcoder unavailable")))
        }

        async fn delete_derived(&self, _workspace: &str, _name: &str) -> BlobResult<()> {
            Err(BlobError::Io(io::Error::other("transcoder unavailable")))
        }
    }

    #[tokio::test]
    async fn media_failures_do_not_fail_ingestion() {
        let h = harness().await;
        let media = Arc::new(FailingMedia {
            copies: AtomicUsize::new(0),
        });
        let svc = h.service.clone().with_media(media.clone());

        svc.put_blob("ws", "clip.mp4", Bytes::from_static(b"frames"), "video/mp4")
            .await
            .unwrap();
        svc.put_blob("ws", "note.txt", Bytes::from_static(b"words"), "text/plain")
            .await
            .unwrap();
        svc.delete("ws", "clip.mp4").await.unwrap();
        svc.wait_background().await;

        assert_eq!(media.copies.load(Ordering::SeqCst), 1);
        assert!(svc.get_blob("ws", "note.txt").await.is_ok());
    }

    #[tokio::test]
    async fn large_path_streams_many_chunks() {
        let h = harness().await;
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let meta = h
            .service
            .ingest("ws", "big.bin", chunked(&payload, 333), Some(10_000), "", None)
            .await
            .unwrap();
        assert_eq!(meta.size, 10_000);
        let content = h.service.get("ws", "big.bin", None).await.unwrap();
        let body = content.into_bytes().await.unwrap();
        assert_eq!(&body[..], &payload[..]);
    }
}
