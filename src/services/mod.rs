//! Storage engine.
//!
//! [`BlobService`] is the shared state handed to every handler. Its
//! operations are split by concern across `ingest`, `session`, `reconcile`,
//! `retrieve` and `sweep`; the remaining modules are the building blocks
//! those engines are made of.

pub mod bucket;
pub mod cache;
pub mod db;
pub mod error;
pub mod hasher;
pub mod ingest;
pub mod location;
pub mod media;
pub mod range;
pub mod reconcile;
pub mod retrieve;
pub mod retry;
pub mod session;
pub mod signer;
pub mod sweep;

use crate::models::{
    blob::{Blob, ResolvedBlob},
    data::{ContentHash, Data, Location},
};
use bucket::Bucket;
use cache::ResponseCache;
use db::MetadataStore;
use error::{BlobError, BlobResult};
use location::{LocationSelector, Shard};
use media::{MediaProcessor, MediaSource, NoMediaProcessor, is_streaming_media};
use retry::RetryPolicy;
use signer::UrlSigner;
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};
use uuid::Uuid;

const MAX_NAME_LEN: usize = 1024;

/// Tunables for the engine.
#[derive(Clone, Debug)]
pub struct ServiceSettings {
    /// Payloads up to this many bytes are hashed before they are uploaded.
    pub small_blob_threshold: u64,
    pub retry: RetryPolicy,
    /// Unfinished multipart sessions older than this are aborted by the sweep.
    pub multipart_ttl: chrono::Duration,
    /// Unreferenced data rows younger than this survive the sweep.
    pub sweep_grace: chrono::Duration,
    pub sweep_batch: usize,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            small_blob_threshold: 10 * 1024 * 1024,
            retry: RetryPolicy::default(),
            multipart_ttl: chrono::Duration::days(7),
            sweep_grace: chrono::Duration::hours(1),
            sweep_batch: 500,
        }
    }
}

/// Deduplicating blob store: metadata in SQLite, payloads in per-location buckets.
#[derive(Clone)]
pub struct BlobService {
    pub db: MetadataStore,
    locations: LocationSelector,
    signer: UrlSigner,
    cache: ResponseCache,
    media: Arc<dyn MediaProcessor>,
    tasks: TaskTracker,
    settings: ServiceSettings,
}

impl BlobService {
    pub fn new(
        db: MetadataStore,
        locations: LocationSelector,
        signer: UrlSigner,
        cache: ResponseCache,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            db,
            locations,
            signer,
            cache,
            media: Arc::new(NoMediaProcessor),
            tasks: TaskTracker::new(),
            settings,
        }
    }

    /// Attach the media-processing collaborator.
    pub fn with_media(mut self, media: Arc<dyn MediaProcessor>) -> Self {
        self.media = media;
        self
    }

    pub fn locations(&self) -> &LocationSelector {
        &self.locations
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Wait for all deferred work spawned so far.
    pub async fn wait_background(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    fn shard(&self, location: &Location) -> BlobResult<&Shard> {
        self.locations.shard(location).ok_or_else(|| {
            BlobError::Io(std::io::Error::other(format!(
                "no bucket configured for location `{location}`"
            )))
        })
    }

    async fn find_data(&self, hash: &ContentHash, location: &Location) -> BlobResult<Option<Data>> {
        self.settings
            .retry
            .run("get data", || self.db.get_data(hash, location))
            .await
    }

    async fn link(&self, blob: &Blob) -> BlobResult<bool> {
        self.settings
            .retry
            .run("link blob", || self.db.link_blob(blob))
            .await
    }

    /// Record a physical object that is already in `shard`'s bucket.
    ///
    /// Reuses an existing data row for the same content when there is one; in
    /// that case the new object is redundant and is deleted in the background.
    async fn settle_object(
        &self,
        workspace: &str,
        name: &str,
        shard: &Shard,
        data: Data,
    ) -> BlobResult<ResolvedBlob> {
        let blob = Blob::active(workspace, name, data.hash, shard.location.clone());
        let resolved = self.settle_inner(&blob, &data).await?;
        if resolved.filename != data.filename {
            self.spawn_cleanup(shard, data.filename, "duplicate content");
        }
        Ok(resolved)
    }

    async fn settle_inner(&self, blob: &Blob, data: &Data) -> BlobResult<ResolvedBlob> {
        if let Some(existing) = self.find_data(&data.hash, &data.location).await? {
            if self.link(blob).await? {
                debug!(workspace = %blob.workspace, name = %blob.name, hash = %data.hash, "content already stored");
                return Ok(resolved(blob, &existing));
            }
        }

        let inserted = self
            .settings
            .retry
            .run("insert data", || self.db.insert_data_and_blob(data, blob))
            .await?;
        if inserted {
            return Ok(resolved(blob, data));
        }

        // A concurrent upload of the same content inserted first; its row stands.
        let existing = self
            .find_data(&data.hash, &data.location)
            .await?
            .ok_or_else(|| BlobError::not_found(&blob.workspace, &blob.name))?;
        debug!(workspace = %blob.workspace, name = %blob.name, hash = %data.hash, "lost dedup race");
        Ok(resolved(blob, &existing))
    }

    /// Invalidate cached reads and notify the media pipeline after a write.
    fn after_write(&self, stored: &ResolvedBlob) {
        self.cache.invalidate(&stored.workspace, &stored.name);
        if is_streaming_media(&stored.content_type) {
            self.spawn_media_copy(MediaSource {
                workspace: stored.workspace.clone(),
                name: stored.name.clone(),
                location: stored.location.clone(),
                filename: stored.filename.clone(),
                content_type: stored.content_type.clone(),
            });
        }
    }

    /// Delete an object in the background. Failure is logged, never surfaced.
    fn spawn_cleanup(&self, shard: &Shard, key: String, reason: &'static str) {
        let bucket: Arc<dyn Bucket> = shard.bucket.clone();
        let retry = self.settings.retry;
        self.tasks.spawn(async move {
            match retry.run("delete object", || bucket.delete(&key)).await {
                Ok(()) => debug!(bucket = bucket.name(), key = %key, reason, "removed orphan object"),
                Err(err) => {
                    warn!(bucket = bucket.name(), key = %key, reason, error = %err, "failed to remove orphan object")
                }
            }
        });
    }

    fn spawn_media_copy(&self, source: MediaSource) {
        let media = self.media.clone();
        self.tasks.spawn(async move {
            let (workspace, name) = (source.workspace.clone(), source.name.clone());
            if let Err(err) = media.copy(source).await {
                warn!(workspace = %workspace, name = %name, error = %err, "media copy failed");
            }
        });
    }

    fn spawn_media_delete(&self, workspace: &str, name: &str) {
        let media = self.media.clone();
        let (workspace, name) = (workspace.to_string(), name.to_string());
        self.tasks.spawn(async move {
            if let Err(err) = media.delete_derived(&workspace, &name).await {
                warn!(workspace = %workspace, name = %name, error = %err, "failed to delete derived media");
            }
        });
    }
}

fn resolved(blob: &Blob, data: &Data) -> ResolvedBlob {
    ResolvedBlob {
        workspace: blob.workspace.clone(),
        name: blob.name.clone(),
        hash: data.hash,
        location: data.location.clone(),
        filename: data.filename.clone(),
        content_type: data.content_type.clone(),
        size: data.size,
    }
}

/// Fresh opaque object key, unrelated to the blob name.
fn new_object_key() -> String {
    Uuid::new_v4().to_string()
}

fn ensure_target(workspace: &str, name: &str) -> BlobResult<()> {
    if workspace.trim().is_empty() {
        return Err(BlobError::bad_request("missing workspace"));
    }
    if name.trim().is_empty() {
        return Err(BlobError::bad_request("missing blob name"));
    }
    if name.len() > MAX_NAME_LEN || name.chars().any(char::is_control) {
        return Err(BlobError::bad_request(format!("invalid blob name `{name}`")));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::services::{bucket::DiskBucket, db::memory_store};
    use std::time::Duration;

    pub struct Harness {
        pub service: BlobService,
        pub dir: tempfile::TempDir,
    }

    impl Harness {
        pub fn bucket(&self, workspace: &str) -> Arc<dyn Bucket> {
            self.service.locations().select(workspace).bucket.clone()
        }

        pub async fn data_rows(&self) -> i64 {
            sqlx::query_scalar("SELECT COUNT(*) FROM data")
                .fetch_one(&*self.service.db.db)
                .await
                .unwrap()
        }

        pub async fn blob_rows(&self) -> i64 {
            sqlx::query_scalar("SELECT COUNT(*) FROM blob")
                .fetch_one(&*self.service.db.db)
                .await
                .unwrap()
        }

        /// Payload files across every bucket, excluding sidecars and staging.
        pub fn object_files(&self) -> usize {
            fn walk(dir: &std::path::Path, count: &mut usize) {
                let Ok(entries) = std::fs::read_dir(dir) else {
                    return;
                };
                for entry in entries.flatten() {
                    let path = entry.path();
                    let name = entry.file_name().to_string_lossy().to_string();
                    if name.starts_with('.') {
                        continue;
                    }
                    if path.is_dir() {
                        walk(&path, count);
                    } else if !name.ends_with(".meta") {
                        *count += 1;
                    }
                }
            }
            let mut count = 0;
            walk(self.dir.path(), &mut count);
            count
        }
    }

    pub async fn harness_with(locations: &[&str], settings: ServiceSettings) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut shards = Vec::new();
        for name in locations {
            let bucket = DiskBucket::open(format!("datalake-{name}"), dir.path().join(name))
                .await
                .unwrap();
            shards.push(Shard {
                location: Location::new(*name),
                bucket: Arc::new(bucket),
            });
        }
        let service = BlobService::new(
            memory_store().await,
            LocationSelector::new(shards).unwrap(),
            UrlSigner::new("test-secret", "http://localhost:3000", chrono::Duration::minutes(5)),
            ResponseCache::new(16, 4096),
            settings,
        );
        Harness { service, dir }
    }

    pub fn small_settings(threshold: u64) -> ServiceSettings {
        ServiceSettings {
            small_blob_threshold: threshold,
            retry: RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            ..ServiceSettings::default()
        }
    }

    pub async fn harness() -> Harness {
        harness_with(&["weur"], small_settings(64)).await
    }
}
