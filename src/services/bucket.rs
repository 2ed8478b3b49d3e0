//! src/services/bucket.rs
//!
//! Object store adapter. [`Bucket`] is the per-location object store seen by
//! the rest of the engine: streamed put/get/head/delete with byte ranges and
//! bucket-native multipart uploads. [`DiskBucket`] implements it on local
//! disk, sharding payloads beneath `root/{shard}/{shard}/{key}` and keeping a
//! JSON sidecar with the object's head metadata next to each payload.

use super::error::{BlobError, BlobResult};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use md5::Context;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{
    io::{self, ErrorKind, SeekFrom},
    path::{Path, PathBuf},
    pin::Pin,
};
use tokio::{
    fs::{self, File},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

/// Boxed byte stream used for every payload crossing a bucket boundary.
pub type ByteStream<'a> = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + 'a>>;

const MAX_OBJECT_KEY_LEN: usize = 1024;
const MULTIPART_DIR: &str = ".multipart";
const UPLOAD_MANIFEST: &str = "upload.json";
const SIDECAR_SUFFIX: &str = ".meta";

/// Head metadata of a stored object.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ObjectHead {
    pub size: u64,
    pub content_type: String,
    /// Bucket-native entity tag (MD5 of the payload).
    pub etag: String,
    /// Base64 SHA-256 of the full payload, when the bucket recorded one.
    pub checksum_sha256: Option<String>,
    pub last_modified: DateTime<Utc>,
}

/// Options for a streamed put.
#[derive(Clone, Debug)]
pub struct PutOptions {
    pub content_type: String,
    /// Client-supplied modification time; defaults to the time of the write.
    pub last_modified: Option<DateTime<Utc>>,
    /// Fail with [`BlobError::AlreadyExists`] rather than replace an object.
    pub if_absent: bool,
}

impl PutOptions {
    pub fn new(content_type: impl Into<String>) -> Self {
        Self {
            content_type: content_type.into(),
            last_modified: None,
            if_absent: false,
        }
    }

    pub fn if_absent(mut self) -> Self {
        self.if_absent = true;
        self
    }
}

/// Inclusive byte range, already validated against the object size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// A streamed object body.
pub struct ObjectBody {
    pub head: ObjectHead,
    pub range: Option<ByteRange>,
    pub stream: ByteStream<'static>,
}

/// One uploaded part of a multipart upload.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// Per-location object store.
#[async_trait]
pub trait Bucket: Send + Sync {
    /// Bucket name, for logs.
    fn name(&self) -> &str;

    /// Stream a payload into `key`, replacing any previous object.
    async fn put<'a>(
        &self,
        key: &str,
        body: ByteStream<'a>,
        options: PutOptions,
    ) -> BlobResult<ObjectHead>;

    /// Open `key` for reading. `None` when the object does not exist.
    async fn get(&self, key: &str, range: Option<ByteRange>) -> BlobResult<Option<ObjectBody>>;

    /// Read head metadata. `None` when the object does not exist.
    async fn head(&self, key: &str) -> BlobResult<Option<ObjectHead>>;

    /// Remove `key`. Deleting a missing object succeeds.
    async fn delete(&self, key: &str) -> BlobResult<()>;

    /// Open a multipart upload for `key` and return its upload id.
    async fn create_multipart(&self, key: &str, content_type: &str) -> BlobResult<String>;

    /// Store one part. Parts may arrive in any order.
    async fn upload_part<'a>(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: ByteStream<'a>,
    ) -> BlobResult<CompletedPart>;

    /// Assemble the listed parts, in part-number order, into `key`.
    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> BlobResult<ObjectHead>;

    /// Release a multipart upload and its parts.
    async fn abort_multipart(&self, key: &str, upload_id: &str) -> BlobResult<()>;

    /// Cheap write/read/delete probe for readiness checks.
    async fn check_health(&self) -> BlobResult<()>;
}

#[derive(Serialize, Deserialize)]
struct UploadManifest {
    key: String,
    content_type: String,
}

/// Local-disk bucket.
pub struct DiskBucket {
    name: String,
    root: PathBuf,
}

impl DiskBucket {
    /// Open a bucket rooted at `root`, creating the directory if needed.
    pub async fn open(name: impl Into<String>, root: impl Into<PathBuf>) -> BlobResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            name: name.into(),
            root,
        })
    }

    /// Reject keys that could escape the bucket root.
    fn ensure_key_safe(key: &str) -> BlobResult<()> {
        if key.is_empty()
            || key.len() > MAX_OBJECT_KEY_LEN
            || key.starts_with('/')
            || key.starts_with('.')
            || key.contains("..")
            || key.ends_with(SIDECAR_SUFFIX)
        {
            return Err(BlobError::bad_request(format!("invalid object key `{key}`")));
        }
        if key
            .bytes()
            .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
        {
            return Err(BlobError::bad_request(format!("invalid object key `{key}`")));
        }
        Ok(())
    }

    /// Upload ids are generated here as simple UUIDs; anything else is unknown.
    fn ensure_upload_id_safe(upload_id: &str) -> BlobResult<()> {
        if upload_id.is_empty() || !upload_id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(BlobError::UploadNotFound(upload_id.to_string()));
        }
        Ok(())
    }

    /// Two-level shard directories from MD5(key), reducing entries per directory.
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.root.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    fn sidecar_path(object_path: &Path) -> PathBuf {
        let mut name = object_path.as_os_str().to_owned();
        name.push(SIDECAR_SUFFIX);
        PathBuf::from(name)
    }

    fn upload_dir(&self, upload_id: &str) -> PathBuf {
        self.root.join(MULTIPART_DIR).join(upload_id)
    }

    fn part_path(&self, upload_id: &str, part_number: u32) -> PathBuf {
        self.upload_dir(upload_id)
            .join(format!("part-{part_number:05}"))
    }

    /// Write `bytes` to `path` through a temp file and rename.
    async fn write_atomic(path: &Path, bytes: &[u8]) -> BlobResult<()> {
        let parent = parent_dir(path)?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        if let Err(err) = fs::write(&tmp_path, bytes).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        if let Err(err) = fs::rename(&tmp_path, path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        Ok(())
    }

    /// Move a finished temp file into place and record its sidecar.
    ///
    /// With `if_absent` the payload is hard-linked into place, which fails
    /// atomically when `key` already exists.
    async fn publish(
        &self,
        tmp_path: &Path,
        key: &str,
        head: &ObjectHead,
        if_absent: bool,
    ) -> BlobResult<()> {
        let file_path = self.object_path(key);
        let placed = if if_absent {
            fs::hard_link(tmp_path, &file_path).await
        } else {
            fs::rename(tmp_path, &file_path).await
        };
        if if_absent || placed.is_err() {
            let _ = fs::remove_file(tmp_path).await;
        }
        match placed {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(BlobError::AlreadyExists(key.to_string()));
            }
            Err(err) => return Err(err.into()),
        }
        let sidecar = serde_json::to_vec(head)?;
        if let Err(err) = Self::write_atomic(&Self::sidecar_path(&file_path), &sidecar).await {
            let _ = fs::remove_file(&file_path).await;
            return Err(err);
        }
        Ok(())
    }

    async fn read_head(&self, file_path: &Path) -> BlobResult<Option<ObjectHead>> {
        let meta = match fs::metadata(file_path).await {
            Ok(meta) => meta,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        match fs::read(Self::sidecar_path(file_path)).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                // Payload without sidecar: report what the filesystem knows.
                let last_modified = meta
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());
                Ok(Some(ObjectHead {
                    size: meta.len(),
                    content_type: "application/octet-stream".into(),
                    etag: String::new(),
                    checksum_sha256: None,
                    last_modified,
                }))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Stream `body` into a fresh temp file next to `dest`, returning the
    /// temp path, byte count, MD5 context and SHA-256 state.
    async fn spool<'a>(
        dest: &Path,
        mut body: ByteStream<'a>,
    ) -> BlobResult<(PathBuf, u64, Context, Sha256)> {
        let parent = parent_dir(dest)?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = create_file(&tmp_path).await?;

        let mut size: u64 = 0;
        let mut md5 = Context::new();
        let mut sha = Sha256::new();
        while let Some(chunk_res) = body.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(BlobError::Io(err));
                }
            };
            size += chunk.len() as u64;
            md5.consume(&chunk);
            sha.update(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(BlobError::Io(err));
            }
        }
        if let Err(err) = flush_durable(&mut file).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(BlobError::Io(err));
        }
        Ok((tmp_path, size, md5, sha))
    }

    /// Recursively remove empty directories up to the bucket root.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.root) && current != self.root {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }

    async fn read_manifest(&self, upload_id: &str) -> BlobResult<UploadManifest> {
        Self::ensure_upload_id_safe(upload_id)?;
        let path = self.upload_dir(upload_id).join(UPLOAD_MANIFEST);
        match fs::read(&path).await {
            Ok(raw) => Ok(serde_json::from_slice(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(BlobError::UploadNotFound(upload_id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl Bucket for DiskBucket {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put<'a>(
        &self,
        key: &str,
        body: ByteStream<'a>,
        options: PutOptions,
    ) -> BlobResult<ObjectHead> {
        Self::ensure_key_safe(key)?;
        let file_path = self.object_path(key);
        let (tmp_path, size, md5, sha) = Self::spool(&file_path, body).await?;

        let sha256: [u8; 32] = sha.finalize().into();
        let if_absent = options.if_absent;
        let head = ObjectHead {
            size,
            content_type: options.content_type,
            etag: format!("{:x}", md5.compute()),
            checksum_sha256: Some(general_purpose::STANDARD.encode(sha256)),
            last_modified: options.last_modified.unwrap_or_else(Utc::now),
        };
        self.publish(&tmp_path, key, &head, if_absent).await?;
        debug!(bucket = %self.name, key, size, "stored object");
        Ok(head)
    }

    async fn get(&self, key: &str, range: Option<ByteRange>) -> BlobResult<Option<ObjectBody>> {
        Self::ensure_key_safe(key)?;
        let file_path = self.object_path(key);
        let Some(head) = self.read_head(&file_path).await? else {
            return Ok(None);
        };
        let mut file = match File::open(&file_path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let stream: ByteStream<'static> = match range {
            Some(range) => {
                if range.end >= head.size || range.start > range.end {
                    return Err(BlobError::RangeNotSatisfiable { size: head.size });
                }
                file.seek(SeekFrom::Start(range.start)).await?;
                Box::pin(ReaderStream::new(file.take(range.len())))
            }
            None => Box::pin(ReaderStream::new(file)),
        };

        Ok(Some(ObjectBody {
            head,
            range,
            stream,
        }))
    }

    async fn head(&self, key: &str) -> BlobResult<Option<ObjectHead>> {
        Self::ensure_key_safe(key)?;
        self.read_head(&self.object_path(key)).await
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        Self::ensure_key_safe(key)?;
        let file_path = self.object_path(key);
        for path in [Self::sidecar_path(&file_path), file_path.clone()] {
            match fs::remove_file(&path).await {
                Ok(_) => debug!("removed {}", path.display()),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        if let Some(parent) = file_path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    async fn create_multipart(&self, key: &str, content_type: &str) -> BlobResult<String> {
        Self::ensure_key_safe(key)?;
        let upload_id = Uuid::new_v4().simple().to_string();
        let dir = self.upload_dir(&upload_id);
        fs::create_dir_all(&dir).await?;
        let manifest = UploadManifest {
            key: key.to_string(),
            content_type: content_type.to_string(),
        };
        Self::write_atomic(&dir.join(UPLOAD_MANIFEST), &serde_json::to_vec(&manifest)?).await?;
        debug!(bucket = %self.name, key, upload_id, "opened multipart upload");
        Ok(upload_id)
    }

    async fn upload_part<'a>(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: ByteStream<'a>,
    ) -> BlobResult<CompletedPart> {
        let manifest = self.read_manifest(upload_id).await?;
        if manifest.key != key {
            return Err(BlobError::UploadNotFound(upload_id.to_string()));
        }
        let part_path = self.part_path(upload_id, part_number);
        let (tmp_path, _, md5, _) = Self::spool(&part_path, body).await?;
        if let Err(err) = fs::rename(&tmp_path, &part_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        Ok(CompletedPart {
            part_number,
            etag: format!("{:x}", md5.compute()),
        })
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> BlobResult<ObjectHead> {
        let manifest = self.read_manifest(upload_id).await?;
        if manifest.key != key {
            return Err(BlobError::UploadNotFound(upload_id.to_string()));
        }
        if parts.is_empty() {
            return Err(BlobError::bad_request("multipart upload has no parts"));
        }
        let mut ordered = parts.to_vec();
        ordered.sort_by_key(|p| p.part_number);
        if ordered.windows(2).any(|w| w[0].part_number == w[1].part_number) {
            return Err(BlobError::bad_request("duplicate part number"));
        }

        let file_path = self.object_path(key);
        let tmp_path = parent_dir(&file_path)?.join(format!(".tmp-{}", Uuid::new_v4()));
        let assembled = assemble_parts(self, upload_id, &ordered, &tmp_path).await;
        let (size, md5) = match assembled {
            Ok(done) => done,
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        };

        // Multipart objects carry no full-object checksum, only an etag.
        let head = ObjectHead {
            size,
            content_type: manifest.content_type,
            etag: format!("{:x}", md5.compute()),
            checksum_sha256: None,
            last_modified: Utc::now(),
        };
        self.publish(&tmp_path, key, &head, false).await?;
        if let Err(err) = fs::remove_dir_all(self.upload_dir(upload_id)).await {
            debug!(upload_id, "failed to remove multipart staging: {}", err);
        }
        Ok(head)
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> BlobResult<()> {
        let manifest = match self.read_manifest(upload_id).await {
            Ok(manifest) => manifest,
            Err(BlobError::UploadNotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        if manifest.key != key {
            return Err(BlobError::UploadNotFound(upload_id.to_string()));
        }
        match fs::remove_dir_all(self.upload_dir(upload_id)).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn check_health(&self) -> BlobResult<()> {
        let tmp_path = self.root.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&tmp_path, b"readyz").await?;
        let read = fs::read(&tmp_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        if read? != b"readyz" {
            return Err(BlobError::Io(io::Error::other("probe content mismatch")));
        }
        Ok(())
    }
}

/// Concatenate verified parts into `dest`.
async fn assemble_parts(
    bucket: &DiskBucket,
    upload_id: &str,
    parts: &[CompletedPart],
    dest: &Path,
) -> BlobResult<(u64, Context)> {
    let mut out = create_file(dest).await?;
    let mut whole = Context::new();
    let mut size = 0u64;
    let mut buf = vec![0u8; 64 * 1024];
    for part in parts {
        let path = bucket.part_path(upload_id, part.part_number);
        let mut file = match File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(BlobError::bad_request(format!(
                    "part {} was never uploaded",
                    part.part_number
                )));
            }
            Err(err) => return Err(err.into()),
        };
        let mut part_md5 = Context::new();
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            part_md5.consume(&buf[..n]);
            whole.consume(&buf[..n]);
            out.write_all(&buf[..n]).await?;
            size += n as u64;
        }
        let etag = format!("{:x}", part_md5.compute());
        if etag != part.etag.trim_matches('"') {
            return Err(BlobError::bad_request(format!(
                "etag mismatch for part {}",
                part.part_number
            )));
        }
    }
    flush_durable(&mut out).await?;
    Ok((size, whole))
}

/// Create `path` and its parent directories. Retries once if a concurrent
/// prune removed the freshly created parent.
async fn create_file(path: &Path) -> io::Result<File> {
    let parent = path.parent().unwrap_or(path);
    fs::create_dir_all(parent).await?;
    match File::create(path).await {
        Err(err) if err.kind() == ErrorKind::NotFound => {
            fs::create_dir_all(parent).await?;
            File::create(path).await
        }
        other => other,
    }
}

async fn flush_durable(file: &mut File) -> io::Result<()> {
    file.flush().await?;
    file.sync_all().await
}

fn parent_dir(path: &Path) -> BlobResult<PathBuf> {
    path.parent().map(Path::to_path_buf).ok_or_else(|| {
        BlobError::Io(io::Error::new(
            ErrorKind::Other,
            "object path missing parent directory",
        ))
    })
}

#[cfg(test)]
pub(crate) fn body(bytes: impl Into<Bytes>) -> ByteStream<'static> {
    Box::pin(futures::stream::once(futures::future::ready(Ok::<Bytes, io::Error>(
        bytes.into(),
    ))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::hasher::collect_bounded;

    async fn bucket() -> (DiskBucket, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let bucket = DiskBucket::open("datalake-test", dir.path()).await.unwrap();
        (bucket, dir)
    }

    async fn read_all(bucket: &DiskBucket, key: &str, range: Option<ByteRange>) -> Bytes {
        let body = bucket.get(key, range).await.unwrap().unwrap();
        collect_bounded(body.stream, u64::MAX).await.unwrap()
    }

    #[tokio::test]
    async fn put_get_head_delete() {
        let (bucket, _dir) = bucket().await;
        let head = bucket
            .put("obj-1", body("hello-huly"), PutOptions::new("text/plain"))
            .await
            .unwrap();
        assert_eq!(head.size, 10);
        assert_eq!(head.etag, format!("{:x}", md5::compute(b"hello-huly")));
        assert!(head.checksum_sha256.is_some());

        assert_eq!(bucket.head("obj-1").await.unwrap(), Some(head));
        assert_eq!(&read_all(&bucket, "obj-1", None).await[..], b"hello-huly");

        bucket.delete("obj-1").await.unwrap();
        assert!(bucket.head("obj-1").await.unwrap().is_none());
        assert!(bucket.get("obj-1", None).await.unwrap().is_none());
        // Deleting again is fine.
        bucket.delete("obj-1").await.unwrap();
    }

    #[tokio::test]
    async fn if_absent_put_never_replaces() {
        let (bucket, dir) = bucket().await;
        bucket
            .put("once", body("original"), PutOptions::new("text/plain").if_absent())
            .await
            .unwrap();
        let err = bucket
            .put("once", body("TAMPERED"), PutOptions::new("text/plain").if_absent())
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::AlreadyExists(ref key) if key == "once"));
        assert_eq!(&read_all(&bucket, "once", None).await[..], b"original");

        fn temp_files(dir: &Path) -> usize {
            std::fs::read_dir(dir)
                .unwrap()
                .flatten()
                .map(|entry| {
                    let path = entry.path();
                    if path.is_dir() {
                        temp_files(&path)
                    } else {
                        usize::from(entry.file_name().to_string_lossy().starts_with(".tmp-"))
                    }
                })
                .sum()
        }
        assert_eq!(temp_files(dir.path()), 0);

        // Plain puts still overwrite.
        bucket
            .put("once", body("replaced"), PutOptions::new("text/plain"))
            .await
            .unwrap();
        assert_eq!(&read_all(&bucket, "once", None).await[..], b"replaced");
    }

    #[tokio::test]
    async fn ranged_get() {
        let (bucket, _dir) = bucket().await;
        let payload: Vec<u8> = (0..=255u8).collect();
        bucket
            .put("bytes", body(payload.clone()), PutOptions::new("application/octet-stream"))
            .await
            .unwrap();
        let got = read_all(&bucket, "bytes", Some(ByteRange { start: 10, end: 19 })).await;
        assert_eq!(&got[..], &payload[10..20]);

        let err = bucket
            .get("bytes", Some(ByteRange { start: 10, end: 256 }))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BlobError::RangeNotSatisfiable { size: 256 }));
    }

    #[tokio::test]
    async fn rejects_unsafe_keys() {
        let (bucket, _dir) = bucket().await;
        for key in ["", "../escape", "/abs", ".multipart", "x.meta", "a\\b"] {
            assert!(bucket.head(key).await.is_err(), "{key:?} accepted");
        }
    }

    #[tokio::test]
    async fn multipart_assembles_by_part_number() {
        let (bucket, _dir) = bucket().await;
        let chunks: [&'static [u8]; 3] = [b"first-", b"second-", b"third"];

        let in_order = bucket.create_multipart("ordered", "text/plain").await.unwrap();
        let mut parts = Vec::new();
        for (i, chunk) in chunks.iter().enumerate() {
            parts.push(
                bucket
                    .upload_part("ordered", &in_order, i as u32 + 1, body(*chunk))
                    .await
                    .unwrap(),
            );
        }
        bucket.complete_multipart("ordered", &in_order, &parts).await.unwrap();

        let shuffled = bucket.create_multipart("shuffled", "text/plain").await.unwrap();
        let mut parts = Vec::new();
        for number in [2u32, 1, 3] {
            let chunk = chunks[number as usize - 1];
            parts.push(
                bucket
                    .upload_part("shuffled", &shuffled, number, body(chunk))
                    .await
                    .unwrap(),
            );
        }
        let head = bucket.complete_multipart("shuffled", &shuffled, &parts).await.unwrap();
        assert_eq!(head.size, 18);
        assert_eq!(head.content_type, "text/plain");
        assert!(head.checksum_sha256.is_none());

        let a = read_all(&bucket, "ordered", None).await;
        let b = read_all(&bucket, "shuffled", None).await;
        assert_eq!(a, b);
        assert_eq!(&a[..], b"first-second-third");
        assert!(!bucket.upload_dir(&shuffled).exists());
    }

    #[tokio::test]
    async fn multipart_rejects_bad_etag_and_missing_parts() {
        let (bucket, _dir) = bucket().await;
        let upload = bucket.create_multipart("k", "text/plain").await.unwrap();
        let part = bucket.upload_part("k", &upload, 1, body("abc")).await.unwrap();

        let forged = CompletedPart {
            part_number: 1,
            etag: "0000".into(),
        };
        assert!(matches!(
            bucket.complete_multipart("k", &upload, &[forged]).await,
            Err(BlobError::BadRequest(_))
        ));
        let missing = CompletedPart {
            part_number: 2,
            etag: part.etag.clone(),
        };
        assert!(matches!(
            bucket.complete_multipart("k", &upload, &[part, missing]).await,
            Err(BlobError::BadRequest(_))
        ));
        assert!(bucket.head("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn abort_releases_parts() {
        let (bucket, _dir) = bucket().await;
        let upload = bucket.create_multipart("k", "text/plain").await.unwrap();
        bucket.upload_part("k", &upload, 1, body("abc")).await.unwrap();
        bucket.abort_multipart("k", &upload).await.unwrap();
        assert!(!bucket.upload_dir(&upload).exists());
        bucket.abort_multipart("k", &upload).await.unwrap();
        assert!(matches!(
            bucket.upload_part("k", &upload, 2, body("x")).await,
            Err(BlobError::UploadNotFound(_))
        ));
    }

    #[tokio::test]
    async fn health_probe() {
        let (bucket, _dir) = bucket().await;
        bucket.check_health().await.unwrap();
    }
}
