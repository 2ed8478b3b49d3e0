//! Streaming content hashing.
//!
//! Payloads are never buffered whole: [`tee`] forks one byte stream into two
//! bounded channels so the hash and the upload advance independently, and
//! [`hash_stream`] folds chunks into a SHA-256 digest as they arrive.

use super::{
    bucket::ByteStream,
    error::{BlobError, BlobResult},
};
use crate::models::data::ContentHash;
use base64::{Engine as _, engine::general_purpose};
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, Stream, StreamExt, channel::mpsc, pin_mut};
use sha2::{Digest, Sha256};
use std::{future::Future, io};

/// Chunks buffered per branch before the faster consumer waits for the slower one.
pub const TEE_BUFFER_CHUNKS: usize = 16;

/// Result of hashing a complete payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContentDigest {
    pub hash: ContentHash,
    pub sha256: [u8; 32],
    pub size: u64,
}

/// Incremental SHA-256 that also counts bytes.
#[derive(Default)]
pub struct Hasher {
    inner: Sha256,
    size: u64,
}

impl Hasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.size += chunk.len() as u64;
        self.inner.update(chunk);
    }

    pub fn finish(self) -> ContentDigest {
        let sha256: [u8; 32] = self.inner.finalize().into();
        ContentDigest {
            hash: ContentHash::from_digest(&sha256),
            sha256,
            size: self.size,
        }
    }
}

/// Decode a base64 `checksum-sha256` into a content hash.
///
/// Returns `None` for anything that is not a 32-byte digest.
pub fn hash_from_checksum(checksum: &str) -> Option<ContentHash> {
    let bytes = general_purpose::STANDARD.decode(checksum.trim()).ok()?;
    let digest: [u8; 32] = bytes.try_into().ok()?;
    Some(ContentHash::from_digest(&digest))
}

/// Consume a stream and return its digest.
pub async fn hash_stream<S>(stream: S) -> io::Result<ContentDigest>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    pin_mut!(stream);
    let mut hasher = Hasher::new();
    while let Some(chunk) = stream.next().await {
        hasher.update(&chunk?);
    }
    Ok(hasher.finish())
}

/// Read a whole stream into memory, failing once it grows past `limit` bytes.
pub async fn collect_bounded<S>(stream: S, limit: u64) -> BlobResult<Bytes>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    pin_mut!(stream);
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if (buf.len() + chunk.len()) as u64 > limit {
            return Err(BlobError::bad_request(format!(
                "payload is larger than {limit} bytes"
            )));
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// Fork `source` into two streams that each yield every chunk.
///
/// The returned driver pulls from `source` and must be polled alongside both
/// consumers (e.g. in one `tokio::join!`). Each branch buffers at most
/// `buffer` chunks. A dropped branch stops receiving but does not stall the
/// other; a source error is delivered to both branches and ends the tee.
pub fn tee<'a, S>(
    source: S,
    buffer: usize,
) -> (
    impl Future<Output = ()> + Send + 'a,
    ByteStream<'static>,
    ByteStream<'static>,
)
where
    S: Stream<Item = io::Result<Bytes>> + Send + 'a,
{
    let (mut left_tx, left_rx) = mpsc::channel::<io::Result<Bytes>>(buffer);
    let (mut right_tx, right_rx) = mpsc::channel::<io::Result<Bytes>>(buffer);

    let driver = async move {
        pin_mut!(source);
        let mut left_open = true;
        let mut right_open = true;
        while left_open || right_open {
            let Some(item) = source.next().await else {
                break;
            };
            let failed = item.is_err();
            let (left, right) = match item {
                Ok(chunk) => (Ok(chunk.clone()), Ok(chunk)),
                Err(err) => (Err(io::Error::new(err.kind(), err.to_string())), Err(err)),
            };
            if left_open {
                left_open = left_tx.send(left).await.is_ok();
            }
            if right_open {
                right_open = right_tx.send(right).await.is_ok();
            }
            if failed {
                break;
            }
        }
        left_tx.close_channel();
        right_tx.close_channel();
    };

    (driver, Box::pin(left_rx), Box::pin(right_rx))
}
