//! Edge response cache for full blob reads.

use crate::models::blob::BlobInfo;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use std::{num::NonZeroUsize, sync::Arc};

/// A cached 200 response.
#[derive(Clone, Debug)]
pub struct CachedBlob {
    pub info: BlobInfo,
    pub body: Bytes,
}

/// `(workspace, name)`. Kept as a pair so no two targets can collide.
type CacheKey = (String, String);

fn cache_key(workspace: &str, name: &str) -> CacheKey {
    (workspace.to_string(), name.to_string())
}

struct CacheState {
    entries: LruCache<CacheKey, CachedBlob>,
    /// Bumped by every invalidation.
    epoch: u64,
}

/// Taken before a blob is resolved. Inserting with a ticket that an
/// invalidation has since voided is a no-op, so a read that raced a write or
/// delete never repopulates the cache with what it saw.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheTicket(u64);

/// Bounded LRU cache of full-object responses.
///
/// Only whole-object reads are inserted; range responses never are.
#[derive(Clone)]
pub struct ResponseCache {
    state: Arc<Mutex<CacheState>>,
    max_entries: usize,
    max_object_bytes: u64,
}

impl ResponseCache {
    pub fn new(max_entries: usize, max_object_bytes: u64) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Arc::new(Mutex::new(CacheState {
                entries: LruCache::new(capacity),
                epoch: 0,
            })),
            max_entries,
            max_object_bytes,
        }
    }

    /// Whether an object of `size` bytes would be admitted.
    pub fn admits(&self, size: u64) -> bool {
        self.max_entries > 0 && size <= self.max_object_bytes
    }

    pub fn ticket(&self) -> CacheTicket {
        CacheTicket(self.state.lock().epoch)
    }

    pub fn get(&self, workspace: &str, name: &str) -> Option<CachedBlob> {
        self.state
            .lock()
            .entries
            .get(&cache_key(workspace, name))
            .cloned()
    }

    /// Returns whether the entry was stored.
    pub fn insert(
        &self,
        workspace: &str,
        name: &str,
        ticket: CacheTicket,
        entry: CachedBlob,
    ) -> bool {
        if !self.admits(entry.body.len() as u64) {
            return false;
        }
        let mut state = self.state.lock();
        if state.epoch != ticket.0 {
            return false;
        }
        state.entries.put(cache_key(workspace, name), entry);
        true
    }

    pub fn invalidate(&self, workspace: &str, name: &str) {
        let mut state = self.state.lock();
        state.epoch = state.epoch.wrapping_add(1);
        state.entries.pop(&cache_key(workspace, name));
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::data::ContentHash;
    use chrono::Utc;
    use uuid::Uuid;

    fn entry(body: &'static [u8]) -> CachedBlob {
        CachedBlob {
            info: BlobInfo {
                name: "n".into(),
                hash: ContentHash(Uuid::nil()),
                size: body.len() as u64,
                content_type: "text/plain".into(),
                etag: "e".into(),
                last_modified: Utc::now(),
            },
            body: Bytes::from_static(body),
        }
    }

    fn put(cache: &ResponseCache, workspace: &str, name: &str, body: &'static [u8]) -> bool {
        cache.insert(workspace, name, cache.ticket(), entry(body))
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = ResponseCache::new(2, 1024);
        put(&cache, "w", "a", b"a");
        put(&cache, "w", "b", b"b");
        assert!(cache.get("w", "a").is_some());
        put(&cache, "w", "c", b"c");
        assert_eq!(cache.len(), 2);
        assert!(cache.get("w", "b").is_none());
        assert_eq!(&cache.get("w", "a").unwrap().body[..], b"a");
        assert_eq!(&cache.get("w", "c").unwrap().body[..], b"c");
    }

    #[test]
    fn skips_oversized_bodies() {
        let cache = ResponseCache::new(10, 3);
        assert!(!put(&cache, "w", "big", b"four"));
        assert!(cache.is_empty());
        assert!(put(&cache, "w", "ok", b"abc"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn invalidation_and_replacement() {
        let cache = ResponseCache::new(2, 1024);
        put(&cache, "w", "a", b"old");
        put(&cache, "w", "a", b"new");
        assert_eq!(cache.len(), 1);
        assert_eq!(&cache.get("w", "a").unwrap().body[..], b"new");
        cache.invalidate("w", "a");
        assert!(cache.get("w", "a").is_none());
        put(&cache, "v", "a", b"x");
        assert!(cache.get("w", "a").is_none());
    }

    #[test]
    fn slash_in_workspace_does_not_alias_names() {
        let cache = ResponseCache::new(4, 1024);
        put(&cache, "a/b", "c", b"tenant-ab");
        assert!(cache.get("a", "b/c").is_none());
        assert!(cache.get("a/b", "c").is_some());
    }

    #[test]
    fn stale_ticket_is_not_stored() {
        let cache = ResponseCache::new(4, 1024);
        let ticket = cache.ticket();
        cache.invalidate("w", "doc");
        assert!(!cache.insert("w", "doc", ticket, entry(b"gone")));
        assert!(cache.get("w", "doc").is_none());
        assert!(cache.insert("w", "doc", cache.ticket(), entry(b"fresh")));
    }

    #[test]
    fn disabled_cache_admits_nothing() {
        let cache = ResponseCache::new(0, 1024);
        assert!(!put(&cache, "w", "a", b"a"));
        assert!(cache.is_empty());
    }
}
