//! Workspace → shard placement.

use super::bucket::Bucket;
use crate::models::data::Location;
use std::sync::Arc;

/// A location together with the bucket that serves it.
#[derive(Clone)]
pub struct Shard {
    pub location: Location,
    pub bucket: Arc<dyn Bucket>,
}

/// Maps workspaces onto the static shard list.
///
/// Placement is a pure function of the workspace id and the configured list:
/// MD5(workspace) reduced modulo the shard count. Reordering or resizing the
/// list remaps workspaces, so the list is fixed for the life of a deployment.
#[derive(Clone)]
pub struct LocationSelector {
    shards: Arc<[Shard]>,
}

impl LocationSelector {
    /// Returns `None` when `shards` is empty.
    pub fn new(shards: Vec<Shard>) -> Option<Self> {
        if shards.is_empty() {
            return None;
        }
        Some(Self {
            shards: shards.into(),
        })
    }

    pub fn select(&self, workspace: &str) -> &Shard {
        let digest = md5::compute(workspace.as_bytes());
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        let index = u64::from_be_bytes(prefix) % self.shards.len() as u64;
        &self.shards[index as usize]
    }

    /// Shard serving a location recorded in the metadata store.
    pub fn shard(&self, location: &Location) -> Option<&Shard> {
        self.shards.iter().find(|s| &s.location == location)
    }

    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::bucket::DiskBucket;
    use std::collections::HashSet;

    async fn selector(names: &[&str]) -> (LocationSelector, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut shards = Vec::new();
        for name in names {
            let bucket = DiskBucket::open(format!("datalake-{name}"), dir.path().join(name))
                .await
                .unwrap();
            shards.push(Shard {
                location: Location::new(*name),
                bucket: Arc::new(bucket),
            });
        }
        (LocationSelector::new(shards).unwrap(), dir)
    }

    #[test]
    fn empty_shard_list_is_rejected() {
        assert!(LocationSelector::new(Vec::new()).is_none());
    }

    #[tokio::test]
    async fn placement_is_deterministic() {
        let (a, _d1) = selector(&["weur", "eeur", "wnam"]).await;
        let (b, _d2) = selector(&["weur", "eeur", "wnam"]).await;
        for ws in ["w1", "w2", "another-workspace", ""] {
            assert_eq!(a.select(ws).location, b.select(ws).location);
            assert_eq!(a.select(ws).location, a.select(ws).location);
        }
    }

    #[tokio::test]
    async fn spreads_workspaces_over_shards() {
        let (sel, _dir) = selector(&["weur", "eeur", "wnam"]).await;
        let used: HashSet<_> = (0..200)
            .map(|i| sel.select(&format!("workspace-{i}")).location.clone())
            .collect();
        assert_eq!(used.len(), 3);
    }

    #[tokio::test]
    async fn single_shard_takes_everything() {
        let (sel, _dir) = selector(&["weur"]).await;
        assert_eq!(sel.select("anything").location, Location::new("weur"));
        assert!(sel.shard(&Location::new("weur")).is_some());
        assert!(sel.shard(&Location::new("apac")).is_none());
    }
}
