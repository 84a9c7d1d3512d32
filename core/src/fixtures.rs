//! Shared construction helpers for tests that need a fully wired-up
//! object-resolution pipeline (store + cache + queue + pool + backend)
//! rather than just one module's unit under test. Mirrors the small
//! `store()`/`id()` helper functions duplicated across `objectstore.rs`,
//! `server.rs` and `mount.rs`'s own test modules, pulled out once a third
//! caller needed the same thing.

use std::sync::Arc;

use tempfile::TempDir;

use crate::backend::MemoryBackend;
use crate::cache::{CacheConfig, InMemoryObjectCache};
use crate::importqueue::pool::ImporterPool;
use crate::importqueue::{BatchSizes, ImportRequestQueue};
use crate::inodes::{InodeMap, Overlay};
use crate::journal::Journal;
use crate::localstore::MemoryLocalStore;
use crate::mount::MountPoint;
use crate::objectstore::ObjectStore;
use crate::rootid::RootId;
use crate::ObjectId;

/// A fully in-memory `ObjectStore`, with an `ImporterPool` already spawned
/// against it so that cache/local-store misses actually resolve instead of
/// hanging on the queue forever. Keeping the pool alive is the caller's
/// job: drop it (or the returned `Harness`) only once done issuing
/// requests against `object_store`.
pub struct Harness {
    pub backend: Arc<MemoryBackend>,
    pub object_store: Arc<ObjectStore>,
    _pool: ImporterPool,
}

impl Harness {
    pub fn new() -> Self {
        let backend = Arc::new(MemoryBackend::new());
        let queue = ImportRequestQueue::new(BatchSizes::default());
        let pool = ImporterPool::spawn(2, queue.clone(), backend.clone(), None);
        let object_store = Arc::new(ObjectStore::new(
            Arc::new(MemoryLocalStore::new()),
            Arc::new(InMemoryObjectCache::new(CacheConfig::default())),
            queue,
            backend.clone(),
        ));
        Self { backend, object_store, _pool: pool }
    }

    /// Builds a [MountPoint] against this harness's store, with a fresh
    /// [InodeMap]/[Journal] and an [Overlay] rooted in a throwaway
    /// temporary directory that's kept alive for as long as the returned
    /// tuple is.
    pub fn mount_point(&self, initial_root: RootId, mount_generation: u64) -> (MountPoint, TempDir) {
        let dir = tempfile::tempdir().expect("create overlay tempdir");
        let overlay = Arc::new(Overlay::new(dir.path().to_path_buf()));
        let mount = MountPoint::new(
            self.object_store.clone(),
            Arc::new(InodeMap::new()),
            Arc::new(Journal::new(crate::server::DEFAULT_JOURNAL_MEMORY_LIMIT)),
            overlay,
            initial_root,
            mount_generation,
        );
        (mount, dir)
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// A deterministic 20-byte `ObjectId` for use in tests, filled with a
/// single repeated byte so failures are easy to eyeball
/// (`id(1)`, `id(2)`, ...).
pub fn id(byte: u8) -> ObjectId {
    ObjectId::try_from(vec![byte; 20]).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objectstore::ObjectFetchContext;
    use crate::tree::{Entry, EntryKind, Tree};

    #[tokio::test]
    async fn harness_resolves_through_the_full_pipeline() {
        let harness = Harness::new();
        let entry = Entry::new(b"a.txt".to_vec(), id(1), EntryKind::RegularFile).unwrap();
        let tree = Tree::from_entries(vec![entry]).unwrap();
        harness.backend.seed_tree(id(0xAA), tree.clone());

        let fetched = harness
            .object_store
            .get_tree(&id(0xAA), &ObjectFetchContext::mgmt())
            .await
            .unwrap();
        assert_eq!(fetched, tree);
    }
}
