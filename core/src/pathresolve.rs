//! Resolves a slash-separated repository-relative path against a live
//! mount, consulting the [crate::inodes::overlay::Overlay] for materialized
//! entries and the committed tree (via [crate::objectstore::ObjectStore])
//! otherwise. This is the path-keyed counterpart of the (parent inode,
//! name)-keyed lookup the FUSE channel drives off of, needed anywhere a
//! caller names a path directly rather than walking in from a `lookup`
//! callback — the management surface's path-taking RPCs (`getSHA1`,
//! `getFileInformation`, `checkOutRevision`'s local-state callback,
//! `globFiles`) all need exactly this.
//!
//! By invariant 1 (a materialized tree's ancestors are all materialized),
//! once resolution falls off the overlay and onto a committed subtree,
//! nothing further down can be materialized either — so the committed half
//! of this walk never needs to re-check the overlay.

use crate::inodes::{InodeNumber, ROOT_INODE};
use crate::mount::MountPoint;
use crate::objectstore::ObjectFetchContext;
use crate::tree::{EntryKind, Tree};
use crate::{Error, ObjectId, Result};

/// What [resolve] found at the end of a path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolved {
    /// Backed by the overlay; `inode` names the overlay's on-disk state for
    /// it directly (see [crate::inodes::overlay::Overlay::read_file] /
    /// `read_dir`).
    Materialized { inode: InodeNumber, kind: EntryKind },
    /// Backed by a source-control object, exactly as committed.
    Unmaterialized { id: ObjectId, kind: EntryKind },
}

impl Resolved {
    pub fn kind(&self) -> EntryKind {
        match self {
            Resolved::Materialized { kind, .. } => *kind,
            Resolved::Unmaterialized { kind, .. } => *kind,
        }
    }
}

fn split_components(path: &[u8]) -> Vec<&[u8]> {
    path.split(|&b| b == b'/').filter(|c| !c.is_empty()).collect()
}

fn require_directory(kind: EntryKind, name: &[u8]) -> Result<()> {
    if kind.is_directory() {
        Ok(())
    } else {
        Err(Error::Argument(format!("{} is not a directory", describe(name))))
    }
}

fn describe(name: &[u8]) -> String {
    String::from_utf8_lossy(name).into_owned()
}

/// Resolves `path` (no leading slash required) against `mount`'s current
/// state. Returns [Error::NotFound] if any component is missing,
/// [Error::Argument] if a non-terminal component isn't a directory.
pub async fn resolve(mount: &MountPoint, path: &[u8]) -> Result<Resolved> {
    let components = split_components(path);
    if components.is_empty() {
        return Ok(Resolved::Materialized { inode: ROOT_INODE, kind: EntryKind::Directory });
    }
    let ctx = ObjectFetchContext::mgmt();
    let last = components.len() - 1;

    // Phase 1: walk the overlay from the root for as long as entries are
    // actually materialized (or overlay-tracked references). Falls through
    // to phase 2 the moment a component turns out to be a plain committed
    // reference, or the root itself was never materialized.
    let mut overlay_inode = ROOT_INODE;
    for (i, name) in components.iter().enumerate() {
        let is_last = i == last;
        let entries = mount.overlay.read_dir(overlay_inode).await?;
        let Some(overlay_entry) = entries.iter().find(|e| e.name.as_slice() == *name) else {
            if overlay_inode == ROOT_INODE {
                // Root never materialized (fresh mount, no writes yet):
                // resume resolution against the committed root tree,
                // starting at this component.
                let root_tree = mount.object_store.get_root_tree(&mount.current_root(), &ctx).await?;
                return resolve_committed(mount, root_tree, &components[i..]).await;
            }
            return Err(Error::NotFound(describe(name)));
        };
        let kind = overlay_entry.entry_kind()?;
        match overlay_entry.reference_id()? {
            None if is_last => return Ok(Resolved::Materialized { inode: overlay_entry.child_inode, kind }),
            None => {
                require_directory(kind, name)?;
                overlay_inode = overlay_entry.child_inode;
            }
            Some(id) if is_last => return Ok(Resolved::Unmaterialized { id, kind }),
            Some(id) => {
                require_directory(kind, name)?;
                let tree = mount.object_store.get_tree(&id, &ctx).await?;
                return resolve_committed(mount, tree, &components[i + 1..]).await;
            }
        }
    }
    unreachable!("every branch above returns before the loop exits normally")
}

/// Phase 2: every remaining component is resolved purely against
/// source-control trees, since invariant 1 guarantees nothing beneath an
/// unmaterialized entry can itself be materialized.
async fn resolve_committed(mount: &MountPoint, mut tree: Tree, remaining: &[&[u8]]) -> Result<Resolved> {
    if remaining.is_empty() {
        return Err(Error::Argument("empty path component list".into()));
    }
    let ctx = ObjectFetchContext::mgmt();
    let last = remaining.len() - 1;
    for (i, name) in remaining.iter().enumerate() {
        let entry = tree.get(name).ok_or_else(|| Error::NotFound(describe(name)))?;
        if i == last {
            return Ok(Resolved::Unmaterialized { id: entry.id().clone(), kind: entry.kind() });
        }
        require_directory(entry.kind(), name)?;
        tree = mount.object_store.get_tree(entry.id(), &ctx).await?;
    }
    unreachable!("remaining is non-empty, loop always returns")
}

/// Whether the overlay's current bytes for a materialized regular file
/// still hash to `old_id` — the "matches_committed" distinction
/// [crate::mount::LocalState::Materialized] needs, computed by actually
/// hashing the written content rather than tracking a provenance id
/// (materialized inodes carry none, by invariant 4).
pub async fn materialized_file_matches(mount: &MountPoint, inode: InodeNumber, old_id: &ObjectId) -> Result<bool> {
    let bytes = mount.overlay.read_file(inode).await?;
    Ok(&ObjectId::of_blob_contents(&bytes) == old_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::cache::{CacheConfig, InMemoryObjectCache};
    use crate::importqueue::pool::ImporterPool;
    use crate::importqueue::{BatchSizes, ImportRequestQueue};
    use crate::inodes::overlay::{ChildRef, OverlayDirEntry};
    use crate::inodes::{InodeMap, Overlay};
    use crate::journal::Journal;
    use crate::objectstore::ObjectStore;
    use crate::rootid::parse_root_id;
    use crate::tree::Entry;
    use std::sync::Arc;

    fn id(byte: u8) -> ObjectId {
        ObjectId::try_from(vec![byte; 20]).unwrap()
    }

    async fn test_mount() -> (MountPoint, Arc<MemoryBackend>, tempfile::TempDir, ImporterPool) {
        let backend = Arc::new(MemoryBackend::new());
        let root_id = parse_root_id(b"deadbeefdeadbeefdeadbeefdeadbeefdeadbeef");

        let nested = Entry::new(b"nested.txt".to_vec(), id(2), EntryKind::RegularFile).unwrap();
        let sub_tree = Tree::from_entries(vec![nested]).unwrap();
        backend.seed_tree(id(1), sub_tree);

        let sub_dir = Entry::new(b"sub".to_vec(), id(1), EntryKind::Directory).unwrap();
        let top = Entry::new(b"top.txt".to_vec(), id(3), EntryKind::RegularFile).unwrap();
        let root_tree = Tree::from_entries(vec![sub_dir, top]).unwrap();
        backend.seed_tree(id(0xAA), root_tree);
        backend.seed_root(&root_id, id(0xAA));

        let queue = ImportRequestQueue::new(BatchSizes::default());
        let pool = ImporterPool::spawn(1, queue.clone(), backend.clone(), None);

        let object_store = Arc::new(ObjectStore::new(
            Arc::new(crate::localstore::MemoryLocalStore::new()),
            Arc::new(InMemoryObjectCache::new(CacheConfig::default())),
            queue,
            backend.clone(),
        ));

        let overlay_dir = tempfile::tempdir().unwrap();
        let mount = MountPoint::new(
            object_store,
            Arc::new(InodeMap::new()),
            Arc::new(Journal::new(1_000_000)),
            Arc::new(Overlay::new(overlay_dir.path().to_path_buf())),
            root_id,
            1,
        );
        (mount, backend, overlay_dir, pool)
    }

    #[tokio::test]
    async fn resolves_top_level_committed_file() {
        let (mount, _backend, _dir, _pool) = test_mount().await;
        let resolved = resolve(&mount, b"top.txt").await.unwrap();
        assert_eq!(resolved, Resolved::Unmaterialized { id: id(3), kind: EntryKind::RegularFile });
    }

    #[tokio::test]
    async fn resolves_nested_committed_file() {
        let (mount, _backend, _dir, _pool) = test_mount().await;
        let resolved = resolve(&mount, b"sub/nested.txt").await.unwrap();
        assert_eq!(resolved, Resolved::Unmaterialized { id: id(2), kind: EntryKind::RegularFile });
    }

    #[tokio::test]
    async fn missing_component_is_not_found() {
        let (mount, _backend, _dir, _pool) = test_mount().await;
        let err = resolve(&mount, b"nope.txt").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn non_directory_component_is_rejected() {
        let (mount, _backend, _dir, _pool) = test_mount().await;
        let err = resolve(&mount, b"top.txt/inner").await.unwrap_err();
        assert!(matches!(err, Error::Argument(_)));
    }

    #[tokio::test]
    async fn materialized_root_entry_resolves_via_overlay() {
        let (mount, _backend, _dir, _pool) = test_mount().await;
        mount
            .overlay
            .add_child(
                crate::inodes::ROOT_INODE,
                OverlayDirEntry {
                    name: b"new.txt".to_vec(),
                    child_inode: 42,
                    kind: 0,
                    reference: ChildRef::Materialized,
                },
            )
            .await
            .unwrap();
        mount.overlay.write_file(42, 0, b"hello").await.unwrap();

        let resolved = resolve(&mount, b"new.txt").await.unwrap();
        assert_eq!(resolved, Resolved::Materialized { inode: 42, kind: EntryKind::RegularFile });
    }

    #[tokio::test]
    async fn materialized_file_matches_detects_divergence() {
        let (mount, _backend, _dir, _pool) = test_mount().await;
        mount.overlay.write_file(7, 0, b"hello").await.unwrap();
        let matching_id = ObjectId::of_blob_contents(b"hello");
        let other_id = id(9);
        assert!(materialized_file_matches(&mount, 7, &matching_id).await.unwrap());
        assert!(!materialized_file_matches(&mount, 7, &other_id).await.unwrap());
    }
}
