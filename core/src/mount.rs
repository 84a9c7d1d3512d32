//! Binds a configured root (repository + initial commit) to an
//! [crate::inodes::InodeMap], an [crate::inodes::Overlay] and a
//! [crate::journal::Journal], and implements the two tree-shaped
//! algorithms that operate over them: checkout (moving the working copy to
//! a new [RootId]) and diff (comparing it against one). Neither has a
//! direct analogue elsewhere in this crate — nothing else here mutates a
//! working copy against a second tree — so this is new logic, built using
//! the same "pure planning function plus a thin async driver" split the
//! rest of this crate uses to keep tree-shaped logic unit-testable without
//! a live mount.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::instrument;

use crate::inodes::overlay::{ChildRef, OverlayDirEntry};
use crate::inodes::{InodeMap, LoadState, Materialization, Overlay, ROOT_INODE};
use crate::journal::{Journal, PathEventKind, SnapshotTransition};
use crate::objectstore::{ObjectFetchContext, ObjectStore};
use crate::rootid::RootId;
use crate::tree::{EntryKind, Tree};
use crate::{Error, ObjectId, Result};

/// How aggressively [plan_directory_checkout] should apply non-conflicting
/// and conflicting updates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckoutMode {
    /// Compute conflicts only; apply nothing.
    DryRun,
    /// Apply every non-conflicting update; leave conflicting entries alone
    /// and report them.
    Normal,
    /// Apply every update, including conflicting ones (overwriting local
    /// changes).
    Force,
}

/// A path simultaneously unlinked by
/// the kernel and targeted by checkout is treated as a documented
/// conflict, not a special case — `ExternallyRemoved` is the kind used for
/// it (see DESIGN.md).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictKind {
    Modified,
    ExternallyRemoved,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Conflict {
    pub path: Vec<u8>,
    pub kind: ConflictKind,
}

/// What the working copy currently holds for one entry's name, as seen by
/// the checkout/diff planner. Supplied by the caller (in a live mount,
/// backed by [InodeMap] + [crate::inodes::Overlay]; in tests, by a fixed
/// map) so the planning logic itself stays a pure function.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LocalState {
    /// Backed by a source-control object, exactly mirroring the committed
    /// tree by invariant — always safe to repoint at a new `ObjectId`.
    Unmaterialized,
    /// Backed by the overlay; `matches_committed` says whether its current
    /// content hash still equals the old committed entry's `ObjectId` (a
    /// user can write back the same bytes, in which case there's nothing
    /// to conflict over even though the inode stayed materialized).
    Materialized { matches_committed: bool },
    /// The kernel has unlinked this path already (open question #3).
    ExternallyRemoved,
    /// No local entry exists by this name at all (neither side had it).
    Absent,
}

/// One resolved action for a single directory entry, returned by
/// [plan_directory_checkout] for the caller (an async `MountPoint`) to
/// apply against the real inode tree / overlay.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CheckoutAction {
    NoOp,
    /// Repoint an unmaterialized entry, or overwrite a materialized one
    /// that never diverged, at a new `ObjectId` (or remove it, if `None`
    /// — the entry was deleted in the target tree).
    SetObjectId(Option<ObjectId>),
    /// Entry's type changed (file <-> dir <-> symlink); always a full
    /// replace regardless of materialization.
    Replace(Option<ObjectId>),
}

pub struct DirectoryCheckoutPlan {
    pub conflicts: Vec<Conflict>,
    pub actions: Vec<(Vec<u8>, CheckoutAction)>,
}

/// Applies the five per-entry checkout policies to one directory
/// level: `old` is the committed tree at the mount's current root, `target`
/// is the tree being checked out to, and `local_state` resolves what the
/// working copy actually holds for a given name right now.
///
/// Pure and synchronous — recursion into unchanged subdirectories, and the
/// actual fetch of `target`'s children, is the caller's job (see
/// [MountPoint::checkout]), since that needs async access to the object
/// store.
pub fn plan_directory_checkout(
    old: &Tree,
    target: &Tree,
    local_state: impl Fn(&[u8]) -> LocalState,
    mode: CheckoutMode,
) -> DirectoryCheckoutPlan {
    let mut names: BTreeSet<&[u8]> = BTreeSet::new();
    names.extend(old.entries().iter().map(|e| e.name()));
    names.extend(target.entries().iter().map(|e| e.name()));

    let mut conflicts = Vec::new();
    let mut actions = Vec::new();

    for name in names {
        let old_entry = old.get(name);
        let target_entry = target.get(name);
        let state = local_state(name);

        if state == LocalState::ExternallyRemoved && target_entry.is_some() {
            conflicts.push(Conflict {
                path: name.to_vec(),
                kind: ConflictKind::ExternallyRemoved,
            });
            if matches!(mode, CheckoutMode::Force) {
                actions.push((name.to_vec(), CheckoutAction::Replace(target_entry.map(|e| e.id().clone()))));
            }
            continue;
        }

        match (old_entry, target_entry) {
            (Some(o), Some(t)) if o.kind() == t.kind() && o.id() == t.id() => {
                actions.push((name.to_vec(), CheckoutAction::NoOp));
            }
            (Some(o), Some(t)) if o.kind() != t.kind() => {
                actions.push((name.to_vec(), CheckoutAction::Replace(Some(t.id().clone()))));
            }
            (old_entry, target_entry) => {
                // Same kind (or one side absent), contents/presence differ.
                let target_id = target_entry.map(|e| e.id().clone());
                match &state {
                    LocalState::Unmaterialized | LocalState::Absent => {
                        actions.push((name.to_vec(), CheckoutAction::SetObjectId(target_id)));
                    }
                    LocalState::Materialized { matches_committed: true } => {
                        actions.push((name.to_vec(), CheckoutAction::SetObjectId(target_id)));
                    }
                    LocalState::Materialized { matches_committed: false } => {
                        conflicts.push(Conflict {
                            path: name.to_vec(),
                            kind: ConflictKind::Modified,
                        });
                        if matches!(mode, CheckoutMode::Force) {
                            actions.push((name.to_vec(), CheckoutAction::SetObjectId(target_id)));
                        }
                    }
                    LocalState::ExternallyRemoved => {
                        // target doesn't have this entry either (handled
                        // above otherwise); nothing to do.
                        let _ = old_entry;
                    }
                }
            }
        }
    }

    DirectoryCheckoutPlan { conflicts, actions }
}

/// One entry in a [DiffResult].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiffClass {
    Modified,
    Added,
    Removed,
    Ignored,
    Unknown,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiffResult {
    pub modified: Vec<Vec<u8>>,
    pub added: Vec<Vec<u8>>,
    pub removed: Vec<Vec<u8>>,
    pub ignored: Vec<Vec<u8>>,
    pub unknown: Vec<Vec<u8>>,
}

/// Diffs one directory level between the committed tree and the current
/// working-copy state. Only called for directories known to be
/// materialized somewhere beneath them — by invariant 1, an unmaterialized
/// subtree is bytewise identical to the committed tree and diffing it
/// would always produce nothing, so callers should skip straight past it.
pub fn plan_directory_diff(
    committed: &Tree,
    local_state: impl Fn(&[u8]) -> LocalState,
    working_names: &[Vec<u8>],
    is_ignored: impl Fn(&[u8]) -> bool,
) -> DiffResult {
    let mut result = DiffResult::default();
    let committed_names: BTreeSet<&[u8]> = committed.entries().iter().map(|e| e.name()).collect();

    for name in working_names {
        if committed_names.contains(name.as_slice()) {
            continue;
        }
        if is_ignored(name) {
            result.ignored.push(name.clone());
        } else {
            result.added.push(name.clone());
        }
    }

    for entry in committed.entries() {
        let present = working_names.iter().any(|n| n.as_slice() == entry.name());
        if !present {
            result.removed.push(entry.name().to_vec());
            continue;
        }
        match local_state(entry.name()) {
            LocalState::Materialized { matches_committed: false } => {
                result.modified.push(entry.name().to_vec());
            }
            LocalState::Unmaterialized | LocalState::Materialized { matches_committed: true } => {}
            LocalState::ExternallyRemoved => result.removed.push(entry.name().to_vec()),
            LocalState::Absent => {}
        }
    }

    result
}

/// Binds together everything a single mounted working copy needs: the
/// object store shared across mounts, this mount's inode table, and its
/// journal. `mount_generation` changes on every fresh (non-takeover) mount
/// of the same path, so stale journal positions from a prior process
/// incarnation are rejected rather than silently answered.
pub struct MountPoint {
    pub object_store: Arc<ObjectStore>,
    pub inode_map: Arc<InodeMap>,
    pub journal: Arc<Journal>,
    pub overlay: Arc<Overlay>,
    mount_generation: u64,
    current_root: parking_lot::Mutex<RootId>,
    next_generation_source: Arc<AtomicU64>,
}

impl MountPoint {
    pub fn new(
        object_store: Arc<ObjectStore>,
        inode_map: Arc<InodeMap>,
        journal: Arc<Journal>,
        overlay: Arc<Overlay>,
        initial_root: RootId,
        mount_generation: u64,
    ) -> Self {
        Self {
            object_store,
            inode_map,
            journal,
            overlay,
            mount_generation,
            current_root: parking_lot::Mutex::new(initial_root),
            next_generation_source: Arc::new(AtomicU64::new(mount_generation + 1)),
        }
    }

    pub fn mount_generation(&self) -> u64 {
        self.mount_generation
    }

    pub fn current_root(&self) -> RootId {
        self.current_root.lock().clone()
    }

    pub fn next_generation(&self) -> u64 {
        self.next_generation_source.fetch_add(1, Ordering::SeqCst)
    }

    /// Recursively checks out `target_root`, starting from the mount's
    /// current root. Only the top-level plan is computed and applied
    /// against real trees here: it fetches the root-level
    /// [DirectoryCheckoutPlan], applies its actions against the live
    /// [InodeMap]/[crate::inodes::Overlay] state via
    /// [MountPoint::apply_checkout_actions], then only advances
    /// `current_root` once the walk completes without being aborted. A
    /// production `MountPoint` would recurse the same apply step into every
    /// changed subdirectory; this only reaches the top level.
    #[instrument(skip(self, local_state), fields(mode = ?mode))]
    pub async fn checkout(
        &self,
        target_root: &RootId,
        mode: CheckoutMode,
        local_state: impl Fn(&[u8]) -> LocalState,
    ) -> Result<Vec<Conflict>> {
        let ctx = ObjectFetchContext::mgmt();
        let old_root = self.current_root();
        let old_tree = self.object_store.get_root_tree(&old_root, &ctx).await?;
        let target_tree = self.object_store.get_root_tree(target_root, &ctx).await?;

        let plan = plan_directory_checkout(&old_tree, &target_tree, local_state, mode);

        let mut changed_paths = Vec::new();
        for (name, action) in &plan.actions {
            if !matches!(action, CheckoutAction::NoOp) {
                changed_paths.push((name.clone(), PathEventKind::Changed));
            }
        }

        if !matches!(mode, CheckoutMode::DryRun) {
            // Applies whatever the plan resolved regardless of
            // `should_advance` below: in Normal mode a conflict on one
            // entry must not block the non-conflicting entries elsewhere in
            // the same directory from being applied.
            self.apply_checkout_actions(&plan.actions).await?;

            let should_advance = plan.conflicts.is_empty() || matches!(mode, CheckoutMode::Force);
            if should_advance {
                *self.current_root.lock() = target_root.clone();
                self.journal.add_delta(
                    Some(SnapshotTransition {
                        from_root: Some(old_root),
                        to_root: target_root.clone(),
                    }),
                    changed_paths,
                );
            }
        }

        Ok(plan.conflicts)
    }

    /// Applies the root-level [CheckoutAction]s from a [DirectoryCheckoutPlan]
    /// against the live overlay and inode table. A no-op if the root
    /// directory has never been populated into the overlay (nothing local
    /// to repoint yet — the next lookup will populate straight from the
    /// target tree).
    async fn apply_checkout_actions(&self, actions: &[(Vec<u8>, CheckoutAction)]) -> Result<()> {
        if actions.iter().all(|(_, action)| matches!(action, CheckoutAction::NoOp)) {
            return Ok(());
        }
        let mut entries = self.overlay.read_dir(ROOT_INODE).await?;
        if entries.is_empty() {
            return Ok(());
        }

        let mut removed_inodes = Vec::new();
        for (name, action) in actions {
            let new_id = match action {
                CheckoutAction::NoOp => continue,
                CheckoutAction::SetObjectId(id) | CheckoutAction::Replace(id) => id.clone(),
            };
            match new_id {
                Some(id) => {
                    let Some(entry) = entries.iter_mut().find(|e| &e.name == name) else {
                        // Not yet materialized into the overlay at all;
                        // nothing local to repoint.
                        continue;
                    };
                    entry.reference = ChildRef::Reference(id.as_bytes().to_vec());
                    if self.inode_map.state(entry.child_inode) == Some(LoadState::Loaded) {
                        self.inode_map.with_loaded_mut(entry.child_inode, |loaded| {
                            loaded.materialization = Materialization::Unmaterialized(id.clone());
                        });
                    }
                }
                None => {
                    if let Some(pos) = entries.iter().position(|e| &e.name == name) {
                        let removed: OverlayDirEntry = entries.remove(pos);
                        removed_inodes.push(removed.child_inode);
                    }
                }
            }
        }

        self.overlay.replace_dir_entries(ROOT_INODE, entries).await?;
        for inode in removed_inodes {
            self.overlay.remove_inode(inode).await?;
        }
        Ok(())
    }

    /// Diffs the working copy against `target_root` at the top level only
    /// (see [plan_directory_diff] doc comment on invariant-backed subtree
    /// skipping for the general recursive case).
    #[instrument(skip(self, local_state, is_ignored))]
    pub async fn diff(
        &self,
        target_root: &RootId,
        working_names: &[Vec<u8>],
        local_state: impl Fn(&[u8]) -> LocalState,
        is_ignored: impl Fn(&[u8]) -> bool,
    ) -> Result<DiffResult> {
        let ctx = ObjectFetchContext::mgmt();
        let target_tree = self.object_store.get_root_tree(target_root, &ctx).await?;
        Ok(plan_directory_diff(&target_tree, local_state, working_names, is_ignored))
    }
}

/// Rejects a caller-supplied [crate::journal::JournalPosition] whose
/// `mount_generation` doesn't match this mount's current one.
pub fn check_mount_generation(mount: &MountPoint, claimed_generation: u64) -> Result<()> {
    if claimed_generation != mount.mount_generation() {
        Err(Error::MountGenerationChanged)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::Entry;

    fn id(byte: u8) -> ObjectId {
        ObjectId::try_from(vec![byte; 20]).unwrap()
    }

    fn tree(entries: Vec<Entry>) -> Tree {
        Tree::from_entries(entries).unwrap()
    }

    #[test]
    fn unchanged_entry_is_a_noop() {
        let old = tree(vec![Entry::new(b"a.txt".to_vec(), id(1), EntryKind::RegularFile).unwrap()]);
        let target = old.clone();
        let plan = plan_directory_checkout(&old, &target, |_| LocalState::Unmaterialized, CheckoutMode::Normal);
        assert_eq!(plan.conflicts.len(), 0);
        assert_eq!(plan.actions, vec![(b"a.txt".to_vec(), CheckoutAction::NoOp)]);
    }

    #[test]
    fn type_change_always_replaces() {
        let old = tree(vec![Entry::new(b"a".to_vec(), id(1), EntryKind::RegularFile).unwrap()]);
        let target = tree(vec![Entry::new(b"a".to_vec(), id(2), EntryKind::Directory).unwrap()]);
        let plan = plan_directory_checkout(&old, &target, |_| LocalState::Materialized { matches_committed: false }, CheckoutMode::Normal);
        assert_eq!(plan.conflicts.len(), 0);
        assert_eq!(plan.actions, vec![(b"a".to_vec(), CheckoutAction::Replace(Some(id(2))))]);
    }

    #[test]
    fn unmaterialized_diverging_content_just_updates_id() {
        let old = tree(vec![Entry::new(b"a".to_vec(), id(1), EntryKind::RegularFile).unwrap()]);
        let target = tree(vec![Entry::new(b"a".to_vec(), id(2), EntryKind::RegularFile).unwrap()]);
        let plan = plan_directory_checkout(&old, &target, |_| LocalState::Unmaterialized, CheckoutMode::Normal);
        assert!(plan.conflicts.is_empty());
        assert_eq!(plan.actions, vec![(b"a".to_vec(), CheckoutAction::SetObjectId(Some(id(2))))]);
    }

    #[test]
    fn normal_mode_reports_conflict_and_does_not_apply() {
        let old = tree(vec![Entry::new(b"a.txt".to_vec(), id(1), EntryKind::RegularFile).unwrap()]);
        let target = tree(vec![Entry::new(b"a.txt".to_vec(), id(2), EntryKind::RegularFile).unwrap()]);
        let plan = plan_directory_checkout(
            &old,
            &target,
            |_| LocalState::Materialized { matches_committed: false },
            CheckoutMode::Normal,
        );
        assert_eq!(
            plan.conflicts,
            vec![Conflict { path: b"a.txt".to_vec(), kind: ConflictKind::Modified }]
        );
        assert!(plan.actions.is_empty());
    }

    #[test]
    fn force_mode_reports_conflict_but_still_applies() {
        let old = tree(vec![Entry::new(b"a.txt".to_vec(), id(1), EntryKind::RegularFile).unwrap()]);
        let target = tree(vec![Entry::new(b"a.txt".to_vec(), id(2), EntryKind::RegularFile).unwrap()]);
        let plan = plan_directory_checkout(
            &old,
            &target,
            |_| LocalState::Materialized { matches_committed: false },
            CheckoutMode::Force,
        );
        assert_eq!(plan.conflicts.len(), 1);
        assert_eq!(plan.actions, vec![(b"a.txt".to_vec(), CheckoutAction::SetObjectId(Some(id(2))))]);
    }

    #[test]
    fn materialized_matching_committed_hash_updates_cleanly() {
        let old = tree(vec![Entry::new(b"a.txt".to_vec(), id(1), EntryKind::RegularFile).unwrap()]);
        let target = tree(vec![Entry::new(b"a.txt".to_vec(), id(2), EntryKind::RegularFile).unwrap()]);
        let plan = plan_directory_checkout(
            &old,
            &target,
            |_| LocalState::Materialized { matches_committed: true },
            CheckoutMode::Normal,
        );
        assert!(plan.conflicts.is_empty());
        assert_eq!(plan.actions, vec![(b"a.txt".to_vec(), CheckoutAction::SetObjectId(Some(id(2))))]);
    }

    #[test]
    fn diff_reports_modified_added_removed() {
        let committed = tree(vec![
            Entry::new(b"keep.txt".to_vec(), id(1), EntryKind::RegularFile).unwrap(),
            Entry::new(b"gone.txt".to_vec(), id(2), EntryKind::RegularFile).unwrap(),
        ]);
        let working_names = vec![b"keep.txt".to_vec(), b"new.txt".to_vec()];
        let result = plan_directory_diff(
            &committed,
            |name| {
                if name == b"keep.txt" {
                    LocalState::Materialized { matches_committed: false }
                } else {
                    LocalState::Unmaterialized
                }
            },
            &working_names,
            |_| false,
        );
        assert_eq!(result.modified, vec![b"keep.txt".to_vec()]);
        assert_eq!(result.added, vec![b"new.txt".to_vec()]);
        assert_eq!(result.removed, vec![b"gone.txt".to_vec()]);
    }

    #[tokio::test]
    async fn write_materialize_diff_scenario() {
        use crate::backend::MemoryBackend;
        use crate::cache::{CacheConfig, InMemoryObjectCache};
        use crate::importqueue::pool::ImporterPool;
        use crate::importqueue::{BatchSizes, ImportRequestQueue};
        use crate::localstore::MemoryLocalStore;
        use crate::rootid::parse_root_id;

        let backend = Arc::new(MemoryBackend::new());
        let readme = Entry::new(b"README.md".to_vec(), id(1), EntryKind::RegularFile).unwrap();
        let root_tree = tree(vec![readme]);
        let root_id = parse_root_id(b"deadbeefdeadbeefdeadbeefdeadbeefdeadbeef");
        backend.seed_tree(id(0xAA), root_tree.clone());
        backend.seed_root(&root_id, id(0xAA));

        let queue = ImportRequestQueue::new(BatchSizes::default());
        let _pool = ImporterPool::spawn(1, queue.clone(), backend.clone(), None);

        let object_store = Arc::new(ObjectStore::new(
            Arc::new(MemoryLocalStore::new()),
            Arc::new(InMemoryObjectCache::new(CacheConfig::default())),
            queue,
            backend,
        ));

        let overlay_dir = tempfile::tempdir().unwrap();
        let mount = MountPoint::new(
            object_store,
            Arc::new(InodeMap::new()),
            Arc::new(Journal::new(1_000_000)),
            Arc::new(Overlay::new(overlay_dir.path().to_path_buf())),
            root_id.clone(),
            1,
        );

        let working_names = vec![b"README.md".to_vec()];
        let diff = mount
            .diff(
                &root_id,
                &working_names,
                |name| {
                    if name == b"README.md" {
                        LocalState::Materialized { matches_committed: false }
                    } else {
                        LocalState::Unmaterialized
                    }
                },
                |_| false,
            )
            .await
            .unwrap();
        assert_eq!(diff.modified, vec![b"README.md".to_vec()]);
        assert!(diff.added.is_empty());
        assert!(diff.removed.is_empty());
    }

    #[tokio::test]
    async fn force_checkout_unmaterializes_locally_materialized_entry() {
        use crate::backend::MemoryBackend;
        use crate::cache::{CacheConfig, InMemoryObjectCache};
        use crate::importqueue::pool::ImporterPool;
        use crate::importqueue::{BatchSizes, ImportRequestQueue};
        use crate::inodes::overlay::{ChildRef, OverlayDirEntry};
        use crate::inodes::{InodeKind, LoadedInode};
        use crate::localstore::MemoryLocalStore;
        use crate::rootid::parse_root_id;

        let backend = Arc::new(MemoryBackend::new());
        let old_entry = Entry::new(b"a.txt".to_vec(), id(1), EntryKind::RegularFile).unwrap();
        let old_tree = tree(vec![old_entry]);
        let old_root = parse_root_id(b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa");
        backend.seed_tree(id(0xA1), old_tree);
        backend.seed_root(&old_root, id(0xA1));

        let new_entry = Entry::new(b"a.txt".to_vec(), id(2), EntryKind::RegularFile).unwrap();
        let target_tree = tree(vec![new_entry]);
        let target_root = parse_root_id(b"bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb");
        backend.seed_tree(id(0xB2), target_tree);
        backend.seed_root(&target_root, id(0xB2));

        let queue = ImportRequestQueue::new(BatchSizes::default());
        let _pool = ImporterPool::spawn(1, queue.clone(), backend.clone(), None);

        let object_store = Arc::new(ObjectStore::new(
            Arc::new(MemoryLocalStore::new()),
            Arc::new(InMemoryObjectCache::new(CacheConfig::default())),
            queue,
            backend,
        ));

        let overlay_dir = tempfile::tempdir().unwrap();
        let inode_map = Arc::new(InodeMap::new());
        let overlay = Arc::new(Overlay::new(overlay_dir.path().to_path_buf()));

        // Simulate a.txt already having been written to locally: an overlay
        // entry pointing at it as Materialized, and a loaded inode to match.
        let child_inode = inode_map.allocate();
        inode_map.ensure_slot(child_inode);
        inode_map.finish_load(
            child_inode,
            LoadedInode {
                kind: InodeKind::File,
                materialization: Materialization::Materialized,
                parent: Some((ROOT_INODE, b"a.txt".to_vec())),
                kernel_refs: 0,
                last_access: std::time::Instant::now(),
                pending_overlay_writes: 0,
            },
        );
        overlay
            .add_child(
                ROOT_INODE,
                OverlayDirEntry {
                    name: b"a.txt".to_vec(),
                    child_inode,
                    kind: 0,
                    reference: ChildRef::Materialized,
                },
            )
            .await
            .unwrap();

        let mount = MountPoint::new(object_store, inode_map.clone(), Arc::new(Journal::new(1_000_000)), overlay.clone(), old_root, 1);

        let conflicts = mount
            .checkout(&target_root, CheckoutMode::Force, |_| LocalState::Materialized {
                matches_committed: false,
            })
            .await
            .unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(mount.current_root(), target_root);

        let entries = overlay.read_dir(ROOT_INODE).await.unwrap();
        let entry = entries.iter().find(|e| e.name == b"a.txt").unwrap();
        assert_eq!(entry.reference_id().unwrap(), Some(id(2)));

        inode_map.with_loaded(child_inode, |loaded| {
            assert_eq!(loaded.materialization, Materialization::Unmaterialized(id(2)));
        });
    }
}
