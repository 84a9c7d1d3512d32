//! The inode arena: `InodeNumber -> (kind, load state, in-memory inode)`.
//! Uses an `inode_tracker`/`InodeData`-style split, generalized from a
//! read-only materialized-by-construction model to one that tracks
//! load state and a durable materialization bit per inode.

pub mod overlay;
pub mod tracker;

pub use overlay::Overlay;
pub use tracker::InodeTracker;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::ObjectId;

pub type InodeNumber = u64;

/// The root inode is always inode 1, always loaded, always materialized
/// (its own contents may differ from the committed tree even when nothing
/// under it has been touched, since entries can be added/removed at the
/// top level).
pub const ROOT_INODE: InodeNumber = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InodeKind {
    Tree,
    File,
}

/// Where an inode's in-memory representation currently stands. Unloaded
/// inodes carry only an id hint; loading inodes have waiters attached;
/// loaded inodes have live data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoadState {
    Unloaded,
    Loading,
    Loaded,
}

/// An inode is unmaterialized (backed by a source-control object, exactly
/// one non-null [ObjectId]) or materialized (backed by the on-disk
/// [Overlay], no `ObjectId`). This is a durable state transition: once
/// materialized, an inode stays materialized until checkout explicitly
/// resets it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Materialization {
    Unmaterialized(ObjectId),
    Materialized,
}

/// Live, in-memory state for a loaded inode.
pub struct LoadedInode {
    pub kind: InodeKind,
    pub materialization: Materialization,
    pub parent: Option<(InodeNumber, Vec<u8>)>,
    pub kernel_refs: u64,
    pub last_access: std::time::Instant,
    /// Count of overlay writes against this inode that have started but not
    /// yet completed. Guards unload against racing a write that hasn't
    /// landed on disk yet (§4.8: unload must be a no-op for inodes with
    /// unflushed overlay writes).
    pub pending_overlay_writes: u64,
}

/// Holds an inode ineligible for unload until dropped. See
/// [InodeMap::guard_overlay_write].
pub struct OverlayWriteGuard {
    map: Arc<InodeMap>,
    inode: InodeNumber,
}

impl Drop for OverlayWriteGuard {
    fn drop(&mut self) {
        self.map.end_overlay_write(self.inode);
    }
}

struct Slot {
    state: LoadState,
    loaded: Option<LoadedInode>,
    waiters: Arc<Notify>,
}

/// `InodeNumber -> (kind, load state, optional in-memory inode)`, guarded
/// by a short-held lock on the table itself; per-inode work (loading from
/// the object store) happens without holding that lock, coordinated
/// through each slot's own [Notify].
///
/// Invariant: inode numbers are never reused within a mount, including
/// across takeover — `next_inode` only ever increases, and a takeover
/// handoff restores it from the incoming high-water mark rather than
/// resetting it.
pub struct InodeMap {
    slots: Mutex<std::collections::HashMap<InodeNumber, Slot>>,
    next_inode: std::sync::atomic::AtomicU64,
}

impl InodeMap {
    pub fn new() -> Self {
        let mut slots = std::collections::HashMap::new();
        slots.insert(
            ROOT_INODE,
            Slot {
                state: LoadState::Loaded,
                loaded: Some(LoadedInode {
                    kind: InodeKind::Tree,
                    materialization: Materialization::Materialized,
                    parent: None,
                    kernel_refs: 1,
                    last_access: std::time::Instant::now(),
                    pending_overlay_writes: 0,
                }),
                waiters: Arc::new(Notify::new()),
            },
        );
        Self {
            slots: Mutex::new(slots),
            next_inode: std::sync::atomic::AtomicU64::new(ROOT_INODE + 1),
        }
    }

    /// Restores the inode-number high-water mark from a takeover handoff,
    /// so freshly allocated inodes never collide with ones the outgoing
    /// process already handed to the kernel.
    pub fn restore_high_water_mark(&self, high_water_mark: InodeNumber) {
        let current = self.next_inode.load(std::sync::atomic::Ordering::SeqCst);
        if high_water_mark >= current {
            self.next_inode
                .store(high_water_mark + 1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    pub fn allocate(&self) -> InodeNumber {
        self.next_inode.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }

    /// Looks up an inode's load state, creating an `Unloaded` slot for it
    /// if this is the first time it's been referenced. The caller drives
    /// the actual transition through [InodeMap::begin_load] /
    /// [InodeMap::finish_load].
    pub fn ensure_slot(&self, inode: InodeNumber) {
        self.slots.lock().entry(inode).or_insert_with(|| Slot {
            state: LoadState::Unloaded,
            loaded: None,
            waiters: Arc::new(Notify::new()),
        });
    }

    pub fn state(&self, inode: InodeNumber) -> Option<LoadState> {
        self.slots.lock().get(&inode).map(|s| s.state.clone())
    }

    /// If unloaded, transitions to `Loading` and returns `true` (caller
    /// must now load and call [InodeMap::finish_load]). If already loading
    /// or loaded, returns `false` and the caller should await the notify
    /// handle from [InodeMap::waiter].
    pub fn begin_load(&self, inode: InodeNumber) -> bool {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(&inode).expect("ensure_slot called first");
        if slot.state == LoadState::Unloaded {
            slot.state = LoadState::Loading;
            true
        } else {
            false
        }
    }

    pub fn waiter(&self, inode: InodeNumber) -> Arc<Notify> {
        self.slots
            .lock()
            .get(&inode)
            .map(|s| s.waiters.clone())
            .expect("ensure_slot called first")
    }

    pub fn finish_load(&self, inode: InodeNumber, loaded: LoadedInode) {
        let mut slots = self.slots.lock();
        let slot = slots.get_mut(&inode).expect("ensure_slot called first");
        slot.state = LoadState::Loaded;
        slot.loaded = Some(loaded);
        slot.waiters.notify_waiters();
    }

    pub fn with_loaded<R>(&self, inode: InodeNumber, f: impl FnOnce(&LoadedInode) -> R) -> Option<R> {
        self.slots.lock().get(&inode).and_then(|s| s.loaded.as_ref().map(f))
    }

    pub fn with_loaded_mut<R>(&self, inode: InodeNumber, f: impl FnOnce(&mut LoadedInode) -> R) -> Option<R> {
        self.slots.lock().get_mut(&inode).and_then(|s| s.loaded.as_mut().map(f))
    }

    /// Marks the start of an overlay write against `inode`, so a concurrent
    /// unload sweep skips it until [InodeMap::end_overlay_write] clears the
    /// guard. Callers should pair this with `end_overlay_write` around every
    /// `Overlay` mutation, including on the error path.
    pub fn begin_overlay_write(&self, inode: InodeNumber) {
        self.with_loaded_mut(inode, |loaded| loaded.pending_overlay_writes += 1);
    }

    pub fn end_overlay_write(&self, inode: InodeNumber) {
        self.with_loaded_mut(inode, |loaded| {
            loaded.pending_overlay_writes = loaded.pending_overlay_writes.saturating_sub(1);
        });
    }

    /// RAII form of [InodeMap::begin_overlay_write]: clears the guard on
    /// drop, including on an early return from `?`, so callers doing an
    /// overlay mutation don't need to remember to pair up the error path.
    pub fn guard_overlay_write(self: &Arc<Self>, inode: InodeNumber) -> OverlayWriteGuard {
        self.begin_overlay_write(inode);
        OverlayWriteGuard { map: self.clone(), inode }
    }

    /// Promotes `inode` (and recursively its ancestors up to the root) to
    /// materialized. The first write to a file inode or first structural
    /// change to a tree inode calls this; the root is always materialized
    /// already, terminating the walk.
    pub fn materialize_chain(&self, inode: InodeNumber) {
        let mut current = inode;
        loop {
            let parent = {
                let mut slots = self.slots.lock();
                let Some(slot) = slots.get_mut(&current) else { break };
                let Some(loaded) = slot.loaded.as_mut() else { break };
                let already_materialized = matches!(loaded.materialization, Materialization::Materialized);
                loaded.materialization = Materialization::Materialized;
                if already_materialized {
                    break;
                }
                loaded.parent.as_ref().map(|(p, _)| *p)
            };
            match parent {
                Some(p) => current = p,
                None => break,
            }
        }
    }

    /// Periodic unload: drops loaded state for inodes with zero kernel
    /// refs whose last access predates `cutoff`. No-op for an inode with
    /// pending waiters (state is `Loading`, not `Loaded` — skipped
    /// implicitly since only `Loaded` slots are eligible), for one with an
    /// unflushed overlay write in flight, or for one that is still a loaded
    /// inode's parent (invariant 2: a loaded inode's parent is loaded).
    pub fn unload_older_than(&self, cutoff: std::time::Instant) -> usize {
        let mut slots = self.slots.lock();

        // Reverse-link scan: anything currently loaded and parented under
        // `p` makes `p` ineligible for unload, however old or unreferenced
        // `p` itself looks.
        let parents_of_loaded_children: std::collections::HashSet<InodeNumber> = slots
            .values()
            .filter(|slot| slot.state == LoadState::Loaded)
            .filter_map(|slot| slot.loaded.as_ref())
            .filter_map(|loaded| loaded.parent.as_ref().map(|(parent, _)| *parent))
            .collect();

        let mut unloaded = 0;
        for (inode, slot) in slots.iter_mut() {
            if *inode == ROOT_INODE {
                continue;
            }
            if slot.state != LoadState::Loaded {
                continue;
            }
            if parents_of_loaded_children.contains(inode) {
                continue;
            }
            let Some(loaded) = &slot.loaded else { continue };
            if loaded.kernel_refs == 0 && loaded.pending_overlay_writes == 0 && loaded.last_access < cutoff {
                slot.loaded = None;
                slot.state = LoadState::Unloaded;
                unloaded += 1;
            }
        }
        unloaded
    }
}

impl Default for InodeMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_loaded_and_materialized() {
        let map = InodeMap::new();
        assert_eq!(map.state(ROOT_INODE), Some(LoadState::Loaded));
        map.with_loaded(ROOT_INODE, |inode| {
            assert_eq!(inode.materialization, Materialization::Materialized);
        });
    }

    #[test]
    fn first_lookup_transitions_unloaded_to_loading() {
        let map = InodeMap::new();
        let inode = map.allocate();
        map.ensure_slot(inode);
        assert!(map.begin_load(inode));
        assert!(!map.begin_load(inode)); // second caller attaches as waiter instead
    }

    #[test]
    fn materialize_chain_walks_to_root() {
        let map = InodeMap::new();
        let child = map.allocate();
        map.ensure_slot(child);
        map.finish_load(
            child,
            LoadedInode {
                kind: InodeKind::File,
                materialization: Materialization::Unmaterialized(ObjectId::try_from(vec![0u8; 20]).unwrap()),
                parent: Some((ROOT_INODE, b"file.txt".to_vec())),
                kernel_refs: 1,
                last_access: std::time::Instant::now(),
                pending_overlay_writes: 0,
            },
        );
        map.materialize_chain(child);
        map.with_loaded(child, |inode| {
            assert_eq!(inode.materialization, Materialization::Materialized);
        });
    }

    #[test]
    fn high_water_mark_prevents_collisions_after_takeover() {
        let map = InodeMap::new();
        let a = map.allocate();
        map.restore_high_water_mark(a + 100);
        let b = map.allocate();
        assert!(b > a + 100);
    }

    #[test]
    fn unload_skips_inodes_with_kernel_refs() {
        let map = InodeMap::new();
        let inode = map.allocate();
        map.ensure_slot(inode);
        let old_access = std::time::Instant::now() - std::time::Duration::from_secs(3600);
        map.finish_load(
            inode,
            LoadedInode {
                kind: InodeKind::File,
                materialization: Materialization::Materialized,
                parent: Some((ROOT_INODE, b"x".to_vec())),
                kernel_refs: 1,
                last_access: old_access,
                pending_overlay_writes: 0,
            },
        );
        let cutoff = std::time::Instant::now() - std::time::Duration::from_secs(60);
        assert_eq!(map.unload_older_than(cutoff), 0);
        map.with_loaded_mut(inode, |l| l.kernel_refs = 0);
        assert_eq!(map.unload_older_than(cutoff), 1);
        assert_eq!(map.state(inode), Some(LoadState::Unloaded));
    }

    #[test]
    fn unload_skips_parents_of_loaded_children() {
        let map = InodeMap::new();
        let parent = map.allocate();
        map.ensure_slot(parent);
        let old_access = std::time::Instant::now() - std::time::Duration::from_secs(3600);
        map.finish_load(
            parent,
            LoadedInode {
                kind: InodeKind::Directory,
                materialization: Materialization::Materialized,
                parent: Some((ROOT_INODE, b"dir".to_vec())),
                kernel_refs: 0,
                last_access: old_access,
                pending_overlay_writes: 0,
            },
        );
        let child = map.allocate();
        map.ensure_slot(child);
        map.finish_load(
            child,
            LoadedInode {
                kind: InodeKind::File,
                materialization: Materialization::Materialized,
                parent: Some((parent, b"file.txt".to_vec())),
                kernel_refs: 0,
                last_access: old_access,
                pending_overlay_writes: 0,
            },
        );
        let cutoff = std::time::Instant::now() - std::time::Duration::from_secs(60);
        // Parent has a loaded child and must not be unloaded out from under it,
        // even though its own kernel_refs/last_access would otherwise qualify.
        assert_eq!(map.unload_older_than(cutoff), 1);
        assert_eq!(map.state(parent), Some(LoadState::Loaded));
        assert_eq!(map.state(child), Some(LoadState::Unloaded));
    }

    #[test]
    fn unload_skips_inodes_with_pending_overlay_writes() {
        let map = InodeMap::new();
        let inode = map.allocate();
        map.ensure_slot(inode);
        let old_access = std::time::Instant::now() - std::time::Duration::from_secs(3600);
        map.finish_load(
            inode,
            LoadedInode {
                kind: InodeKind::File,
                materialization: Materialization::Materialized,
                parent: Some((ROOT_INODE, b"x".to_vec())),
                kernel_refs: 0,
                last_access: old_access,
                pending_overlay_writes: 0,
            },
        );
        map.begin_overlay_write(inode);
        let cutoff = std::time::Instant::now() - std::time::Duration::from_secs(60);
        assert_eq!(map.unload_older_than(cutoff), 0);
        map.end_overlay_write(inode);
        assert_eq!(map.unload_older_than(cutoff), 1);
    }
}
