//! Deduplication layer on top of [super::InodeMap]: two lookups that
//! resolve to the same unmaterialized [ObjectId] share one inode number,
//! rather than minting a fresh one per path. Adapted from a single
//! `InodeData`-style enum keyed purely by digest to two per-kind tables
//! (tree vs file), since a
//! tree and a file can coincidentally hash to the same `ObjectId`.

use std::collections::HashMap;

use crate::inodes::InodeNumber;
use crate::ObjectId;

/// Maps an [ObjectId] for an unmaterialized object to the inode number
/// already assigned to it, per object kind.
#[derive(Default)]
pub struct InodeTracker {
    tree_by_id: HashMap<ObjectId, InodeNumber>,
    file_by_id: HashMap<ObjectId, InodeNumber>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackedKind {
    Tree,
    File,
}

impl InodeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, kind: TrackedKind) -> &HashMap<ObjectId, InodeNumber> {
        match kind {
            TrackedKind::Tree => &self.tree_by_id,
            TrackedKind::File => &self.file_by_id,
        }
    }

    fn table_mut(&mut self, kind: TrackedKind) -> &mut HashMap<ObjectId, InodeNumber> {
        match kind {
            TrackedKind::Tree => &mut self.tree_by_id,
            TrackedKind::File => &mut self.file_by_id,
        }
    }

    /// Returns the inode already assigned to `id`, if any.
    pub fn get(&self, kind: TrackedKind, id: &ObjectId) -> Option<InodeNumber> {
        self.table(kind).get(id).copied()
    }

    /// Records that `id` is now tracked under `inode`. Overwrites any
    /// prior mapping for the same id (used when a materialized inode's
    /// checkout restores it to reference a different source-control
    /// object).
    pub fn put(&mut self, kind: TrackedKind, id: ObjectId, inode: InodeNumber) {
        self.table_mut(kind).insert(id, inode);
    }

    /// Replaces the inode tracked for `id`, returning the one it replaced.
    pub fn replace(&mut self, kind: TrackedKind, id: ObjectId, inode: InodeNumber) -> Option<InodeNumber> {
        self.table_mut(kind).insert(id, inode)
    }

    /// Drops the tracked mapping for `id` — called once an inode is
    /// materialized and no longer backed by this id at all.
    pub fn remove(&mut self, kind: TrackedKind, id: &ObjectId) {
        self.table_mut(kind).remove(id);
    }

    /// Looks up `id`, or calls `allocate` to mint a fresh inode number and
    /// tracks it, returning whichever inode is now associated with `id`.
    pub fn get_or_insert_with(&mut self, kind: TrackedKind, id: ObjectId, allocate: impl FnOnce() -> InodeNumber) -> InodeNumber {
        if let Some(existing) = self.table(kind).get(&id) {
            return *existing;
        }
        let inode = allocate();
        self.table_mut(kind).insert(id, inode);
        inode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> ObjectId {
        ObjectId::try_from(vec![byte; 20]).unwrap()
    }

    #[test]
    fn get_nonexistent() {
        let tracker = InodeTracker::new();
        assert_eq!(tracker.get(TrackedKind::File, &id(1)), None);
    }

    #[test]
    fn put_and_get_file() {
        let mut tracker = InodeTracker::new();
        tracker.put(TrackedKind::File, id(1), 42);
        assert_eq!(tracker.get(TrackedKind::File, &id(1)), Some(42));
    }

    #[test]
    fn tree_and_file_tables_are_independent() {
        let mut tracker = InodeTracker::new();
        tracker.put(TrackedKind::File, id(1), 5);
        tracker.put(TrackedKind::Tree, id(1), 6);
        assert_eq!(tracker.get(TrackedKind::File, &id(1)), Some(5));
        assert_eq!(tracker.get(TrackedKind::Tree, &id(1)), Some(6));
    }

    #[test]
    fn get_or_insert_with_only_allocates_once() {
        let mut tracker = InodeTracker::new();
        let mut next = 10;
        let mut allocate = || {
            next += 1;
            next
        };
        let first = tracker.get_or_insert_with(TrackedKind::File, id(1), &mut allocate);
        let second = tracker.get_or_insert_with(TrackedKind::File, id(1), &mut allocate);
        assert_eq!(first, second);
    }
}
