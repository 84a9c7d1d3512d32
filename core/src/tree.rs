//! In-memory representation of directory trees and blob metadata, and their
//! conversion to/from the wire ([crate::proto]) shape backends exchange them
//! in. Entries are always
//! kept name-sorted, and construction validates names up front so nothing
//! downstream has to re-check.

use crate::proto;
use crate::{Error, ObjectId};

/// What an [Entry] names.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    RegularFile,
    ExecutableFile,
    Symlink,
    Directory,
}

impl EntryKind {
    pub fn is_directory(self) -> bool {
        matches!(self, EntryKind::Directory)
    }
}

/// A single named child of a [Tree].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    name: Vec<u8>,
    id: ObjectId,
    kind: EntryKind,
}

impl Entry {
    pub fn new(name: Vec<u8>, id: ObjectId, kind: EntryKind) -> Result<Self, Error> {
        validate_name(&name)?;
        Ok(Self { name, id, kind })
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }
}

/// Rejects names that can't exist as a single path component: empty, `.`,
/// `..`, or containing a path separator or NUL.
fn validate_name(name: &[u8]) -> Result<(), Error> {
    if name.is_empty() || name == b"." || name == b".." {
        return Err(Error::MalformedObject("invalid entry name".into()));
    }
    if name.contains(&b'/') || name.contains(&0) {
        return Err(Error::MalformedObject("invalid entry name".into()));
    }
    Ok(())
}

/// An immutable, name-sorted directory listing. Two trees with identical
/// entries (same name, id, kind, in the same order) are the same tree and
/// will hash to the same [ObjectId] at the object-store layer.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Tree {
    entries: Vec<Entry>,
}

impl Tree {
    /// Builds a tree from an arbitrary-order entry list, sorting by name.
    /// Rejects duplicate names.
    pub fn from_entries(mut entries: Vec<Entry>) -> Result<Self, Error> {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        for pair in entries.windows(2) {
            if pair[0].name == pair[1].name {
                return Err(Error::MalformedObject(format!(
                    "duplicate entry name {:?}",
                    String::from_utf8_lossy(&pair[0].name)
                )));
            }
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up a child by exact name. Entries are sorted, so this is a
    /// binary search rather than a linear scan.
    pub fn get(&self, name: &[u8]) -> Option<&Entry> {
        self.entries
            .binary_search_by(|e| e.name.as_slice().cmp(name))
            .ok()
            .map(|idx| &self.entries[idx])
    }
}

impl From<&Entry> for proto::EntryProto {
    fn from(e: &Entry) -> Self {
        proto::EntryProto {
            name: e.name.clone().into(),
            id: e.id.as_bytes().to_vec().into(),
            kind: proto::EntryKindProto::from(e.kind) as i32,
        }
    }
}

impl From<EntryKind> for proto::EntryKindProto {
    fn from(kind: EntryKind) -> Self {
        match kind {
            EntryKind::RegularFile => proto::EntryKindProto::RegularFile,
            EntryKind::ExecutableFile => proto::EntryKindProto::ExecutableFile,
            EntryKind::Symlink => proto::EntryKindProto::Symlink,
            EntryKind::Directory => proto::EntryKindProto::Directory,
        }
    }
}

impl TryFrom<proto::EntryProto> for Entry {
    type Error = Error;

    fn try_from(proto: proto::EntryProto) -> Result<Self, Self::Error> {
        let kind = match proto::EntryKindProto::try_from(proto.kind)
            .map_err(|_| Error::MalformedObject("invalid entry kind".into()))?
        {
            proto::EntryKindProto::RegularFile => EntryKind::RegularFile,
            proto::EntryKindProto::ExecutableFile => EntryKind::ExecutableFile,
            proto::EntryKindProto::Symlink => EntryKind::Symlink,
            proto::EntryKindProto::Directory => EntryKind::Directory,
            proto::EntryKindProto::Unspecified => {
                return Err(Error::MalformedObject("unspecified entry kind".into()))
            }
        };
        let id = ObjectId::try_from(proto.id.to_vec())?;
        Entry::new(proto.name.to_vec(), id, kind)
    }
}

impl From<&Tree> for proto::TreeProto {
    fn from(tree: &Tree) -> Self {
        proto::TreeProto {
            entries: tree.entries.iter().map(proto::EntryProto::from).collect(),
        }
    }
}

impl TryFrom<proto::TreeProto> for Tree {
    type Error = Error;

    fn try_from(proto: proto::TreeProto) -> Result<Self, Self::Error> {
        let entries = proto
            .entries
            .into_iter()
            .map(Entry::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        // Backends are expected to send entries already sorted; re-sorting
        // here is defense against a misbehaving backend, not the common case.
        Tree::from_entries(entries)
    }
}

/// Metadata about a blob that's cheap to cache without the blob's contents:
/// size (for getattr) and the content hash used to validate the blob once
/// fetched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobMetadata {
    pub sha1: [u8; 20],
    pub size: u64,
}

impl From<&BlobMetadata> for proto::BlobMetadataProto {
    fn from(m: &BlobMetadata) -> Self {
        proto::BlobMetadataProto {
            sha1: m.sha1.to_vec().into(),
            size: m.size,
        }
    }
}

impl TryFrom<proto::BlobMetadataProto> for BlobMetadata {
    type Error = Error;

    fn try_from(proto: proto::BlobMetadataProto) -> Result<Self, Self::Error> {
        let sha1: [u8; 20] = proto.sha1.as_ref().try_into().map_err(|_| {
            Error::MalformedObject("blob metadata sha1 must be 20 bytes".into())
        })?;
        Ok(Self {
            sha1,
            size: proto.size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> ObjectId {
        ObjectId::try_from(vec![byte; 20]).unwrap()
    }

    #[test]
    fn sorts_entries_by_name() {
        let tree = Tree::from_entries(vec![
            Entry::new(b"b".to_vec(), id(2), EntryKind::RegularFile).unwrap(),
            Entry::new(b"a".to_vec(), id(1), EntryKind::RegularFile).unwrap(),
        ])
        .unwrap();
        assert_eq!(tree.entries()[0].name(), b"a");
        assert_eq!(tree.entries()[1].name(), b"b");
    }

    #[test]
    fn rejects_duplicate_names() {
        let result = Tree::from_entries(vec![
            Entry::new(b"a".to_vec(), id(1), EntryKind::RegularFile).unwrap(),
            Entry::new(b"a".to_vec(), id(2), EntryKind::RegularFile).unwrap(),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn rejects_invalid_names() {
        assert!(Entry::new(b"".to_vec(), id(1), EntryKind::RegularFile).is_err());
        assert!(Entry::new(b".".to_vec(), id(1), EntryKind::RegularFile).is_err());
        assert!(Entry::new(b"..".to_vec(), id(1), EntryKind::RegularFile).is_err());
        assert!(Entry::new(b"a/b".to_vec(), id(1), EntryKind::RegularFile).is_err());
    }

    #[test]
    fn get_finds_by_name() {
        let tree = Tree::from_entries(vec![
            Entry::new(b"foo".to_vec(), id(1), EntryKind::RegularFile).unwrap(),
            Entry::new(b"bar".to_vec(), id(2), EntryKind::Directory).unwrap(),
        ])
        .unwrap();
        assert_eq!(tree.get(b"foo").unwrap().id(), &id(1));
        assert!(tree.get(b"missing").is_none());
    }

    #[test]
    fn roundtrips_through_proto() {
        let tree = Tree::from_entries(vec![
            Entry::new(b"foo".to_vec(), id(1), EntryKind::Symlink).unwrap(),
        ])
        .unwrap();
        let proto = proto::TreeProto::from(&tree);
        let back = Tree::try_from(proto).unwrap();
        assert_eq!(tree, back);
    }
}
