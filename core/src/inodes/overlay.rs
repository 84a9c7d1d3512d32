//! On-disk storage for materialized inode state: file bytes for regular
//! files, and a serialized entry table for directories. Generalizes a
//! read-only, by-inode on-disk layout (the kind used to back a FUSE view
//! of an immutable store) to one that also accepts writes, since
//! this spec's mounts are a writable working copy.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::inodes::InodeNumber;
use crate::tree::EntryKind;
use crate::{Error, ObjectId, Result};

/// Whether a directory entry's child inode is itself materialized, or is
/// still just a reference to an unfetched source-control object.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ChildRef {
    Materialized,
    Reference(Vec<u8>),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OverlayDirEntry {
    pub name: Vec<u8>,
    pub child_inode: InodeNumber,
    pub kind: u8,
    pub reference: ChildRef,
}

impl OverlayDirEntry {
    pub fn entry_kind(&self) -> Result<EntryKind> {
        match self.kind {
            0 => Ok(EntryKind::RegularFile),
            1 => Ok(EntryKind::ExecutableFile),
            2 => Ok(EntryKind::Symlink),
            3 => Ok(EntryKind::Directory),
            _ => Err(Error::MalformedObject("invalid overlay entry kind".into())),
        }
    }

    pub fn reference_id(&self) -> Result<Option<ObjectId>> {
        match &self.reference {
            ChildRef::Materialized => Ok(None),
            ChildRef::Reference(bytes) => Ok(Some(ObjectId::try_from(bytes.clone())?)),
        }
    }
}

/// Root of a mount's on-disk overlay storage, rooted at
/// `<client dir>/local`.
pub struct Overlay {
    root: PathBuf,
}

impl Overlay {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn file_path(&self, inode: InodeNumber) -> PathBuf {
        self.root.join(format!("{inode:x}"))
    }

    fn dir_path(&self, inode: InodeNumber) -> PathBuf {
        self.root.join(format!("{inode:x}.dir"))
    }

    async fn ensure_root(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    pub async fn open_file(&self, inode: InodeNumber) -> Result<tokio::fs::File> {
        self.ensure_root().await?;
        Ok(tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(self.file_path(inode))
            .await?)
    }

    pub async fn read_file(&self, inode: InodeNumber) -> Result<Vec<u8>> {
        match tokio::fs::read(self.file_path(inode)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn write_file(&self, inode: InodeNumber, offset: u64, data: &[u8]) -> Result<()> {
        let mut file = self.open_file(inode).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    pub async fn truncate(&self, inode: InodeNumber, len: u64) -> Result<()> {
        let file = self.open_file(inode).await?;
        file.set_len(len).await?;
        Ok(())
    }

    pub async fn stat_file(&self, inode: InodeNumber) -> Result<std::fs::Metadata> {
        Ok(tokio::fs::metadata(self.file_path(inode)).await?)
    }

    pub async fn read_dir(&self, inode: InodeNumber) -> Result<Vec<OverlayDirEntry>> {
        match tokio::fs::read(self.dir_path(inode)).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| Error::StoreCorrupt(e.to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_dir_entries(&self, inode: InodeNumber, entries: &[OverlayDirEntry]) -> Result<()> {
        self.ensure_root().await?;
        let bytes = serde_json::to_vec(entries).map_err(|e| Error::StoreCorrupt(e.to_string()))?;
        tokio::fs::write(self.dir_path(inode), bytes).await?;
        Ok(())
    }

    pub async fn add_child(&self, inode: InodeNumber, entry: OverlayDirEntry) -> Result<()> {
        let mut entries = self.read_dir(inode).await?;
        if entries.iter().any(|e| e.name == entry.name) {
            return Err(Error::Conflict(format!(
                "entry {:?} already exists",
                String::from_utf8_lossy(&entry.name)
            )));
        }
        entries.push(entry);
        self.write_dir_entries(inode, &entries).await
    }

    pub async fn remove_child(&self, inode: InodeNumber, name: &[u8]) -> Result<()> {
        let mut entries = self.read_dir(inode).await?;
        let before = entries.len();
        entries.retain(|e| e.name != name);
        if entries.len() == before {
            return Err(Error::NotFound(String::from_utf8_lossy(name).into_owned()));
        }
        self.write_dir_entries(inode, &entries).await
    }

    pub async fn rename_child(
        &self,
        old_parent: InodeNumber,
        old_name: &[u8],
        new_parent: InodeNumber,
        new_name: &[u8],
    ) -> Result<()> {
        let mut old_entries = self.read_dir(old_parent).await?;
        let idx = old_entries
            .iter()
            .position(|e| e.name == old_name)
            .ok_or_else(|| Error::NotFound(String::from_utf8_lossy(old_name).into_owned()))?;
        let mut entry = old_entries.remove(idx);
        entry.name = new_name.to_vec();

        if old_parent == new_parent {
            old_entries.retain(|e| e.name != new_name);
            old_entries.push(entry);
            self.write_dir_entries(old_parent, &old_entries).await
        } else {
            self.write_dir_entries(old_parent, &old_entries).await?;
            let mut new_entries = self.read_dir(new_parent).await?;
            new_entries.retain(|e| e.name != new_name);
            new_entries.push(entry);
            self.write_dir_entries(new_parent, &new_entries).await
        }
    }

    /// Overwrites `inode`'s entire entry table. Used by checkout to apply a
    /// [crate::mount::DirectoryCheckoutPlan] against the overlay directly,
    /// rather than through the single-entry `add_child`/`remove_child`
    /// calls the FUSE path uses.
    pub async fn replace_dir_entries(&self, inode: InodeNumber, entries: Vec<OverlayDirEntry>) -> Result<()> {
        self.write_dir_entries(inode, &entries).await
    }

    pub async fn remove_inode(&self, inode: InodeNumber) -> Result<()> {
        for path in [self.file_path(inode), self.dir_path(inode)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_file_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = Overlay::new(dir.path().to_path_buf());
        overlay.write_file(42, 0, b"hello").await.unwrap();
        assert_eq!(overlay.read_file(42).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn truncate_shrinks_file() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = Overlay::new(dir.path().to_path_buf());
        overlay.write_file(1, 0, b"hello world").await.unwrap();
        overlay.truncate(1, 5).await.unwrap();
        assert_eq!(overlay.read_file(1).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn add_and_remove_child() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = Overlay::new(dir.path().to_path_buf());
        overlay
            .add_child(
                1,
                OverlayDirEntry {
                    name: b"a.txt".to_vec(),
                    child_inode: 2,
                    kind: 0,
                    reference: ChildRef::Materialized,
                },
            )
            .await
            .unwrap();
        assert_eq!(overlay.read_dir(1).await.unwrap().len(), 1);
        overlay.remove_child(1, b"a.txt").await.unwrap();
        assert_eq!(overlay.read_dir(1).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn rename_moves_entry_between_directories() {
        let dir = tempfile::tempdir().unwrap();
        let overlay = Overlay::new(dir.path().to_path_buf());
        overlay
            .add_child(
                1,
                OverlayDirEntry {
                    name: b"a.txt".to_vec(),
                    child_inode: 2,
                    kind: 0,
                    reference: ChildRef::Materialized,
                },
            )
            .await
            .unwrap();
        overlay.rename_child(1, b"a.txt", 3, b"b.txt").await.unwrap();
        assert!(overlay.read_dir(1).await.unwrap().is_empty());
        assert_eq!(overlay.read_dir(3).await.unwrap()[0].name, b"b.txt");
    }
}
