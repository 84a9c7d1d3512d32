//! Persistent, ordered key-value storage partitioned into named column
//! families (`blobs`, `trees`, `blob_metadata`, `proxy_hashes`,
//! `commit_to_tree`, `ephemeral`), unified into a single trait here since
//! every selectable storage engine accesses them uniformly.

mod memory;
mod redb_store;
mod sled_store;

pub use memory::MemoryLocalStore;
pub use redb_store::RedbLocalStore;
pub use sled_store::SledLocalStore;

use crate::Result;
use tonic::async_trait;

/// A named partition within a [LocalStore]. Kept as an enum rather than a
/// free-form string so a typo can't silently open a fresh, empty partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ColumnFamily {
    Blobs,
    Trees,
    BlobMetadata,
    ProxyHashes,
    CommitToTree,
    Ephemeral,
}

impl ColumnFamily {
    pub const ALL: [ColumnFamily; 6] = [
        ColumnFamily::Blobs,
        ColumnFamily::Trees,
        ColumnFamily::BlobMetadata,
        ColumnFamily::ProxyHashes,
        ColumnFamily::CommitToTree,
        ColumnFamily::Ephemeral,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnFamily::Blobs => "blobs",
            ColumnFamily::Trees => "trees",
            ColumnFamily::BlobMetadata => "blob_metadata",
            ColumnFamily::ProxyHashes => "proxy_hashes",
            ColumnFamily::CommitToTree => "commit_to_tree",
            ColumnFamily::Ephemeral => "ephemeral",
        }
    }
}

/// A single write within a [LocalStore::batch_write] call. `None` deletes
/// the key; `Some` upserts it.
pub struct BatchEntry {
    pub cf: ColumnFamily,
    pub key: Vec<u8>,
    pub value: Option<Vec<u8>>,
}

impl BatchEntry {
    pub fn put(cf: ColumnFamily, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            cf,
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn delete(cf: ColumnFamily, key: impl Into<Vec<u8>>) -> Self {
        Self {
            cf,
            key: key.into(),
            value: None,
        }
    }
}

/// Name of the marker file written into a fresh on-disk store directory,
/// recording which engine created it. The backend selection is immutable
/// for the life of a directory: reopening with a different engine is a
/// `StoreCorrupt`, not a silent reinterpretation of the bytes.
const ENGINE_MARKER_FILE: &str = "ENGINE";

pub(crate) fn check_or_write_engine_marker(dir: &std::path::Path, engine: &str) -> Result<()> {
    use std::io::{Read, Write};

    std::fs::create_dir_all(dir)?;
    let marker_path = dir.join(ENGINE_MARKER_FILE);
    match std::fs::File::open(&marker_path) {
        Ok(mut f) => {
            let mut contents = String::new();
            f.read_to_string(&mut contents)?;
            if contents.trim() != engine {
                return Err(crate::Error::StoreCorrupt(format!(
                    "directory {} was created with engine {:?}, refusing to reopen with {:?}",
                    dir.display(),
                    contents.trim(),
                    engine
                )));
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let mut f = std::fs::File::create(&marker_path)?;
            f.write_all(engine.as_bytes())?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// A persistent ordered key-value store. Implementations are selected once
/// per on-disk state directory; switching implementations against an
/// existing directory must fail rather than silently reinterpret the bytes
/// (see the per-implementation marker-file check).
///
/// Reads observe the most recent completed write to the same key on the
/// same process. `batch_write` is atomic within a single column family and
/// ordered (though not necessarily atomic) across families.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn get(&self, cf: ColumnFamily, key: &[u8]) -> Result<Option<Vec<u8>>>;

    async fn put(&self, cf: ColumnFamily, key: &[u8], value: Vec<u8>) -> Result<()> {
        self.batch_write(vec![BatchEntry::put(cf, key.to_vec(), value)])
            .await
    }

    async fn batch_write(&self, entries: Vec<BatchEntry>) -> Result<()>;

    async fn clear(&self, cf: ColumnFamily) -> Result<()>;

    async fn compact(&self, cf: ColumnFamily) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod conformance {
    //! Shared test suite run against every [LocalStore] implementation, so
    //! a new backend can't drift from the contract the others satisfy.
    use super::*;

    pub async fn get_put_roundtrip(store: &dyn LocalStore) {
        assert_eq!(store.get(ColumnFamily::Blobs, b"missing").await.unwrap(), None);
        store
            .put(ColumnFamily::Blobs, b"key", b"value".to_vec())
            .await
            .unwrap();
        assert_eq!(
            store.get(ColumnFamily::Blobs, b"key").await.unwrap(),
            Some(b"value".to_vec())
        );
    }

    pub async fn column_families_are_isolated(store: &dyn LocalStore) {
        store
            .put(ColumnFamily::Blobs, b"key", b"blob-value".to_vec())
            .await
            .unwrap();
        store
            .put(ColumnFamily::Trees, b"key", b"tree-value".to_vec())
            .await
            .unwrap();
        assert_eq!(
            store.get(ColumnFamily::Blobs, b"key").await.unwrap(),
            Some(b"blob-value".to_vec())
        );
        assert_eq!(
            store.get(ColumnFamily::Trees, b"key").await.unwrap(),
            Some(b"tree-value".to_vec())
        );
    }

    pub async fn clear_only_affects_one_cf(store: &dyn LocalStore) {
        store
            .put(ColumnFamily::Blobs, b"key", b"v".to_vec())
            .await
            .unwrap();
        store
            .put(ColumnFamily::Trees, b"key", b"v".to_vec())
            .await
            .unwrap();
        store.clear(ColumnFamily::Blobs).await.unwrap();
        assert_eq!(store.get(ColumnFamily::Blobs, b"key").await.unwrap(), None);
        assert!(store.get(ColumnFamily::Trees, b"key").await.unwrap().is_some());
    }

    pub async fn batch_write_is_atomic_across_entries(store: &dyn LocalStore) {
        store
            .batch_write(vec![
                BatchEntry::put(ColumnFamily::Blobs, b"a".to_vec(), b"1".to_vec()),
                BatchEntry::put(ColumnFamily::Blobs, b"b".to_vec(), b"2".to_vec()),
            ])
            .await
            .unwrap();
        assert_eq!(store.get(ColumnFamily::Blobs, b"a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(ColumnFamily::Blobs, b"b").await.unwrap(), Some(b"2".to_vec()));
    }
}
