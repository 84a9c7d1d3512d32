use std::path::Path;

use tonic::async_trait;

use super::{check_or_write_engine_marker, BatchEntry, ColumnFamily, LocalStore};
use crate::Result;

/// [LocalStore] backed by `sled`, an embedded ordered key-value store.
/// Column families map directly onto sled's own named trees, so there's no
/// key-prefixing to get wrong.
pub struct SledLocalStore {
    db: sled::Db,
}

impl SledLocalStore {
    pub fn open(dir: &Path) -> Result<Self> {
        check_or_write_engine_marker(dir, "sled")?;
        let db = sled::open(dir.join("db"))?;
        Ok(Self { db })
    }

    fn tree(&self, cf: ColumnFamily) -> Result<sled::Tree> {
        Ok(self.db.open_tree(cf.as_str())?)
    }
}

#[async_trait]
impl LocalStore for SledLocalStore {
    async fn get(&self, cf: ColumnFamily, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let tree = self.tree(cf)?;
        let key = key.to_vec();
        tokio::task::spawn_blocking(move || -> Result<Option<Vec<u8>>> {
            Ok(tree.get(key)?.map(|ivec| ivec.to_vec()))
        })
        .await?
    }

    async fn batch_write(&self, entries: Vec<BatchEntry>) -> Result<()> {
        // sled batches are per-tree; group entries so each tree sees one
        // atomic apply_batch call. Writes are atomic within a column family
        // but not ordered across families.
        let mut by_cf: std::collections::BTreeMap<ColumnFamily, (sled::Tree, sled::Batch)> =
            std::collections::BTreeMap::new();
        for entry in entries {
            let (_, batch) = match by_cf.entry(entry.cf) {
                std::collections::btree_map::Entry::Occupied(o) => o.into_mut(),
                std::collections::btree_map::Entry::Vacant(v) => {
                    v.insert((self.tree(entry.cf)?, sled::Batch::default()))
                }
            };
            match entry.value {
                Some(value) => batch.insert(entry.key, value),
                None => batch.remove(entry.key),
            }
        }

        tokio::task::spawn_blocking(move || -> Result<()> {
            for (_, (tree, batch)) in by_cf {
                tree.apply_batch(batch)?;
            }
            Ok(())
        })
        .await?
    }

    async fn clear(&self, cf: ColumnFamily) -> Result<()> {
        let tree = self.tree(cf)?;
        tokio::task::spawn_blocking(move || -> Result<()> {
            tree.clear()?;
            Ok(())
        })
        .await?
    }

    async fn compact(&self, _cf: ColumnFamily) -> Result<()> {
        // sled has no per-tree compaction knob; whole-db flush is the
        // closest analogue and is cheap to call speculatively.
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            db.flush()?;
            Ok(())
        })
        .await?
    }

    async fn close(&self) -> Result<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            db.flush()?;
            Ok(())
        })
        .await?
    }
}
