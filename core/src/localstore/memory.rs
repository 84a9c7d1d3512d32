use std::collections::HashMap;

use parking_lot::RwLock;
use tonic::async_trait;

use super::{BatchEntry, ColumnFamily, LocalStore};
use crate::Result;

/// In-memory [LocalStore], for tests and for ephemeral mounts that don't
/// need data to survive a restart. One `RwLock<HashMap<..>>` per partition.
#[derive(Default)]
pub struct MemoryLocalStore {
    cfs: [RwLock<HashMap<Vec<u8>, Vec<u8>>>; 6],
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&self, cf: ColumnFamily) -> &RwLock<HashMap<Vec<u8>, Vec<u8>>> {
        &self.cfs[ColumnFamily::ALL.iter().position(|c| *c == cf).unwrap()]
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn get(&self, cf: ColumnFamily, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.table(cf).read().get(key).cloned())
    }

    async fn batch_write(&self, entries: Vec<BatchEntry>) -> Result<()> {
        // Grouping locks per-cf would let us take each write-lock once, but
        // batches in practice touch one or two column families, so the
        // simplicity of locking per-entry wins here.
        for entry in entries {
            let mut table = self.table(entry.cf).write();
            match entry.value {
                Some(value) => {
                    table.insert(entry.key, value);
                }
                None => {
                    table.remove(&entry.key);
                }
            }
        }
        Ok(())
    }

    async fn clear(&self, cf: ColumnFamily) -> Result<()> {
        self.table(cf).write().clear();
        Ok(())
    }

    async fn compact(&self, _cf: ColumnFamily) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::localstore::conformance;

    #[tokio::test]
    async fn satisfies_conformance_suite() {
        let store = MemoryLocalStore::new();
        conformance::get_put_roundtrip(&store).await;
        let store = MemoryLocalStore::new();
        conformance::column_families_are_isolated(&store).await;
        let store = MemoryLocalStore::new();
        conformance::clear_only_affects_one_cf(&store).await;
        let store = MemoryLocalStore::new();
        conformance::batch_write_is_atomic_across_entries(&store).await;
    }
}
