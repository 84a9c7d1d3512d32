use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use tonic::async_trait;

use super::{check_or_write_engine_marker, BatchEntry, ColumnFamily, LocalStore};
use crate::Result;

fn table_for(cf: ColumnFamily) -> TableDefinition<'static, &'static [u8], &'static [u8]> {
    match cf {
        ColumnFamily::Blobs => TableDefinition::new("blobs"),
        ColumnFamily::Trees => TableDefinition::new("trees"),
        ColumnFamily::BlobMetadata => TableDefinition::new("blob_metadata"),
        ColumnFamily::ProxyHashes => TableDefinition::new("proxy_hashes"),
        ColumnFamily::CommitToTree => TableDefinition::new("commit_to_tree"),
        ColumnFamily::Ephemeral => TableDefinition::new("ephemeral"),
    }
}

/// [LocalStore] backed by `redb`, an embedded single-file store. Unlike
/// sled, redb requires every table to exist before a read transaction can
/// reference it, so all six column families are created eagerly on open.
pub struct RedbLocalStore {
    db: Arc<Database>,
}

impl RedbLocalStore {
    pub fn open(dir: &Path) -> Result<Self> {
        check_or_write_engine_marker(dir, "redb")?;
        std::fs::create_dir_all(dir)?;
        let db = Database::create(dir.join("db.redb"))?;
        {
            let txn = db.begin_write()?;
            for cf in ColumnFamily::ALL {
                txn.open_table(table_for(cf))?;
            }
            txn.commit()?;
        }
        Ok(Self { db: Arc::new(db) })
    }
}

#[async_trait]
impl LocalStore for RedbLocalStore {
    async fn get(&self, cf: ColumnFamily, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let db = self.db.clone();
        let key = key.to_vec();
        tokio::task::spawn_blocking(move || -> Result<Option<Vec<u8>>> {
            let txn = db.begin_read()?;
            let table = txn.open_table(table_for(cf))?;
            Ok(table.get(key.as_slice())?.map(|v| v.value().to_vec()))
        })
        .await?
    }

    async fn batch_write(&self, entries: Vec<BatchEntry>) -> Result<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let txn = db.begin_write()?;
            {
                for entry in &entries {
                    let mut table = txn.open_table(table_for(entry.cf))?;
                    match &entry.value {
                        Some(value) => {
                            table.insert(entry.key.as_slice(), value.as_slice())?;
                        }
                        None => {
                            table.remove(entry.key.as_slice())?;
                        }
                    }
                }
            }
            txn.commit()?;
            Ok(())
        })
        .await?
    }

    async fn clear(&self, cf: ColumnFamily) -> Result<()> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let txn = db.begin_write()?;
            {
                let mut table = txn.open_table(table_for(cf))?;
                let keys: Vec<Vec<u8>> = table
                    .iter()?
                    .map(|entry| entry.map(|(k, _)| k.value().to_vec()))
                    .collect::<std::result::Result<_, _>>()?;
                for key in keys {
                    table.remove(key.as_slice())?;
                }
            }
            txn.commit()?;
            Ok(())
        })
        .await?
    }

    async fn compact(&self, _cf: ColumnFamily) -> Result<()> {
        // redb compacts the whole file, not per-table; requires exclusive
        // access so this can't run while other transactions are open.
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
