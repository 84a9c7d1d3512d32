use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tonic::async_trait;

use super::{BatchItem, ObjectKey, RemoteBackend};
use crate::proxyhash::ProxyHash;
use crate::rootid::RootId;
use crate::tree::{BlobMetadata, Tree};
use crate::{Error, ObjectId, Result};

/// In-memory [RemoteBackend] fake for tests: behaves like a real backend
/// seeded with a fixed object universe, rather than one that actually
/// fetches anything.
#[derive(Default)]
pub struct MemoryBackend {
    trees: RwLock<HashMap<ObjectId, Tree>>,
    blobs: RwLock<HashMap<ObjectId, bytes::Bytes>>,
    metadata: RwLock<HashMap<ObjectId, BlobMetadata>>,
    roots: RwLock<HashMap<Vec<u8>, ObjectId>>,
    pub call_log: Arc<RwLock<Vec<&'static str>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_tree(&self, id: ObjectId, tree: Tree) {
        self.trees.write().insert(id, tree);
    }

    pub fn seed_blob(&self, id: ObjectId, data: bytes::Bytes) {
        let metadata = BlobMetadata {
            sha1: id
                .as_bytes()
                .try_into()
                .unwrap_or([0u8; 20]),
            size: data.len() as u64,
        };
        self.metadata.write().insert(id.clone(), metadata);
        self.blobs.write().insert(id, data);
    }

    pub fn seed_root(&self, root_id: &RootId, tree_id: ObjectId) {
        self.roots
            .write()
            .insert(root_id.as_bytes().to_vec(), tree_id);
    }
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    async fn get_tree_batch(&self, keys: &[ObjectKey]) -> Vec<BatchItem<Tree>> {
        self.call_log.write().push("get_tree_batch");
        let trees = self.trees.read();
        keys.iter()
            .map(|key| {
                let result = trees
                    .get(&key.id)
                    .cloned()
                    .ok_or_else(|| Error::NotFound(key.id.to_string()));
                (key.id.clone(), result)
            })
            .collect()
    }

    async fn get_blob_batch(&self, keys: &[ObjectKey]) -> Vec<BatchItem<bytes::Bytes>> {
        self.call_log.write().push("get_blob_batch");
        let blobs = self.blobs.read();
        keys.iter()
            .map(|key| {
                let result = blobs
                    .get(&key.id)
                    .cloned()
                    .ok_or_else(|| Error::NotFound(key.id.to_string()));
                (key.id.clone(), result)
            })
            .collect()
    }

    async fn get_blob_metadata_batch(&self, keys: &[ObjectKey]) -> Vec<BatchItem<BlobMetadata>> {
        self.call_log.write().push("get_blob_metadata_batch");
        let metadata = self.metadata.read();
        keys.iter()
            .map(|key| {
                let result = metadata
                    .get(&key.id)
                    .cloned()
                    .ok_or_else(|| Error::NotFound(key.id.to_string()));
                (key.id.clone(), result)
            })
            .collect()
    }

    async fn prefetch_blobs(&self, _proxy_hashes: &[ProxyHash]) -> Result<()> {
        self.call_log.write().push("prefetch_blobs");
        Ok(())
    }

    async fn resolve_root(&self, root_id: &RootId) -> Result<ObjectId> {
        self.call_log.write().push("resolve_root");
        self.roots
            .read()
            .get(root_id.as_bytes())
            .cloned()
            .ok_or_else(|| Error::NotFound(root_id.to_string()))
    }

    async fn import_manifest_for_root(&self, _root_id: &RootId, _manifest_id: &ObjectId) -> Result<()> {
        self.call_log.write().push("import_manifest_for_root");
        Ok(())
    }
}
