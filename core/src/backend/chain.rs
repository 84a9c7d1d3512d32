use tonic::async_trait;

use super::{BatchItem, ObjectKey, RemoteBackend};
use crate::proxyhash::ProxyHash;
use crate::rootid::RootId;
use crate::tree::{BlobMetadata, Tree};
use crate::{ObjectId, Result};

/// Chains backends with first-hit semantics: a request is tried against
/// `primary` first, and only the keys `primary` failed on are retried
/// against `secondary`. The classic first-hit combinator shape, generalized
/// from two fixed slots to an ordered chain so an arbitrary
/// number of fallback backends can be composed.
pub struct ChainedBackend {
    backends: Vec<Box<dyn RemoteBackend>>,
}

impl ChainedBackend {
    pub fn new(backends: Vec<Box<dyn RemoteBackend>>) -> Self {
        assert!(!backends.is_empty(), "ChainedBackend needs at least one backend");
        Self { backends }
    }

    async fn chained_tree_batch(keys: &[ObjectKey], backends: &[Box<dyn RemoteBackend>]) -> Vec<BatchItem<Tree>> {
        let mut remaining: Vec<ObjectKey> = keys.to_vec();
        let mut results: Vec<Option<BatchItem<Tree>>> = vec![None; keys.len()];
        for backend in backends {
            if remaining.is_empty() {
                break;
            }
            let batch = backend.get_tree_batch(&remaining).await;
            let mut still_missing = Vec::new();
            for (id, outcome) in batch {
                match outcome {
                    Ok(value) => {
                        if let Some(idx) = keys.iter().position(|k| k.id == id) {
                            results[idx] = Some((id, Ok(value)));
                        }
                    }
                    Err(_) => {
                        if let Some(key) = remaining.iter().find(|k| k.id == id) {
                            still_missing.push(key.clone());
                        }
                    }
                }
            }
            remaining = still_missing;
        }
        results
            .into_iter()
            .zip(keys)
            .map(|(result, key)| result.unwrap_or_else(|| (key.id.clone(), Err(crate::Error::NotFound(key.id.to_string())))))
            .collect()
    }
}

#[async_trait]
impl RemoteBackend for ChainedBackend {
    async fn get_tree_batch(&self, keys: &[ObjectKey]) -> Vec<BatchItem<Tree>> {
        Self::chained_tree_batch(keys, &self.backends).await
    }

    async fn get_blob_batch(&self, keys: &[ObjectKey]) -> Vec<BatchItem<bytes::Bytes>> {
        let mut remaining: Vec<ObjectKey> = keys.to_vec();
        let mut results: Vec<Option<BatchItem<bytes::Bytes>>> = vec![None; keys.len()];
        for backend in &self.backends {
            if remaining.is_empty() {
                break;
            }
            let batch = backend.get_blob_batch(&remaining).await;
            let mut still_missing = Vec::new();
            for (id, outcome) in batch {
                match outcome {
                    Ok(value) => {
                        if let Some(idx) = keys.iter().position(|k| k.id == id) {
                            results[idx] = Some((id, Ok(value)));
                        }
                    }
                    Err(_) => {
                        if let Some(key) = remaining.iter().find(|k| k.id == id) {
                            still_missing.push(key.clone());
                        }
                    }
                }
            }
            remaining = still_missing;
        }
        results
            .into_iter()
            .zip(keys)
            .map(|(result, key)| result.unwrap_or_else(|| (key.id.clone(), Err(crate::Error::NotFound(key.id.to_string())))))
            .collect()
    }

    async fn get_blob_metadata_batch(&self, keys: &[ObjectKey]) -> Vec<BatchItem<BlobMetadata>> {
        let mut remaining: Vec<ObjectKey> = keys.to_vec();
        let mut results: Vec<Option<BatchItem<BlobMetadata>>> = vec![None; keys.len()];
        for backend in &self.backends {
            if remaining.is_empty() {
                break;
            }
            let batch = backend.get_blob_metadata_batch(&remaining).await;
            let mut still_missing = Vec::new();
            for (id, outcome) in batch {
                match outcome {
                    Ok(value) => {
                        if let Some(idx) = keys.iter().position(|k| k.id == id) {
                            results[idx] = Some((id, Ok(value)));
                        }
                    }
                    Err(_) => {
                        if let Some(key) = remaining.iter().find(|k| k.id == id) {
                            still_missing.push(key.clone());
                        }
                    }
                }
            }
            remaining = still_missing;
        }
        results
            .into_iter()
            .zip(keys)
            .map(|(result, key)| result.unwrap_or_else(|| (key.id.clone(), Err(crate::Error::NotFound(key.id.to_string())))))
            .collect()
    }

    async fn prefetch_blobs(&self, proxy_hashes: &[ProxyHash]) -> Result<()> {
        // Only the primary backend is worth prefetching against; fallbacks
        // exist for correctness, not for warming a cache that isn't theirs.
        self.backends[0].prefetch_blobs(proxy_hashes).await
    }

    async fn resolve_root(&self, root_id: &RootId) -> Result<ObjectId> {
        let mut last_err = None;
        for backend in &self.backends {
            match backend.resolve_root(root_id).await {
                Ok(id) => return Ok(id),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| crate::Error::NotFound(root_id.to_string())))
    }

    async fn import_manifest_for_root(&self, root_id: &RootId, manifest_id: &ObjectId) -> Result<()> {
        self.backends[0].import_manifest_for_root(root_id, manifest_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::tree::{Entry, EntryKind};

    fn id(byte: u8) -> ObjectId {
        ObjectId::try_from(vec![byte; 20]).unwrap()
    }

    #[tokio::test]
    async fn falls_through_to_secondary_on_miss() {
        let primary = MemoryBackend::new();
        let secondary = MemoryBackend::new();
        let tree = Tree::from_entries(vec![Entry::new(b"a".to_vec(), id(9), EntryKind::RegularFile).unwrap()]).unwrap();
        secondary.seed_tree(id(1), tree.clone());

        let chained = ChainedBackend::new(vec![Box::new(primary), Box::new(secondary)]);
        let keys = vec![ObjectKey { id: id(1), proxy_hash: None }];
        let results = chained.get_tree_batch(&keys).await;
        assert_eq!(results[0].1.as_ref().unwrap(), &tree);
    }

    #[tokio::test]
    async fn primary_hit_skips_secondary() {
        let primary = MemoryBackend::new();
        let secondary = MemoryBackend::new();
        let tree = Tree::from_entries(vec![]).unwrap();
        primary.seed_tree(id(1), tree.clone());

        let chained = ChainedBackend::new(vec![Box::new(primary), Box::new(secondary)]);
        let keys = vec![ObjectKey { id: id(1), proxy_hash: None }];
        let results = chained.get_tree_batch(&keys).await;
        assert_eq!(results[0].1.as_ref().unwrap(), &tree);
    }
}
