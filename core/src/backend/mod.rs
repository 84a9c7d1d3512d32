//! Abstraction over "wherever objects actually come from": a gRPC service,
//! a long-lived helper subprocess speaking a framed binary protocol, an
//! in-memory fake for tests, or a first-hit chain of any of those. Tree,
//! blob and blob-metadata fetch are folded into one trait here since every
//! implementation handles all three uniformly.

mod chain;
mod grpc;
mod memory;
mod subprocess;

pub use chain::ChainedBackend;
pub use grpc::GrpcBackend;
pub use memory::MemoryBackend;
pub use subprocess::SubprocessBackend;

use tonic::async_trait;

use crate::proxyhash::ProxyHash;
use crate::rootid::RootId;
use crate::tree::{BlobMetadata, Tree};
use crate::{ObjectId, Result};

/// One requested object within a batch call: the internal id, and (for
/// path-addressed backends) the proxy hash needed to address it remotely.
#[derive(Clone, Debug)]
pub struct ObjectKey {
    pub id: ObjectId,
    pub proxy_hash: Option<ProxyHash>,
}

/// Per-object outcome within a batch response. A batch call may succeed for
/// some keys and fail for others; callers fold these back into per-request
/// promises rather than failing the whole batch on one bad entry.
pub type BatchItem<T> = (ObjectId, Result<T>);

/// The contract a remote source-control backend must satisfy. Every method
/// must be idempotent and safe under concurrent invocation; retrying a
/// timed-out call is always safe.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    async fn get_tree_batch(&self, keys: &[ObjectKey]) -> Vec<BatchItem<Tree>>;

    async fn get_blob_batch(&self, keys: &[ObjectKey]) -> Vec<BatchItem<bytes::Bytes>>;

    async fn get_blob_metadata_batch(&self, keys: &[ObjectKey]) -> Vec<BatchItem<BlobMetadata>>;

    async fn prefetch_blobs(&self, proxy_hashes: &[ProxyHash]) -> Result<()>;

    /// Resolves a commit/snapshot to the `ObjectId` of its top-level tree.
    async fn resolve_root(&self, root_id: &RootId) -> Result<ObjectId>;

    /// Hints that a client just created `root_id` locally and its manifest
    /// is available under `manifest_id`, so the backend can skip
    /// re-deriving it from scratch on next resolution.
    async fn import_manifest_for_root(&self, root_id: &RootId, manifest_id: &ObjectId) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{Entry, EntryKind};

    fn id(byte: u8) -> ObjectId {
        ObjectId::try_from(vec![byte; 20]).unwrap()
    }

    #[tokio::test]
    async fn memory_backend_serves_seeded_trees() {
        let backend = MemoryBackend::new();
        let tree = Tree::from_entries(vec![Entry::new(b"a".to_vec(), id(2), EntryKind::RegularFile).unwrap()]).unwrap();
        backend.seed_tree(id(1), tree.clone());
        let keys = vec![ObjectKey { id: id(1), proxy_hash: None }];
        let results = backend.get_tree_batch(&keys).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1.as_ref().unwrap(), &tree);
    }
}
