//! The tiered object store facade: every `get*` tries the in-memory cache,
//! then [crate::localstore::LocalStore], then falls through to the
//! [crate::importqueue::ImportRequestQueue] and waits for a worker to
//! fetch it from the [crate::backend::RemoteBackend]. A positive result at
//! either lower tier populates the tiers above it.

use std::sync::Arc;

use tracing::instrument;

use crate::backend::RemoteBackend;
use crate::cache::InMemoryObjectCache;
use crate::importqueue::{FetchResult, ImportRequestQueue, RequestKind};
use crate::localstore::{ColumnFamily, LocalStore};
use crate::proxyhash::{self, ProxyHash};
use crate::rootid::{self, RootId};
use crate::tree::{BlobMetadata, Tree};
use crate::{Error, ObjectId, Result};

/// Why a particular fetch is happening, threaded through every operation
/// so telemetry/logging can attribute work to its origin.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FetchCause {
    Fs,
    Mgmt,
    Prefetch,
    Thrift,
}

/// Carries the requesting client PID (if any), the cause, a priority, and
/// a hint for whether this fetch's result should populate the prefetch
/// path of downstream caches. Every [ObjectStore] operation takes one.
#[derive(Clone, Debug)]
pub struct ObjectFetchContext {
    pub pid: Option<u32>,
    pub cause: FetchCause,
    pub cause_detail: String,
    pub priority: i32,
    pub prefetch_metadata: bool,
}

impl ObjectFetchContext {
    pub fn fs(pid: u32) -> Self {
        Self {
            pid: Some(pid),
            cause: FetchCause::Fs,
            cause_detail: "fs".into(),
            priority: 10,
            prefetch_metadata: false,
        }
    }

    pub fn mgmt() -> Self {
        Self {
            pid: None,
            cause: FetchCause::Mgmt,
            cause_detail: "mgmt".into(),
            priority: 5,
            prefetch_metadata: false,
        }
    }

    pub fn prefetch() -> Self {
        Self {
            pid: None,
            cause: FetchCause::Prefetch,
            cause_detail: "prefetch".into(),
            priority: 0,
            prefetch_metadata: true,
        }
    }

    pub fn thrift() -> Self {
        Self {
            pid: None,
            cause: FetchCause::Thrift,
            cause_detail: "thrift".into(),
            priority: 5,
            prefetch_metadata: false,
        }
    }
}

pub struct ObjectStore {
    local: Arc<dyn LocalStore>,
    cache: Arc<InMemoryObjectCache>,
    queue: ImportRequestQueue,
    // `resolveRoot`/`importManifestForRoot` are single low-volume calls,
    // not batchable fetches, so they go straight to the backend rather
    // than through the priority queue.
    backend: Arc<dyn RemoteBackend>,
}

impl ObjectStore {
    pub fn new(
        local: Arc<dyn LocalStore>,
        cache: Arc<InMemoryObjectCache>,
        queue: ImportRequestQueue,
        backend: Arc<dyn RemoteBackend>,
    ) -> Self {
        Self { local, cache, queue, backend }
    }

    #[instrument(skip(self, ctx), fields(cause = ?ctx.cause))]
    pub async fn get_blob(&self, id: &ObjectId, ctx: &ObjectFetchContext) -> Result<bytes::Bytes> {
        if let Some(bytes) = self.cache.get(id) {
            return Ok(bytes);
        }
        if let Some(bytes) = self.local.get(ColumnFamily::Blobs, id.as_bytes()).await? {
            let bytes = bytes::Bytes::from(bytes);
            self.cache.insert(id.clone(), bytes.clone());
            return Ok(bytes);
        }

        let proxy_hash = proxyhash::load(self.local.as_ref(), id).await.ok();
        let bytes = self.fetch_via_queue(RequestKind::Blob, id, proxy_hash, ctx).await?;
        let bytes = match bytes {
            FetchResult::Blob(b) => b,
            _ => return Err(Error::MalformedObject("expected blob result".into())),
        };
        self.local
            .put(ColumnFamily::Blobs, id.as_bytes(), bytes.to_vec())
            .await?;
        self.cache.insert(id.clone(), bytes.clone());
        Ok(bytes)
    }

    #[instrument(skip(self, ctx), fields(cause = ?ctx.cause))]
    pub async fn get_blob_metadata(&self, id: &ObjectId, ctx: &ObjectFetchContext) -> Result<BlobMetadata> {
        if let Some(bytes) = self.local.get(ColumnFamily::BlobMetadata, id.as_bytes()).await? {
            return decode_metadata(&bytes);
        }
        let proxy_hash = proxyhash::load(self.local.as_ref(), id).await.ok();
        let result = self.fetch_via_queue(RequestKind::BlobMeta, id, proxy_hash, ctx).await?;
        let metadata = match result {
            FetchResult::BlobMetadata(m) => m,
            _ => return Err(Error::MalformedObject("expected blob metadata result".into())),
        };
        self.local
            .put(ColumnFamily::BlobMetadata, id.as_bytes(), encode_metadata(&metadata))
            .await?;
        Ok(metadata)
    }

    pub async fn get_blob_size(&self, id: &ObjectId, ctx: &ObjectFetchContext) -> Result<u64> {
        Ok(self.get_blob_metadata(id, ctx).await?.size)
    }

    #[instrument(skip(self, ctx), fields(cause = ?ctx.cause))]
    pub async fn get_tree(&self, id: &ObjectId, ctx: &ObjectFetchContext) -> Result<Tree> {
        if let Some(bytes) = self.local.get(ColumnFamily::Trees, id.as_bytes()).await? {
            return decode_tree(&bytes);
        }
        let proxy_hash = proxyhash::load(self.local.as_ref(), id).await.ok();
        let result = self.fetch_via_queue(RequestKind::Tree, id, proxy_hash, ctx).await?;
        let tree = match result {
            FetchResult::Tree(t) => (*t).clone(),
            _ => return Err(Error::MalformedObject("expected tree result".into())),
        };
        self.local
            .put(ColumnFamily::Trees, id.as_bytes(), encode_tree(&tree))
            .await?;
        Ok(tree)
    }

    /// Resolves a root id to its top-level tree, consulting the
    /// `commit_to_tree` mapping first; on miss, asks the backend to
    /// resolve and records the result for next time.
    #[instrument(skip(self, ctx), fields(cause = ?ctx.cause))]
    pub async fn get_root_tree(&self, root_id: &RootId, ctx: &ObjectFetchContext) -> Result<Tree> {
        let key = rootid::render_root_id(root_id);
        let tree_id = if let Some(bytes) = self.local.get(ColumnFamily::CommitToTree, &key).await? {
            ObjectId::try_from(bytes)?
        } else {
            let result = self.backend.resolve_root(root_id).await?;
            self.local
                .put(ColumnFamily::CommitToTree, &key, result.as_bytes().to_vec())
                .await?;
            result
        };
        self.get_tree(&tree_id, ctx).await
    }

    /// Best-effort population of cache/store; never returns the bytes.
    /// Failures are logged, not surfaced — a prefetch miss must never fail
    /// a foreground request.
    #[instrument(skip(self, ctx))]
    pub async fn prefetch_blobs(&self, proxy_hashes: &[ProxyHash], ctx: &ObjectFetchContext) {
        for proxy_hash in proxy_hashes {
            let (id, serialized) = proxyhash::prepare_to_store(&proxy_hash.path, &proxy_hash.rev_hash);
            if proxyhash::store(self.local.as_ref(), &id, serialized).await.is_err() {
                continue;
            }
            if let Err(e) = self.get_blob(&id, ctx).await {
                tracing::warn!(error = %e, path = %String::from_utf8_lossy(&proxy_hash.path), "prefetch failed");
            }
        }
    }

    pub fn parse_root_id(&self, bytes: &[u8]) -> RootId {
        rootid::parse_root_id(bytes)
    }

    pub fn render_root_id(&self, root_id: &RootId) -> Vec<u8> {
        rootid::render_root_id(root_id)
    }

    async fn fetch_via_queue(
        &self,
        kind: RequestKind,
        id: &ObjectId,
        proxy_hash: Option<ProxyHash>,
        ctx: &ObjectFetchContext,
    ) -> Result<FetchResult> {
        let rx = match self.queue.check_in_progress(kind, id, ctx.priority) {
            Some(rx) => rx,
            None => self.queue.enqueue(kind, id.clone(), proxy_hash, ctx.priority),
        };
        let outcome = rx.await.map_err(|_| Error::Cancelled)?;
        match outcome.as_ref() {
            Ok(result) => Ok(result.clone()),
            Err(e) => Err(clone_error(e)),
        }
    }

    /// Hint for clients that just created a commit locally: records that
    /// `manifest_id` is the manifest for `root_id` so a subsequent
    /// `get_root_tree` doesn't need to round-trip to the backend.
    pub async fn import_manifest_for_root(&self, root_id: &RootId, manifest_id: &ObjectId) -> Result<()> {
        self.backend.import_manifest_for_root(root_id, manifest_id).await
    }
}

/// Reconstructs an owned `Error` from a shared `&Error`, preserving the
/// original variant (so a `NotFound` stays a `NotFound`, a `Cancelled`
/// stays `Cancelled`, and so on) rather than collapsing everything to one
/// catch-all kind. `Error` itself isn't `Clone` (several variants wrap
/// non-`Clone` library error types), so a shared outcome can only carry an
/// `Arc<Error>`; this is the point a single caller needs its own owned
/// copy back. Per spec §4.4/§7, failures must surface to the caller with
/// their kind intact — variants whose payload can't be cloned verbatim
/// fall back to the nearest equivalent kind carrying the original message.
fn clone_error(e: &Error) -> Error {
    match e {
        Error::NotFound(s) => Error::NotFound(s.clone()),
        Error::InvalidObjectId(_) => Error::Argument(e.to_string()),
        Error::Argument(s) => Error::Argument(s.clone()),
        Error::StoreCorrupt(s) => Error::StoreCorrupt(s.clone()),
        Error::StoreIOError(s) => Error::StoreIOError(s.clone()),
        Error::BackendUnavailable(s) => Error::BackendUnavailable(s.clone()),
        Error::BackendTimeout => Error::BackendTimeout,
        Error::BackendProtocol(s) => Error::BackendProtocol(s.clone()),
        Error::MalformedObject(s) => Error::MalformedObject(s.clone()),
        Error::Cancelled => Error::Cancelled,
        Error::Conflict(s) => Error::Conflict(s.clone()),
        Error::MissingProxyHash(s) => Error::MissingProxyHash(s.clone()),
        Error::Unsupported => Error::Unsupported,
        Error::AlreadyInProgress => Error::AlreadyInProgress,
        Error::MountGenerationChanged => Error::MountGenerationChanged,
        Error::JournalTruncated => Error::JournalTruncated,
        Error::AlreadyMounted => Error::AlreadyMounted,
        Error::NotMounted => Error::NotMounted,
        Error::TakeoverInProgress => Error::TakeoverInProgress,
        Error::Generic(s) => Error::Generic(s.clone()),
        // These wrap library error types that aren't `Clone`; they only
        // ever originate from the local store, not from a backend's batch
        // call, so they never actually flow through `fetch_via_queue` — but
        // reconstruct a reasonable same-kind fallback rather than panic if
        // that ever changes.
        Error::Io(_) => Error::StoreIOError(e.to_string()),
        Error::Join(_) => Error::Generic(e.to_string()),
        Error::Sled(_) => Error::StoreIOError(e.to_string()),
        Error::RedbTransaction(_)
        | Error::RedbTable(_)
        | Error::RedbStorage(_)
        | Error::RedbCommit(_)
        | Error::RedbDatabase(_) => Error::StoreIOError(e.to_string()),
        Error::Grpc(_) => Error::BackendProtocol(e.to_string()),
        Error::GrpcTransport(_) => Error::BackendUnavailable(e.to_string()),
    }
}

fn encode_tree(tree: &Tree) -> Vec<u8> {
    use prost::Message;
    crate::proto::TreeProto::from(tree).encode_to_vec()
}

fn decode_tree(bytes: &[u8]) -> Result<Tree> {
    use prost::Message;
    let proto = crate::proto::TreeProto::decode(bytes).map_err(|e| Error::StoreCorrupt(e.to_string()))?;
    Tree::try_from(proto)
}

fn encode_metadata(metadata: &BlobMetadata) -> Vec<u8> {
    use prost::Message;
    crate::proto::BlobMetadataProto::from(metadata).encode_to_vec()
}

fn decode_metadata(bytes: &[u8]) -> Result<BlobMetadata> {
    use prost::Message;
    let proto = crate::proto::BlobMetadataProto::decode(bytes).map_err(|e| Error::StoreCorrupt(e.to_string()))?;
    BlobMetadata::try_from(proto)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::cache::CacheConfig;
    use crate::importqueue::BatchSizes;
    use crate::localstore::MemoryLocalStore;

    fn id(byte: u8) -> ObjectId {
        ObjectId::try_from(vec![byte; 20]).unwrap()
    }

    fn store() -> ObjectStore {
        ObjectStore::new(
            Arc::new(MemoryLocalStore::new()),
            Arc::new(InMemoryObjectCache::new(CacheConfig::default())),
            ImportRequestQueue::new(BatchSizes::default()),
            Arc::new(MemoryBackend::new()),
        )
    }

    #[tokio::test]
    async fn get_blob_hits_local_store_without_touching_queue() {
        let store = store();
        store
            .local
            .put(ColumnFamily::Blobs, id(1).as_bytes(), b"hi".to_vec())
            .await
            .unwrap();
        let bytes = store.get_blob(&id(1), &ObjectFetchContext::fs(1)).await.unwrap();
        assert_eq!(bytes.as_ref(), b"hi");
    }

    #[tokio::test]
    async fn cold_miss_surfaces_not_found_kind_not_backend_protocol() {
        use crate::importqueue::pool::ImporterPool;

        let backend = Arc::new(MemoryBackend::new());
        let queue = ImportRequestQueue::new(BatchSizes::default());
        let pool = ImporterPool::spawn(1, queue.clone(), backend.clone(), None);
        let store = ObjectStore::new(
            Arc::new(MemoryLocalStore::new()),
            Arc::new(InMemoryObjectCache::new(CacheConfig::default())),
            queue.clone(),
            backend,
        );

        let err = store.get_blob(&id(0xFF), &ObjectFetchContext::fs(1)).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)), "expected NotFound, got {err:?}");

        queue.stop();
        pool.join().await;
    }

    #[tokio::test]
    async fn second_get_blob_is_served_from_cache() {
        let store = store();
        store
            .local
            .put(ColumnFamily::Blobs, id(1).as_bytes(), b"hi".to_vec())
            .await
            .unwrap();
        store.get_blob(&id(1), &ObjectFetchContext::fs(1)).await.unwrap();
        let before_misses = store.cache.miss_count();
        store.get_blob(&id(1), &ObjectFetchContext::fs(1)).await.unwrap();
        assert_eq!(store.cache.miss_count(), before_misses);
    }
}
