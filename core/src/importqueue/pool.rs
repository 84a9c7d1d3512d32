//! Fixed-size worker pool that drains an [ImportRequestQueue] and turns
//! each batch into a call against a [RemoteBackend]. Workers publish
//! `queue`/`start`/`finish` trace events to a bounded ring buffer so
//! observers can watch live import activity without ever blocking a
//! worker on a slow subscriber.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info_span, instrument, Instrument};

use super::{ImportRequestQueue, QueuedRequest, RequestKind};
use crate::backend::{ObjectKey, RemoteBackend};
use crate::importqueue::FetchResult;
use crate::Error;

/// A lifecycle event for one queued request, as observed by a worker.
#[derive(Clone, Debug)]
pub enum TraceEvent {
    Queued { kind: RequestKind, count: usize },
    Started { kind: RequestKind, count: usize },
    Finished { kind: RequestKind, count: usize, ok: usize, failed: usize },
}

/// Fixed-capacity broadcast ring buffer for [TraceEvent]s. A lagging
/// subscriber silently drops the oldest events rather than ever slowing a
/// worker down — `tokio::sync::broadcast`'s natural behavior fits this
/// exactly, so there's no custom ring buffer to maintain.
#[derive(Clone)]
pub struct TraceBus {
    sender: broadcast::Sender<TraceEvent>,
}

impl TraceBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TraceEvent> {
        self.sender.subscribe()
    }

    fn publish(&self, event: TraceEvent) {
        // No subscribers is the common case; a send error there is
        // expected and not worth logging.
        let _ = self.sender.send(event);
    }
}

/// Runs `worker_count` dequeue loops against `backend`, retrying
/// individually-failed requests from a batch against `fallback` (if any)
/// before giving up. Returns the join handles so the caller (daemon
/// supervisor) can await clean shutdown after calling
/// [ImportRequestQueue::stop].
pub struct ImporterPool {
    handles: Vec<tokio::task::JoinHandle<()>>,
    pub trace_bus: TraceBus,
}

impl ImporterPool {
    pub fn spawn(
        worker_count: usize,
        queue: ImportRequestQueue,
        backend: Arc<dyn RemoteBackend>,
        fallback: Option<Arc<dyn RemoteBackend>>,
    ) -> Self {
        let trace_bus = TraceBus::new(1024);
        let mut handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let queue = queue.clone();
            let backend = backend.clone();
            let fallback = fallback.clone();
            let trace_bus = trace_bus.clone();
            handles.push(tokio::spawn(
                worker_loop(worker_id, queue, backend, fallback, trace_bus)
                    .instrument(info_span!("importer_worker", worker_id)),
            ));
        }
        Self { handles, trace_bus }
    }

    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(
    _worker_id: usize,
    queue: ImportRequestQueue,
    backend: Arc<dyn RemoteBackend>,
    fallback: Option<Arc<dyn RemoteBackend>>,
    trace_bus: TraceBus,
) {
    loop {
        let batch = queue.dequeue().await;
        if batch.is_empty() {
            if queue.is_stopped() {
                return;
            }
            continue;
        }
        dispatch_batch(&queue, &backend, fallback.as_deref(), batch, &trace_bus).await;
    }
}

#[instrument(skip_all, fields(kind = ?batch.first().map(|r| r.kind), count = batch.len()))]
async fn dispatch_batch(
    queue: &ImportRequestQueue,
    backend: &Arc<dyn RemoteBackend>,
    fallback: Option<&dyn RemoteBackend>,
    batch: Vec<QueuedRequest>,
    trace_bus: &TraceBus,
) {
    let kind = batch[0].kind;
    trace_bus.publish(TraceEvent::Queued { kind, count: batch.len() });
    trace_bus.publish(TraceEvent::Started { kind, count: batch.len() });

    let keys: Vec<ObjectKey> = batch
        .iter()
        .map(|r| ObjectKey { id: r.id.clone(), proxy_hash: r.proxy_hash.clone() })
        .collect();

    let (mut ok, mut failed) = (0, 0);
    match kind {
        RequestKind::Tree => {
            let results = backend.get_tree_batch(&keys).await;
            for (id, result) in results {
                let result = retry_tree(fallback, &id, result).await;
                match &result {
                    Ok(_) => ok += 1,
                    Err(_) => failed += 1,
                }
                queue.mark_finished(kind, &id, result.map(|t| FetchResult::Tree(Arc::new(t))).map_err(Arc::new));
            }
        }
        RequestKind::Blob => {
            let results = backend.get_blob_batch(&keys).await;
            for (id, result) in results {
                let result = retry_blob(fallback, &id, result).await;
                match &result {
                    Ok(_) => ok += 1,
                    Err(_) => failed += 1,
                }
                queue.mark_finished(kind, &id, result.map(FetchResult::Blob).map_err(Arc::new));
            }
        }
        RequestKind::BlobMeta => {
            let results = backend.get_blob_metadata_batch(&keys).await;
            for (id, result) in results {
                let result = retry_metadata(fallback, &id, result).await;
                match &result {
                    Ok(_) => ok += 1,
                    Err(_) => failed += 1,
                }
                queue.mark_finished(kind, &id, result.map(FetchResult::BlobMetadata).map_err(Arc::new));
            }
        }
    }

    trace_bus.publish(TraceEvent::Finished { kind, count: keys.len(), ok, failed });
}

async fn retry_tree(
    fallback: Option<&dyn RemoteBackend>,
    id: &crate::ObjectId,
    result: crate::Result<crate::tree::Tree>,
) -> crate::Result<crate::tree::Tree> {
    match (result, fallback) {
        (Err(e), Some(fallback)) if e.is_retryable() || matches!(e, Error::NotFound(_)) => {
            let keys = vec![ObjectKey { id: id.clone(), proxy_hash: None }];
            fallback
                .get_tree_batch(&keys)
                .await
                .into_iter()
                .next()
                .map(|(_, r)| r)
                .unwrap_or(Err(e))
        }
        (result, _) => result,
    }
}

async fn retry_blob(
    fallback: Option<&dyn RemoteBackend>,
    id: &crate::ObjectId,
    result: crate::Result<bytes::Bytes>,
) -> crate::Result<bytes::Bytes> {
    match (result, fallback) {
        (Err(e), Some(fallback)) if e.is_retryable() || matches!(e, Error::NotFound(_)) => {
            let keys = vec![ObjectKey { id: id.clone(), proxy_hash: None }];
            fallback
                .get_blob_batch(&keys)
                .await
                .into_iter()
                .next()
                .map(|(_, r)| r)
                .unwrap_or(Err(e))
        }
        (result, _) => result,
    }
}

async fn retry_metadata(
    fallback: Option<&dyn RemoteBackend>,
    id: &crate::ObjectId,
    result: crate::Result<crate::tree::BlobMetadata>,
) -> crate::Result<crate::tree::BlobMetadata> {
    match (result, fallback) {
        (Err(e), Some(fallback)) if e.is_retryable() || matches!(e, Error::NotFound(_)) => {
            let keys = vec![ObjectKey { id: id.clone(), proxy_hash: None }];
            fallback
                .get_blob_metadata_batch(&keys)
                .await
                .into_iter()
                .next()
                .map(|(_, r)| r)
                .unwrap_or(Err(e))
        }
        (result, _) => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::importqueue::BatchSizes;
    use crate::tree::{Entry, EntryKind};

    #[tokio::test]
    async fn dispatches_blob_batch_and_fulfills_waiter() {
        let queue = ImportRequestQueue::new(BatchSizes::default());
        let backend = MemoryBackend::new();
        let id = crate::ObjectId::try_from(vec![7u8; 20]).unwrap();
        backend.seed_blob(id.clone(), bytes::Bytes::from_static(b"hello"));

        let rx = queue.enqueue(RequestKind::Blob, id.clone(), None, 0);
        let batch = queue.dequeue().await;
        dispatch_batch(&queue, &(Arc::new(backend) as Arc<dyn RemoteBackend>), None, batch, &TraceBus::new(16)).await;

        let outcome = rx.await.unwrap();
        match outcome.as_ref() {
            Ok(FetchResult::Blob(bytes)) => assert_eq!(bytes.as_ref(), b"hello"),
            _ => panic!("expected blob result"),
        }
    }

    #[tokio::test]
    async fn falls_back_on_primary_miss() {
        let queue = ImportRequestQueue::new(BatchSizes::default());
        let primary = MemoryBackend::new();
        let fallback = MemoryBackend::new();
        let tree = tree_for_test();
        let id = crate::ObjectId::try_from(vec![3u8; 20]).unwrap();
        fallback.seed_tree(id.clone(), tree.clone());

        let rx = queue.enqueue(RequestKind::Tree, id.clone(), None, 0);
        let batch = queue.dequeue().await;
        dispatch_batch(
            &queue,
            &(Arc::new(primary) as Arc<dyn RemoteBackend>),
            Some(&fallback),
            batch,
            &TraceBus::new(16),
        )
        .await;

        let outcome = rx.await.unwrap();
        match outcome.as_ref() {
            Ok(FetchResult::Tree(t)) => assert_eq!(t.as_ref(), &tree),
            _ => panic!("expected tree result"),
        }
    }

    fn tree_for_test() -> crate::tree::Tree {
        crate::tree::Tree::from_entries(vec![Entry::new(
            b"a".to_vec(),
            crate::ObjectId::try_from(vec![1u8; 20]).unwrap(),
            EntryKind::RegularFile,
        )
        .unwrap()])
        .unwrap()
    }
}
