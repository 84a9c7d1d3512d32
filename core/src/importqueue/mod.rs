//! Priority-scheduled queue of fetch requests bound for a
//! [crate::backend::RemoteBackend], with duplicate-request coalescing and
//! batched dequeue. One sub-queue per request kind (trees, blob metadata,
//! blobs). Prefetch requests are not a structurally separate queue: they
//! come in through [crate::objectstore::ObjectFetchContext::prefetch] at
//! priority 0, the lowest a request can carry, so they naturally sort
//! behind every foreground fetch in the same per-kind sub-queue instead of
//! needing a fourth heap of their own.

pub mod pool;

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};

use crate::proxyhash::ProxyHash;
use crate::tree::{BlobMetadata, Tree};
use crate::{Error, ObjectId};

/// What kind of object a request is for. Tie-breaking at equal priority
/// favors trees, since resolving a tree unlocks fan-out to its children.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RequestKind {
    Tree,
    BlobMeta,
    Blob,
}

impl RequestKind {
    const ALL: [RequestKind; 3] = [RequestKind::Tree, RequestKind::BlobMeta, RequestKind::Blob];

    /// Lower value sorts first among equal-priority requests, i.e. trees
    /// before metadata before blobs.
    fn tie_break_rank(self) -> u8 {
        match self {
            RequestKind::Tree => 0,
            RequestKind::BlobMeta => 1,
            RequestKind::Blob => 2,
        }
    }
}

/// The fetched value a request resolves to, erased to a common enum so one
/// queue and one dedup table can serve all three kinds.
#[derive(Clone)]
pub enum FetchResult {
    Tree(Arc<Tree>),
    Blob(bytes::Bytes),
    BlobMetadata(BlobMetadata),
}

pub type SharedOutcome = Arc<Result<FetchResult, Arc<Error>>>;

/// A single queued fetch, with enough information for a worker to issue
/// the right backend call and for waiters to be notified on completion.
pub struct QueuedRequest {
    pub kind: RequestKind,
    pub id: ObjectId,
    pub proxy_hash: Option<ProxyHash>,
    pub priority: i32,
    pub enqueued_at: Instant,
}

struct PendingEntry {
    priority: i32,
    proxy_hash: Option<ProxyHash>,
    enqueued_at: Instant,
    version: u64,
    waiters: Vec<oneshot::Sender<SharedOutcome>>,
}

/// A heap slot. `version` must match the dedup table's live version for an
/// entry to still be eligible for dequeue — bumping a request's priority
/// doesn't try to fix up its position in the [BinaryHeap] (which has no
/// decrease-key operation); instead it increments the version and pushes a
/// fresh slot, leaving the old one to be skipped as stale when popped.
struct HeapSlot {
    priority: i32,
    kind: RequestKind,
    id: ObjectId,
    version: u64,
    order: u64,
}

impl PartialEq for HeapSlot {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.order == other.order
    }
}
impl Eq for HeapSlot {}

impl PartialOrd for HeapSlot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapSlot {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; higher priority should pop first, and
        // at equal priority, lower tie-break-rank (trees) and earlier
        // enqueue order should pop first, so those compare as "greater".
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.kind.tie_break_rank().cmp(&self.kind.tie_break_rank()))
            .then_with(|| other.order.cmp(&self.order))
    }
}

#[derive(Default)]
struct SubQueue {
    heap: BinaryHeap<HeapSlot>,
}

struct Shared {
    sub_queues: Mutex<HashMap<RequestKind, SubQueue>>,
    pending: Mutex<HashMap<(RequestKind, ObjectId), PendingEntry>>,
    stopped: std::sync::atomic::AtomicBool,
    notify: Notify,
    enqueue_counter: AtomicU64,
}

/// Per-kind limit on how many contiguous requests a single `dequeue` call
/// may pop off one sub-queue.
#[derive(Clone, Copy, Debug)]
pub struct BatchSizes {
    pub tree: usize,
    pub blob: usize,
    pub blob_meta: usize,
}

impl Default for BatchSizes {
    fn default() -> Self {
        Self {
            tree: 32,
            blob: 16,
            blob_meta: 64,
        }
    }
}

/// Priority-scheduled request queue shared between the facade
/// ([crate::objectstore::ObjectStore]) and the worker pool
/// ([pool::ImporterPool]).
pub struct ImportRequestQueue {
    shared: Arc<Shared>,
    batch_sizes: BatchSizes,
}

impl Clone for ImportRequestQueue {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            batch_sizes: self.batch_sizes,
        }
    }
}

impl ImportRequestQueue {
    pub fn new(batch_sizes: BatchSizes) -> Self {
        let mut sub_queues = HashMap::new();
        for kind in RequestKind::ALL {
            sub_queues.insert(kind, SubQueue::default());
        }
        Self {
            shared: Arc::new(Shared {
                sub_queues: Mutex::new(sub_queues),
                pending: Mutex::new(HashMap::new()),
                stopped: std::sync::atomic::AtomicBool::new(false),
                notify: Notify::new(),
                enqueue_counter: AtomicU64::new(0),
            }),
            batch_sizes,
        }
    }

    fn batch_size_for(&self, kind: RequestKind) -> usize {
        match kind {
            RequestKind::Tree => self.batch_sizes.tree,
            RequestKind::Blob => self.batch_sizes.blob,
            RequestKind::BlobMeta => self.batch_sizes.blob_meta,
        }
    }

    /// Enqueues a request, or attaches a new waiter to an identical
    /// in-flight one. Returns a receiver that resolves once the request
    /// (or the one it was coalesced into) completes.
    pub fn enqueue(
        &self,
        kind: RequestKind,
        id: ObjectId,
        proxy_hash: Option<ProxyHash>,
        priority: i32,
    ) -> oneshot::Receiver<SharedOutcome> {
        let (tx, rx) = oneshot::channel();
        if self.shared.stopped.load(AtomicOrdering::Acquire) {
            drop(tx);
            return rx;
        }

        let key = (kind, id.clone());
        let mut pending = self.shared.pending.lock();
        if let Some(entry) = pending.get_mut(&key) {
            entry.waiters.push(tx);
            if priority > entry.priority {
                entry.priority = priority;
                entry.version += 1;
                self.push_heap_slot(kind, &id, priority, entry.version);
                self.shared.notify.notify_waiters();
            }
            return rx;
        }

        let version = 1;
        pending.insert(
            key,
            PendingEntry {
                priority,
                proxy_hash,
                enqueued_at: Instant::now(),
                version,
                waiters: vec![tx],
            },
        );
        drop(pending);
        self.push_heap_slot(kind, &id, priority, version);
        self.shared.notify.notify_waiters();
        rx
    }

    fn push_heap_slot(&self, kind: RequestKind, id: &ObjectId, priority: i32, version: u64) {
        let order = self.shared.enqueue_counter.fetch_add(1, AtomicOrdering::Relaxed);
        let slot = HeapSlot {
            priority,
            kind,
            id: id.clone(),
            version,
            order,
        };
        self.shared
            .sub_queues
            .lock()
            .get_mut(&kind)
            .expect("all kinds initialized")
            .heap
            .push(slot);
    }

    /// Returns a future attached to any in-flight request matching
    /// `(kind, id)`, raising its priority if ours is higher. Lets the
    /// facade coalesce even before this would otherwise be enqueued.
    pub fn check_in_progress(
        &self,
        kind: RequestKind,
        id: &ObjectId,
        priority: i32,
    ) -> Option<oneshot::Receiver<SharedOutcome>> {
        let mut pending = self.shared.pending.lock();
        let entry = pending.get_mut(&(kind, id.clone()))?;
        let (tx, rx) = oneshot::channel();
        entry.waiters.push(tx);
        if priority > entry.priority {
            entry.priority = priority;
            entry.version += 1;
            drop(pending);
            self.push_heap_slot(kind, id, priority, entry.version);
            self.shared.notify.notify_waiters();
        }
        Some(rx)
    }

    /// Fulfills every waiter attached to `(kind, id)` with a shared copy of
    /// `result`, and removes the tracking entry.
    pub fn mark_finished(&self, kind: RequestKind, id: &ObjectId, result: Result<FetchResult, Arc<Error>>) {
        let entry = self.shared.pending.lock().remove(&(kind, id.clone()));
        if let Some(entry) = entry {
            let shared: SharedOutcome = Arc::new(result);
            for waiter in entry.waiters {
                let _ = waiter.send(shared.clone());
            }
        }
    }

    /// Blocks until at least one request is available across all
    /// sub-queues, or the queue is stopped. Picks the highest-priority
    /// front request across sub-queues (ties broken trees, metadata,
    /// blobs), then pops up to that kind's configured batch size of
    /// contiguous requests from the same sub-queue.
    pub async fn dequeue(&self) -> Vec<QueuedRequest> {
        loop {
            if self.shared.stopped.load(AtomicOrdering::Acquire) {
                return Vec::new();
            }
            if let Some(batch) = self.try_dequeue_batch() {
                return batch;
            }
            self.shared.notify.notified().await;
        }
    }

    fn try_dequeue_batch(&self) -> Option<Vec<QueuedRequest>> {
        let mut sub_queues = self.shared.sub_queues.lock();
        let best_kind = RequestKind::ALL
            .into_iter()
            .filter_map(|kind| sub_queues.get(&kind).and_then(|q| q.heap.peek()).map(|s| (kind, s.priority, s.kind.tie_break_rank(), s.order)))
            .min_by(|a, b| {
                // max-heap semantics: pick greatest (priority, then earliest
                // tie_break_rank/order) across sub-queues.
                b.1.cmp(&a.1)
                    .then_with(|| a.2.cmp(&b.2))
                    .then_with(|| a.3.cmp(&b.3))
            })
            .map(|(kind, ..)| kind)?;

        let batch_size = self.batch_size_for(best_kind);
        let heap = &mut sub_queues.get_mut(&best_kind).unwrap().heap;
        let mut pending = self.shared.pending.lock();
        let mut batch = Vec::new();
        while batch.len() < batch_size {
            let Some(slot) = heap.pop() else { break };
            let key = (slot.kind, slot.id.clone());
            let Some(entry) = pending.get(&key) else {
                continue; // request was already fulfilled/cancelled
            };
            if entry.version != slot.version {
                continue; // stale slot superseded by a priority bump
            }
            batch.push(QueuedRequest {
                kind: slot.kind,
                id: slot.id,
                proxy_hash: entry.proxy_hash.clone(),
                priority: entry.priority,
                enqueued_at: entry.enqueued_at,
            });
        }
        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }

    /// Drains and discards all queues; wakes all waiters with a
    /// cancellation error. After this, no new requests are accepted.
    pub fn stop(&self) {
        self.shared.stopped.store(true, AtomicOrdering::Release);
        let mut pending = self.shared.pending.lock();
        for (_, entry) in pending.drain() {
            let outcome: SharedOutcome = Arc::new(Err(Arc::new(Error::Cancelled)));
            for waiter in entry.waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
        self.shared.sub_queues.lock().clear();
        self.shared.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(AtomicOrdering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> ObjectId {
        ObjectId::try_from(vec![byte; 20]).unwrap()
    }

    #[tokio::test]
    async fn higher_priority_dequeues_first() {
        let queue = ImportRequestQueue::new(BatchSizes::default());
        let _low = queue.enqueue(RequestKind::Blob, id(1), None, 0);
        let _high = queue.enqueue(RequestKind::Blob, id(2), None, 10);
        let batch = queue.dequeue().await;
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, id(2));
    }

    #[tokio::test]
    async fn ties_prefer_trees_then_meta_then_blobs() {
        let queue = ImportRequestQueue::new(BatchSizes::default());
        let _blob = queue.enqueue(RequestKind::Blob, id(1), None, 5);
        let _tree = queue.enqueue(RequestKind::Tree, id(2), None, 5);
        let batch = queue.dequeue().await;
        assert_eq!(batch[0].kind, RequestKind::Tree);
    }

    #[tokio::test]
    async fn duplicate_requests_coalesce() {
        let queue = ImportRequestQueue::new(BatchSizes::default());
        let rx1 = queue.enqueue(RequestKind::Blob, id(1), None, 0);
        let rx2 = queue.enqueue(RequestKind::Blob, id(1), None, 0);
        let batch = queue.dequeue().await;
        assert_eq!(batch.len(), 1);
        queue.mark_finished(RequestKind::Blob, &id(1), Ok(FetchResult::Blob(bytes::Bytes::from_static(b"x"))));
        let out1 = rx1.await.unwrap();
        let out2 = rx2.await.unwrap();
        assert!(out1.is_ok());
        assert!(out2.is_ok());
    }

    #[tokio::test]
    async fn stop_cancels_waiters() {
        let queue = ImportRequestQueue::new(BatchSizes::default());
        let rx = queue.enqueue(RequestKind::Blob, id(1), None, 0);
        queue.stop();
        let outcome = rx.await.unwrap();
        assert!(outcome.is_err());
        assert!(queue.dequeue().await.is_empty());
    }
}
