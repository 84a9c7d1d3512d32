//! Weighted LRU cache sitting in front of [crate::localstore::LocalStore].
//! Eviction stops only once *both* the byte cap and the minimum entry
//! count are satisfied, with the minimum-count rule taking precedence —
//! a cache holding a handful of huge objects should not be allowed to
//! empty itself down to zero entries just to fit the byte budget.

use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;

use crate::ObjectId;

#[derive(Debug, Default)]
pub struct CacheCounters {
    pub hit_count: AtomicU64,
    pub miss_count: AtomicU64,
    pub eviction_count: AtomicU64,
    pub drop_count: AtomicU64,
}

struct Entry {
    bytes: bytes::Bytes,
}

struct Inner {
    entries: LruCache<ObjectId, Entry>,
    total_bytes: u64,
}

/// Configuration for an [InMemoryObjectCache].
#[derive(Clone, Copy, Debug)]
pub struct CacheConfig {
    pub max_total_bytes: u64,
    pub min_entry_count: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_total_bytes: 256 * 1024 * 1024,
            min_entry_count: 64,
        }
    }
}

pub struct InMemoryObjectCache {
    config: CacheConfig,
    inner: Mutex<Inner>,
    counters: CacheCounters,
}

impl InMemoryObjectCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                total_bytes: 0,
            }),
            counters: CacheCounters::default(),
        }
    }

    pub fn get(&self, id: &ObjectId) -> Option<bytes::Bytes> {
        let mut inner = self.inner.lock();
        match inner.entries.get(id) {
            Some(entry) => {
                let bytes = entry.bytes.clone();
                self.counters.hit_count.fetch_add(1, Ordering::Relaxed);
                Some(bytes)
            }
            None => {
                self.counters.miss_count.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, id: ObjectId, bytes: bytes::Bytes) {
        let mut inner = self.inner.lock();
        let size = bytes.len() as u64;
        if let Some(old) = inner.entries.insert(id, Entry { bytes }) {
            inner.total_bytes -= old.bytes.len() as u64;
        }
        inner.total_bytes += size;
        self.evict_locked(&mut inner);
    }

    fn evict_locked(&self, inner: &mut Inner) {
        while inner.total_bytes > self.config.max_total_bytes
            && inner.entries.len() > self.config.min_entry_count
        {
            if let Some((_, entry)) = inner.entries.pop_lru() {
                inner.total_bytes -= entry.bytes.len() as u64;
                self.counters.eviction_count.fetch_add(1, Ordering::Relaxed);
            } else {
                break;
            }
        }
    }

    pub fn object_count(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn total_size_in_bytes(&self) -> u64 {
        self.inner.lock().total_bytes
    }

    pub fn hit_count(&self) -> u64 {
        self.counters.hit_count.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.counters.miss_count.load(Ordering::Relaxed)
    }

    pub fn eviction_count(&self) -> u64 {
        self.counters.eviction_count.load(Ordering::Relaxed)
    }

    pub fn drop_count(&self) -> u64 {
        self.counters.drop_count.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(byte: u8) -> ObjectId {
        ObjectId::try_from(vec![byte; 20]).unwrap()
    }

    #[test]
    fn hit_and_miss_are_counted() {
        let cache = InMemoryObjectCache::new(CacheConfig {
            max_total_bytes: 1024,
            min_entry_count: 1,
        });
        assert!(cache.get(&id(1)).is_none());
        cache.insert(id(1), bytes::Bytes::from_static(b"hello"));
        assert!(cache.get(&id(1)).is_some());
        assert_eq!(cache.hit_count(), 1);
        assert_eq!(cache.miss_count(), 1);
    }

    #[test]
    fn min_entry_count_wins_over_byte_cap() {
        let cache = InMemoryObjectCache::new(CacheConfig {
            max_total_bytes: 1,
            min_entry_count: 3,
        });
        cache.insert(id(1), bytes::Bytes::from_static(b"aaaa"));
        cache.insert(id(2), bytes::Bytes::from_static(b"bbbb"));
        cache.insert(id(3), bytes::Bytes::from_static(b"cccc"));
        // byte cap is wildly exceeded, but min_entry_count=3 keeps all three.
        assert_eq!(cache.object_count(), 3);
    }

    #[test]
    fn evicts_least_recently_used_first() {
        let cache = InMemoryObjectCache::new(CacheConfig {
            max_total_bytes: 8,
            min_entry_count: 1,
        });
        cache.insert(id(1), bytes::Bytes::from_static(b"aaaa"));
        cache.insert(id(2), bytes::Bytes::from_static(b"bbbb"));
        // touch id(1) so id(2) becomes the least-recently-used entry.
        cache.get(&id(1));
        cache.insert(id(3), bytes::Bytes::from_static(b"cccc"));
        assert!(cache.get(&id(2)).is_none());
        assert!(cache.get(&id(1)).is_some());
        assert!(cache.get(&id(3)).is_some());
    }
}
