//! Bucket-aware read-through cache.
//!
//! Entries are keyed by `(bucket, key)` and evicted least-recently-used first
//! once the byte total `len(key) + len(value)` would exceed the capacity. The
//! cache only accelerates reads; the store invalidates after every committed
//! mutation.

use lru::LruCache;
use parking_lot::Mutex;

use crate::constants::DEFAULT_CACHE_CAPACITY;

type CacheKey = (Vec<u8>, Vec<u8>);

struct Inner {
    entries: LruCache<CacheKey, Vec<u8>>,
    size: usize,
    /// Bumped by every invalidation.
    epoch: u64,
}

impl Inner {
    fn remove_entry(&mut self, key: &CacheKey) {
        if let Some(value) = self.entries.pop(key) {
            self.size -= key.1.len() + value.len();
        }
    }
}

/// LRU over `(bucket, key) -> value` bounded by total bytes.
pub struct BucketCache {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl BucketCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(Inner {
                entries: LruCache::unbounded(),
                size: 0,
                epoch: 0,
            }),
        }
    }

    /// Inserts or replaces an entry, evicting old ones until it fits.
    pub fn add(&self, bucket: &[u8], key: &[u8], value: &[u8]) {
        let mut inner = self.inner.lock();
        self.insert_locked(&mut inner, bucket, key, value);
    }

    /// Current invalidation epoch. Pair with [`BucketCache::add_if_current`].
    pub fn epoch(&self) -> u64 {
        self.inner.lock().epoch
    }

    /// Caches a value read from the store unless an invalidation happened
    /// since `epoch` was taken, in which case the value may already be stale.
    pub fn add_if_current(&self, epoch: u64, bucket: &[u8], key: &[u8], value: &[u8]) {
        let mut inner = self.inner.lock();
        if inner.epoch == epoch {
            self.insert_locked(&mut inner, bucket, key, value);
        }
    }

    fn insert_locked(&self, inner: &mut Inner, bucket: &[u8], key: &[u8], value: &[u8]) {
        let cost = key.len() + value.len();
        let ckey = (bucket.to_vec(), key.to_vec());
        inner.remove_entry(&ckey);
        if cost > self.capacity {
            return;
        }
        while inner.size + cost > self.capacity {
            match inner.entries.pop_lru() {
                Some((evicted, value)) => inner.size -= evicted.1.len() + value.len(),
                None => break,
            }
        }
        inner.entries.put(ckey, value.to_vec());
        inner.size += cost;
    }

    /// Returns a copy of the cached value and refreshes its recency.
    pub fn get(&self, bucket: &[u8], key: &[u8]) -> Option<Vec<u8>> {
        let ckey = (bucket.to_vec(), key.to_vec());
        self.inner.lock().entries.get(&ckey).cloned()
    }

    pub fn remove(&self, bucket: &[u8], key: &[u8]) {
        let ckey = (bucket.to_vec(), key.to_vec());
        let mut inner = self.inner.lock();
        inner.epoch += 1;
        inner.remove_entry(&ckey);
    }

    /// Drops every entry of `bucket`.
    pub fn remove_bucket(&self, bucket: &[u8]) {
        let mut inner = self.inner.lock();
        inner.epoch += 1;
        let doomed: Vec<CacheKey> = inner
            .entries
            .iter()
            .filter(|(k, _)| k.0 == bucket)
            .map(|(k, _)| k.clone())
            .collect();
        for key in doomed {
            inner.remove_entry(&key);
        }
    }

    pub fn purge(&self) {
        let mut inner = self.inner.lock();
        inner.epoch += 1;
        inner.entries.clear();
        inner.size = 0;
    }

    /// Bytes currently accounted.
    pub fn size(&self) -> usize {
        self.inner.lock().size
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BucketCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}
