//! Bounded caches for the two immutable entity types (Change, SourceStamp).
//!
//! Both entities are written once and never updated, so a plain LRU with no
//! invalidation path is sufficient: once a row is cached it is correct for
//! the lifetime of the process.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

/// Default capacity, matching the original's unbounded-but-practically-small
/// `util.LRUCache()` default of holding the working set of recently touched
/// rows; 1000 covers a busy buildmaster's recent changes/sourcestamps.
pub const DEFAULT_CAPACITY: usize = 1000;

pub struct BoundedCache<K, V> {
    inner: Mutex<LruCache<K, V>>,
}

impl<K: Hash + Eq, V: Clone> BoundedCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap());
        BoundedCache {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().expect("cache mutex poisoned").get(key).cloned()
    }

    pub fn put(&self, key: K, value: V) {
        self.inner.lock().expect("cache mutex poisoned").put(key, value);
    }
}

impl<K: Hash + Eq, V: Clone> Default for BoundedCache<K, V> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
