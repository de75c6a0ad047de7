use std::hash::Hash;
use std::num::NonZeroUsize;

/// Counters exposed by every [`MeteredLruCache`].
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub current_size: usize,
    pub max_size: usize,
}

impl CacheMetrics {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// O(1) LRU cache with hit/miss/eviction accounting.
///
/// `get` promotes the entry to most-recently-used; `put` on a full cache
/// evicts the least-recently-used entry. Callers own the locking; each
/// using component keeps its cache behind its own mutex.
pub struct MeteredLruCache<K: Hash + Eq, V> {
    inner: lru::LruCache<K, V>,
    hits: u64,
    misses: u64,
    evictions: u64,
    invalidations: u64,
}

impl<K: Hash + Eq, V> MeteredLruCache<K, V> {
    /// Panics if `capacity` is zero; cache sizes are configuration
    /// constants, never derived from input.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: lru::LruCache::new(NonZeroUsize::new(capacity).expect("cache capacity must be non-zero")),
            hits: 0,
            misses: 0,
            evictions: 0,
            invalidations: 0,
        }
    }

    pub fn get(&mut self, key: &K) -> Option<&V> {
        match self.inner.get(key) {
            Some(value) => {
                self.hits += 1;
                Some(value)
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn put(&mut self, key: K, value: V) {
        let at_capacity = self.inner.len() == usize::from(self.inner.cap());
        let replacing = self.inner.contains(&key);
        if at_capacity && !replacing {
            self.evictions += 1;
        }
        self.inner.put(key, value);
    }

    pub fn invalidate(&mut self) {
        self.inner.clear();
        self.invalidations += 1;
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.inner.pop(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            invalidations: self.invalidations,
            current_size: self.inner.len(),
            max_size: usize::from(self.inner.cap()),
        }
    }

    pub fn reset_metrics(&mut self) {
        self.hits = 0;
        self.misses = 0;
        self.evictions = 0;
        self.invalidations = 0;
    }
}
