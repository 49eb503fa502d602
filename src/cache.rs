//! The L2-table cache (sharded LRU, keyed by host offset) plus the smaller single-shard
//! caches used for refcount blocks and decompressed cluster bytes.

use lru::LruCache;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
    pub insertions: AtomicU64,
}

impl CacheStats {
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
            self.evictions.load(Ordering::Relaxed),
            self.insertions.load(Ordering::Relaxed),
        )
    }
}

const SHARD_COUNT: usize = 8;

fn shard_for(offset: u64) -> usize {
    let mut hasher = DefaultHasher::new();
    (offset >> 16).hash(&mut hasher);
    (hasher.finish() as usize) % SHARD_COUNT
}

/// Sharded LRU keyed by host byte offset, holding raw cluster bytes (one full L2 table per
/// entry). Each shard has its own lock so lookups in different shards never contend.
pub struct L2Cache {
    shards: Vec<Mutex<LruCache<u64, Vec<u8>>>>,
    stats: CacheStats,
}

impl L2Cache {
    pub fn new(total_capacity: usize) -> Self {
        let per_shard = (total_capacity / SHARD_COUNT).max(1);
        let cap = NonZeroUsize::new(per_shard).unwrap();
        let shards = (0..SHARD_COUNT).map(|_| Mutex::new(LruCache::new(cap))).collect();
        Self {
            shards,
            stats: CacheStats::default(),
        }
    }

    pub fn get(&self, offset: u64) -> Option<Vec<u8>> {
        let mut shard = self.shards[shard_for(offset)].lock().unwrap();
        let hit = shard.get(&offset).cloned();
        if hit.is_some() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    pub fn put(&self, offset: u64, bytes: Vec<u8>) {
        let mut shard = self.shards[shard_for(offset)].lock().unwrap();
        self.stats.insertions.fetch_add(1, Ordering::Relaxed);
        if shard.len() >= shard.cap().get() && !shard.contains(&offset) {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
        shard.put(offset, bytes);
    }

    pub fn invalidate(&self, offset: u64) {
        let mut shard = self.shards[shard_for(offset)].lock().unwrap();
        shard.pop(&offset);
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            shard.lock().unwrap().clear();
        }
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

/// Single-shard LRU used for the refcount-block cache and the decompressed-cluster cache,
/// both of which are small and don't need sharding.
pub struct SingleLru<K: Eq + Hash, V: Clone> {
    inner: Mutex<LruCache<K, V>>,
    stats: CacheStats,
}

impl<K: Eq + Hash + Clone, V: Clone> SingleLru<K, V> {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            inner: Mutex::new(LruCache::new(cap)),
            stats: CacheStats::default(),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        let hit = inner.get(key).cloned();
        if hit.is_some() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    pub fn put(&self, key: K, value: V) {
        let mut inner = self.inner.lock().unwrap();
        self.stats.insertions.fetch_add(1, Ordering::Relaxed);
        if inner.len() >= inner.cap().get() && !inner.contains(&key) {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
        inner.put(key, value);
    }

    pub fn invalidate(&self, key: &K) {
        self.inner.lock().unwrap().pop(key);
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn l2_cache_hit_and_miss_counted() {
        let cache = L2Cache::new(16);
        assert!(cache.get(100).is_none());
        cache.put(100, vec![1, 2, 3]);
        assert_eq!(cache.get(100), Some(vec![1, 2, 3]));
        let (hits, misses, _, inserts) = cache.stats().snapshot();
        assert_eq!(hits, 1);
        assert_eq!(misses, 1);
        assert_eq!(inserts, 1);
    }

    #[test]
    fn l2_cache_invalidate_drops_without_disturbing_others() {
        let cache = L2Cache::new(16);
        cache.put(100, vec![1]);
        cache.put(100 + (1 << 16), vec![2]); // different shard bucket key space
        cache.invalidate(100);
        assert!(cache.get(100).is_none());
    }

    #[test]
    fn single_lru_evicts_oldest() {
        let cache: SingleLru<u64, u8> = SingleLru::new(1);
        cache.put(1, 10);
        cache.put(2, 20);
        assert!(cache.get(&1).is_none());
        assert_eq!(cache.get(&2), Some(20));
    }
}
