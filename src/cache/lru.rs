//! Bounded LRU cache with optional per-entry TTL (spec.md §4.2).

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

/// A fixed-capacity, thread-safe LRU cache. `get` promotes the entry to
/// most-recently-used; entries past their TTL (if configured) are treated
/// as absent and removed on read. Inserting beyond capacity evicts the
/// least-recently-used entry.
pub struct LruCache<K, V> {
    inner: parking_lot::Mutex<Inner<K, V>>,
    capacity: usize,
    ttl: Option<Duration>,
}

struct Inner<K, V> {
    map: HashMap<K, Entry<V>>,
    /// Most-recently-used at the back.
    order: Vec<K>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<K: Eq + Hash + Clone, V: Clone> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: parking_lot::Mutex::new(Inner {
                map: HashMap::new(),
                order: Vec::new(),
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            capacity: capacity.max(1),
            ttl: None,
        }
    }

    pub fn with_ttl(capacity: usize, ttl: Duration) -> Self {
        let mut c = Self::new(capacity);
        c.ttl = Some(ttl);
        c
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        if let Some(ttl) = self.ttl {
            if let Some(entry) = inner.map.get(key) {
                if entry.inserted_at.elapsed() > ttl {
                    inner.map.remove(key);
                    inner.order.retain(|k| k != key);
                    inner.misses += 1;
                    return None;
                }
            }
        }
        if inner.map.contains_key(key) {
            inner.order.retain(|k| k != key);
            inner.order.push(key.clone());
            inner.hits += 1;
            inner.map.get(key).map(|e| e.value.clone())
        } else {
            inner.misses += 1;
            None
        }
    }

    pub fn set(&self, key: K, value: V) {
        let mut inner = self.inner.lock();
        let is_new = !inner.map.contains_key(&key);
        inner.map.insert(
            key.clone(),
            Entry {
                value,
                inserted_at: Instant::now(),
            },
        );
        inner.order.retain(|k| k != &key);
        inner.order.push(key);
        if is_new && inner.order.len() > self.capacity {
            if let Some(lru_key) = inner.order.first().cloned() {
                inner.order.remove(0);
                inner.map.remove(&lru_key);
                inner.evictions += 1;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            size: inner.map.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn evicts_least_recently_used_on_overflow() {
        let cache = LruCache::new(2);
        cache.set("a", 1);
        cache.set("b", 2);
        assert_eq!(cache.get(&"a"), Some(1)); // "a" now MRU
        cache.set("c", 3); // evicts "b", the LRU
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"c"), Some(3));
    }

    #[test]
    fn ttl_expires_entries_on_read() {
        let cache = LruCache::with_ttl(10, Duration::from_millis(10));
        cache.set("k", "v");
        assert_eq!(cache.get(&"k"), Some("v"));
        sleep(Duration::from_millis(25));
        assert_eq!(cache.get(&"k"), None);
    }

    #[test]
    fn counters_track_hits_misses_evictions() {
        let cache = LruCache::new(1);
        cache.set("a", 1);
        cache.get(&"a");
        cache.get(&"missing");
        cache.set("b", 2);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.evictions, 1);
    }
}
