//! TTL + LRU cache for route lookups.
//!
//! Negative results are cached too, so a storm of unroutable commands
//! cannot force repeated table scans. Capacity eviction removes the least
//! recently used entry; expiry is checked lazily on read.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    /// Monotonic access stamp for LRU eviction.
    used_seq: u64,
}

#[derive(Debug)]
struct CacheInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    seq: u64,
    hits: u64,
    misses: u64,
}

#[derive(Debug)]
pub struct RouteCache<V> {
    inner: Mutex<CacheInner<V>>,
    ttl: Duration,
    capacity: usize,
}

impl<V: Clone> RouteCache<V> {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                seq: 0,
                hits: 0,
                misses: 0,
            }),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Fetch an unexpired entry, stamping its recency.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        inner.seq += 1;
        let seq = inner.seq;
        let mut found = None;
        let mut expired = false;
        if let Some(entry) = inner.entries.get_mut(key) {
            if entry.inserted_at.elapsed() < self.ttl {
                entry.used_seq = seq;
                found = Some(entry.value.clone());
            } else {
                expired = true;
            }
        }
        if expired {
            inner.entries.remove(key);
        }
        match found {
            Some(value) => {
                inner.hits += 1;
                Some(value)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// Insert, evicting the least recently used entry when at capacity.
    pub fn put(&self, key: String, value: V) {
        let mut inner = self.inner.lock().unwrap();
        inner.seq += 1;
        let seq = inner.seq;
        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            let victim = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.used_seq)
                .map(|(k, _)| k.clone());
            if let Some(victim) = victim {
                inner.entries.remove(&victim);
            }
        }
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                used_seq: seq,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// `(hits, misses)` since startup.
    pub fn stats(&self) -> (u64, u64) {
        let inner = self.inner.lock().unwrap();
        (inner.hits, inner.misses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize) -> RouteCache<String> {
        RouteCache::new(Duration::from_secs(600), capacity)
    }

    #[test]
    fn hit_after_put() {
        let c = cache(4);
        c.put("cmd:2001".into(), "message".into());
        assert_eq!(c.get("cmd:2001"), Some("message".into()));
        assert_eq!(c.stats(), (1, 0));
    }

    #[test]
    fn miss_counted() {
        let c = cache(4);
        assert_eq!(c.get("cmd:9999"), None);
        assert_eq!(c.stats(), (0, 1));
    }

    #[test]
    fn lru_eviction_at_capacity() {
        let c = cache(2);
        c.put("a".into(), "1".into());
        c.put("b".into(), "2".into());
        // Touch "a" so "b" becomes the LRU victim.
        assert!(c.get("a").is_some());
        c.put("c".into(), "3".into());
        assert_eq!(c.len(), 2);
        assert!(c.get("a").is_some());
        assert!(c.get("b").is_none());
        assert!(c.get("c").is_some());
    }

    #[test]
    fn mixed_reads_keep_counters_straight() {
        let c = cache(4);
        c.put("cmd:2001".into(), "message".into());
        assert_eq!(c.get("cmd:2001"), Some("message".into()));
        assert_eq!(c.get("cmd:2001"), Some("message".into()));
        assert_eq!(c.get("cmd:9999"), None);
        assert_eq!(c.stats(), (2, 1));
    }

    #[test]
    fn ttl_expiry() {
        let c: RouteCache<String> = RouteCache::new(Duration::ZERO, 4);
        c.put("a".into(), "1".into());
        assert_eq!(c.get("a"), None);
        assert_eq!(c.len(), 0);
    }

    #[test]
    fn overwrite_does_not_evict() {
        let c = cache(2);
        c.put("a".into(), "1".into());
        c.put("b".into(), "2".into());
        c.put("a".into(), "3".into());
        assert_eq!(c.len(), 2);
        assert_eq!(c.get("a"), Some("3".into()));
        assert_eq!(c.get("b"), Some("2".into()));
    }
}
