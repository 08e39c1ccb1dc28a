//! Bounded TTL cache with least-recently-used eviction.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

#[derive(Debug)]
struct Entry<V> {
    value: V,
    /// `None` when `now + ttl` does not fit in an `Instant`; such entries
    /// only leave through LRU eviction.
    expires_at: Option<Instant>,
}

impl<V> Entry<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// A map whose entries expire after a TTL and whose size is capped.
///
/// Expired entries are dropped before any live entry is evicted for space.
/// Time is passed in by the caller.
#[derive(Debug)]
pub struct TtlCache<K: Hash + Eq, V> {
    entries: LruCache<K, Entry<V>>,
}

fn non_zero(capacity: usize) -> NonZeroUsize {
    NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN)
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: LruCache::new(non_zero(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.cap().get()
    }

    /// Change the capacity. Shrinking drops expired entries first, then the
    /// least recently used ones.
    pub fn set_capacity(&mut self, capacity: usize, now: Instant) {
        let capacity = non_zero(capacity);
        if capacity < self.entries.cap() {
            self.evict(now);
        }
        self.entries.resize(capacity);
    }

    /// Live value for `key`, marking it most recently used.
    pub fn get(&mut self, key: &K, now: Instant) -> Option<V> {
        match self.entries.get(key) {
            Some(entry) if entry.is_live(now) => return Some(entry.value.clone()),
            Some(_) => {}
            None => return None,
        }
        self.entries.pop(key);
        None
    }

    pub fn insert(&mut self, key: K, value: V, ttl: Duration, now: Instant) {
        if !self.entries.contains(&key) && self.entries.len() >= self.capacity() {
            self.evict(now);
        }
        // A full cache still drops its least recently used entry here.
        self.entries.put(
            key,
            Entry {
                value,
                expires_at: now.checked_add(ttl),
            },
        );
    }

    /// Drop expired entries.
    pub fn evict(&mut self, now: Instant) {
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.entries.pop(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(300);

    #[test]
    fn entries_expire_after_ttl() {
        let start = Instant::now();
        let mut cache = TtlCache::new(4);
        cache.insert("rust", 1, TTL, start);
        assert_eq!(cache.get(&"rust", start + Duration::from_secs(299)), Some(1));
        assert_eq!(cache.get(&"rust", start + TTL), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn least_recently_used_is_evicted_beyond_capacity() {
        let now = Instant::now();
        let mut cache = TtlCache::new(2);
        cache.insert("a", 1, TTL, now);
        cache.insert("b", 2, TTL, now);
        // Reading "a" makes "b" the eviction candidate.
        assert_eq!(cache.get(&"a", now), Some(1));
        cache.insert("c", 3, TTL, now);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"b", now), None);
        assert_eq!(cache.get(&"a", now), Some(1));
        assert_eq!(cache.get(&"c", now), Some(3));
    }

    #[test]
    fn expired_entries_go_before_live_ones() {
        let now = Instant::now();
        let mut cache = TtlCache::new(2);
        cache.insert("old", 1, Duration::from_secs(1), now);
        cache.insert("warm", 2, TTL, now);
        // Leaves "warm" least recently used, so only expiry can spare it.
        assert_eq!(cache.get(&"old", now), Some(1));
        cache.insert("new", 3, TTL, now + Duration::from_secs(5));

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"warm", now + Duration::from_secs(5)), Some(2));
        assert_eq!(cache.get(&"new", now + Duration::from_secs(5)), Some(3));
    }

    #[test]
    fn shrinking_capacity_keeps_most_recent() {
        let now = Instant::now();
        let mut cache = TtlCache::new(3);
        for (i, key) in ["a", "b", "c"].into_iter().enumerate() {
            cache.insert(key, i, TTL, now);
        }
        cache.set_capacity(1, now);
        assert_eq!(cache.capacity(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"c", now), Some(2));
    }

    #[test]
    fn oversized_ttl_does_not_overflow() {
        let now = Instant::now();
        let mut cache = TtlCache::new(2);
        cache.insert("forever", 1, Duration::MAX, now);
        assert_eq!(cache.get(&"forever", now + Duration::from_secs(86_400)), Some(1));
    }
}
