//! Bounded in-memory cache backend.
//!
//! # Responsibilities
//! - Enforce a total byte capacity and a per-item size limit
//! - Expire entries lazily on read (and on demand via `purge_expired`)
//! - Evict by sampled approximate LRU when a new item does not fit
//!
//! # Design Decisions
//! - One mutex guards all state; reads update last-access time and need it too
//! - Eviction inspects a fixed-size random sample, so its cost does not grow
//!   with the number of entries
//! - Expired entries in the sample are evicted before live ones

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use bytes::Bytes;

use crate::cache::{Cache, CacheKey};
use crate::observability::metrics;

/// Number of keys inspected per eviction.
const EVICTION_SAMPLE_SIZE: usize = 5;

struct Entry {
    value: Bytes,
    expires_at: Instant,
    last_access: Instant,
    /// Position of this entry's key in `Inner::keys`.
    slot: usize,
}

#[derive(Default)]
struct Inner {
    size: usize,
    keys: Vec<CacheKey>,
    items: HashMap<CacheKey, Entry>,
}

impl Inner {
    fn remove(&mut self, key: CacheKey) -> Option<Entry> {
        let entry = self.items.remove(&key)?;
        self.keys.swap_remove(entry.slot);
        if let Some(moved) = self.keys.get(entry.slot).copied() {
            if let Some(moved_entry) = self.items.get_mut(&moved) {
                moved_entry.slot = entry.slot;
            }
        }
        self.size -= entry.value.len();
        Some(entry)
    }

    fn insert(&mut self, key: CacheKey, value: Bytes, expires_at: Instant, now: Instant) {
        self.size += value.len();
        self.keys.push(key);
        self.items.insert(
            key,
            Entry {
                value,
                expires_at,
                last_access: now,
                slot: self.keys.len() - 1,
            },
        );
    }

    /// Choose a victim among a random sample of keys.
    fn eviction_candidate(&self, now: Instant) -> Option<CacheKey> {
        let sample: Vec<CacheKey> = if self.keys.len() <= EVICTION_SAMPLE_SIZE {
            self.keys.clone()
        } else {
            (0..EVICTION_SAMPLE_SIZE)
                .map(|_| self.keys[fastrand::usize(..self.keys.len())])
                .collect()
        };

        let mut oldest: Option<(CacheKey, Instant)> = None;
        for key in sample {
            let Some(entry) = self.items.get(&key) else {
                continue;
            };
            if entry.expires_at <= now {
                return Some(key);
            }
            match oldest {
                Some((_, last_access)) if last_access <= entry.last_access => {}
                _ => oldest = Some((key, entry.last_access)),
            }
        }
        oldest.map(|(key, _)| key)
    }
}

/// A capacity-bounded [`Cache`] held in process memory.
pub struct MemoryCache {
    capacity: usize,
    max_item_size: usize,
    inner: Mutex<Inner>,
}

impl MemoryCache {
    pub fn new(capacity: usize, max_item_size: usize) -> Self {
        Self {
            capacity,
            max_item_size,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Number of entries currently held, expired or not.
    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes of stored values.
    pub fn size(&self) -> usize {
        self.lock().size
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    pub(crate) fn purge_expired_at(&self, now: Instant) -> usize {
        let mut inner = self.lock();
        let expired: Vec<CacheKey> = inner
            .items
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(key, _)| *key)
            .collect();

        for key in &expired {
            inner.remove(*key);
        }
        metrics::record_cache_size(inner.items.len(), inner.size);
        expired.len()
    }

    pub(crate) fn get_at(&self, key: CacheKey, now: Instant) -> Option<Bytes> {
        let mut inner = self.lock();

        let entry = inner.items.get_mut(&key)?;
        if entry.expires_at > now {
            entry.last_access = now;
            return Some(entry.value.clone());
        }

        inner.remove(key);
        metrics::record_cache_size(inner.items.len(), inner.size);
        None
    }

    pub(crate) fn set_at(&self, key: CacheKey, value: Bytes, expires_at: Instant, now: Instant) {
        let item_size = value.len();
        if item_size > self.max_item_size || item_size > self.capacity {
            tracing::debug!(
                key = %key,
                size = item_size,
                max_item_size = self.max_item_size,
                "Cache item too large, not stored"
            );
            return;
        }
        if expires_at <= now {
            return;
        }

        let mut inner = self.lock();
        inner.remove(key);

        let mut evicted = 0usize;
        while inner.size + item_size > self.capacity {
            let Some(victim) = inner.eviction_candidate(now) else {
                break;
            };
            inner.remove(victim);
            evicted += 1;
        }

        inner.insert(key, value, expires_at, now);

        if evicted > 0 {
            metrics::record_cache_evictions(evicted);
            tracing::debug!(key = %key, evicted, size = inner.size, "Evicted cache entries");
        }
        metrics::record_cache_size(inner.items.len(), inner.size);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: CacheKey) -> Option<Bytes> {
        self.get_at(key, Instant::now())
    }

    fn set(&self, key: CacheKey, value: Bytes, expires_at: Instant) {
        self.set_at(key, value, expires_at, Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key(n: u64) -> CacheKey {
        CacheKey::new(n)
    }

    fn bytes(len: usize) -> Bytes {
        Bytes::from(vec![b'x'; len])
    }

    #[test]
    fn stores_and_returns_values() {
        let cache = MemoryCache::new(1024, 256);
        let now = Instant::now();
        cache.set_at(key(1), Bytes::from_static(b"hello"), now + Duration::from_secs(60), now);

        assert_eq!(cache.get_at(key(1), now), Some(Bytes::from_static(b"hello")));
        assert_eq!(cache.get_at(key(2), now), None);
        assert_eq!(cache.size(), 5);
    }

    #[test]
    fn oversized_items_are_dropped() {
        let cache = MemoryCache::new(100, 10);
        let now = Instant::now();
        let later = now + Duration::from_secs(60);

        cache.set_at(key(1), bytes(11), later, now);
        assert!(cache.is_empty());

        let tiny_capacity = MemoryCache::new(8, 10);
        tiny_capacity.set_at(key(1), bytes(9), later, now);
        assert!(tiny_capacity.is_empty());
    }

    #[test]
    fn expired_entries_are_absent() {
        let cache = MemoryCache::new(1024, 256);
        let now = Instant::now();
        cache.set_at(key(1), bytes(4), now + Duration::from_secs(1), now);

        assert!(cache.get_at(key(1), now + Duration::from_secs(2)).is_none());
        assert!(cache.is_empty());
        assert_eq!(cache.size(), 0);
    }

    #[test]
    fn already_expired_set_is_ignored() {
        let cache = MemoryCache::new(1024, 256);
        let now = Instant::now();
        cache.set_at(key(1), bytes(4), now, now);
        assert!(cache.is_empty());
    }

    #[test]
    fn replacing_a_key_releases_its_size() {
        let cache = MemoryCache::new(20, 20);
        let now = Instant::now();
        let later = now + Duration::from_secs(60);

        cache.set_at(key(1), bytes(10), later, now);
        cache.set_at(key(2), bytes(10), later, now);
        cache.set_at(key(1), bytes(10), later, now);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.size(), 20);
        assert!(cache.get_at(key(2), now).is_some());
    }

    #[test]
    fn evicts_least_recently_accessed() {
        let cache = MemoryCache::new(20, 20);
        let start = Instant::now();
        let later = start + Duration::from_secs(600);

        cache.set_at(key(1), bytes(10), later, start);
        cache.set_at(key(2), bytes(10), later, start + Duration::from_secs(1));
        cache.get_at(key(1), start + Duration::from_secs(2));
        cache.set_at(key(3), bytes(10), later, start + Duration::from_secs(3));

        let now = start + Duration::from_secs(4);
        assert!(cache.get_at(key(1), now).is_some());
        assert!(cache.get_at(key(2), now).is_none());
        assert!(cache.get_at(key(3), now).is_some());
    }

    #[test]
    fn prefers_evicting_expired_entries() {
        let cache = MemoryCache::new(30, 30);
        let start = Instant::now();

        cache.set_at(key(1), bytes(10), start + Duration::from_secs(600), start);
        cache.set_at(key(2), bytes(10), start + Duration::from_secs(5), start + Duration::from_secs(1));
        cache.set_at(key(3), bytes(10), start + Duration::from_secs(600), start + Duration::from_secs(2));

        let now = start + Duration::from_secs(10);
        cache.set_at(key(4), bytes(10), now + Duration::from_secs(600), now);

        assert!(cache.get_at(key(1), now).is_some());
        assert!(cache.get_at(key(3), now).is_some());
        assert!(cache.get_at(key(4), now).is_some());
    }

    #[test]
    fn size_stays_within_capacity_and_evicts_minimally() {
        let cache = MemoryCache::new(1000, 100);
        let now = Instant::now();
        let later = now + Duration::from_secs(600);

        for n in 0..200u64 {
            let len = 10 + (n as usize * 7) % 90;
            let before = cache.size();
            cache.set_at(key(n), bytes(len), later, now);

            assert!(cache.size() <= 1000);
            assert!(cache.get_at(key(n), now).is_some());
            if before + len <= 1000 {
                assert_eq!(cache.size(), before + len);
            }
        }
    }

    #[test]
    fn purge_removes_only_expired() {
        let cache = MemoryCache::new(1024, 256);
        let now = Instant::now();
        cache.set_at(key(1), bytes(4), now + Duration::from_secs(1), now);
        cache.set_at(key(2), bytes(4), now + Duration::from_secs(100), now);

        assert_eq!(cache.purge_expired_at(now + Duration::from_secs(10)), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.size(), 4);
    }

    #[test]
    fn concurrent_access_is_safe() {
        let cache = std::sync::Arc::new(MemoryCache::new(4096, 64));
        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for n in 0..500u64 {
                        let k = key(t * 1000 + n % 50);
                        cache.set(k, bytes(32), Instant::now() + Duration::from_secs(60));
                        cache.get(k);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert!(cache.size() <= 4096);
    }
}
