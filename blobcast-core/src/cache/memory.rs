use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::{CacheBackend, CacheUsage, CachedSegment, SegmentKey};

struct Entry {
    value: CachedSegment,
    inserted_at: Instant,
    last_used: u64,
}

struct Inner {
    map: HashMap<SegmentKey, Entry>,
    used_bytes: u64,
    tick: u64,
}

/// In-memory backend: strict LRU by byte size with an optional TTL.
pub struct MemoryCache {
    max_bytes: u64,
    ttl: Option<Duration>,
    inner: Mutex<Inner>,
}

impl MemoryCache {
    pub fn new(max_bytes: u64, ttl: Option<Duration>) -> Self {
        Self {
            max_bytes,
            ttl,
            inner: Mutex::new(Inner {
                map: HashMap::new(),
                used_bytes: 0,
                tick: 0,
            }),
        }
    }

    fn expired(&self, entry: &Entry) -> bool {
        match self.ttl {
            Some(ttl) => entry.inserted_at.elapsed() > ttl,
            None => false,
        }
    }

    fn drop_expired(&self, inner: &mut Inner, evicted: &mut Vec<SegmentKey>) {
        let stale: Vec<SegmentKey> = inner
            .map
            .iter()
            .filter(|(_, entry)| self.expired(entry))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            if let Some(entry) = inner.map.remove(&key) {
                inner.used_bytes -= entry.value.bytes.len() as u64;
                evicted.push(key);
            }
        }
    }

    fn evict_lru(&self, inner: &mut Inner) -> Option<SegmentKey> {
        let victim = inner
            .map
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(key, _)| key.clone())?;
        if let Some(entry) = inner.map.remove(&victim) {
            inner.used_bytes -= entry.value.bytes.len() as u64;
        }
        Some(victim)
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &SegmentKey) -> Option<CachedSegment> {
        let mut inner = self.inner.lock().expect("memory cache lock");
        inner.tick += 1;
        let tick = inner.tick;
        let expired = match inner.map.get(key) {
            Some(entry) => self.expired(entry),
            None => return None,
        };
        if expired {
            if let Some(entry) = inner.map.remove(key) {
                inner.used_bytes -= entry.value.bytes.len() as u64;
            }
            return None;
        }
        let entry = inner.map.get_mut(key)?;
        entry.last_used = tick;
        Some(entry.value.clone())
    }

    async fn insert(&self, key: SegmentKey, value: CachedSegment) -> Vec<SegmentKey> {
        let size = value.bytes.len() as u64;
        let mut evicted = Vec::new();
        if size > self.max_bytes {
            // a value that cannot fit is simply not cached
            return evicted;
        }
        let mut inner = self.inner.lock().expect("memory cache lock");
        self.drop_expired(&mut inner, &mut evicted);
        if let Some(previous) = inner.map.remove(&key) {
            inner.used_bytes -= previous.value.bytes.len() as u64;
        }
        while inner.used_bytes + size > self.max_bytes {
            match self.evict_lru(&mut inner) {
                Some(victim) => evicted.push(victim),
                None => break,
            }
        }
        inner.tick += 1;
        let tick = inner.tick;
        inner.used_bytes += size;
        inner.map.insert(
            key,
            Entry {
                value,
                inserted_at: Instant::now(),
                last_used: tick,
            },
        );
        evicted
    }

    async fn contains(&self, key: &SegmentKey) -> bool {
        let inner = self.inner.lock().expect("memory cache lock");
        inner
            .map
            .get(key)
            .map(|entry| !self.expired(entry))
            .unwrap_or(false)
    }

    async fn clear(&self) {
        let mut inner = self.inner.lock().expect("memory cache lock");
        inner.map.clear();
        inner.used_bytes = 0;
    }

    async fn usage(&self) -> CacheUsage {
        let inner = self.inner.lock().expect("memory cache lock");
        CacheUsage {
            bytes: inner.used_bytes,
            entries: inner.map.len(),
        }
    }
}
