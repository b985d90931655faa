//! Response cache (`spec.md` §4.6): TTL lookup, conditional
//! revalidation bookkeeping (ETag / Last-Modified), LRU/LFU/FIFO
//! eviction bounded by entry count and byte size, and error-triggered
//! invalidation.
//!
//! The cache does not perform HTTP itself — it only tracks entries
//! and tells the caller (the fetcher) whether to skip the request,
//! issue a conditional request, or issue a full one. Backed by
//! `lru::LruCache` for the LRU policy (the teacher's own
//! `EmbeddingCache` does the same) and `indexmap::IndexMap` for
//! FIFO/LFU, whose insertion-order iteration gives FIFO eviction for
//! free and a stable tiebreak for LFU.

use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use lru::LruCache;

use connect_core::model::EvictionPolicy;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub stored_at: Instant,
    pub last_access: Instant,
    pub hit_count: u64,
    pub size_bytes: u64,
}

impl CacheEntry {
    fn new(body: Vec<u8>, content_type: Option<String>, etag: Option<String>, last_modified: Option<String>, now: Instant) -> Self {
        let size_bytes = body.len() as u64;
        Self {
            body,
            content_type,
            etag,
            last_modified,
            stored_at: now,
            last_access: now,
            hit_count: 0,
            size_bytes,
        }
    }
}

/// What the cache tells the fetcher to do for a given key.
#[derive(Debug)]
pub enum Lookup {
    /// Fresh hit; serve this body, issue no HTTP.
    Fresh(CacheEntry),
    /// Stale but revalidatable: issue a conditional request with the
    /// given validators.
    Revalidate { etag: Option<String>, last_modified: Option<String> },
    /// No usable entry; issue a full request.
    Miss,
}

fn hash_key(method: &str, url: &str, headers: &[(&str, &str)]) -> String {
    use std::collections::hash_map::DefaultHasher;
    let mut hasher = DefaultHasher::new();
    method.hash(&mut hasher);
    url.hash(&mut hasher);
    let mut sorted: Vec<&(&str, &str)> = headers.iter().collect();
    sorted.sort();
    for (k, v) in sorted {
        k.hash(&mut hasher);
        v.hash(&mut hasher);
    }
    format!("{:016x}", hasher.finish())
}

/// Backing store: `lru::LruCache` tracks recency for the `Lru` policy
/// natively; `Fifo`/`Lfu` use an `IndexMap` so insertion order (the
/// FIFO victim, and the LFU tiebreak) falls out of iteration order
/// instead of a separate sequence counter.
enum Store {
    Lru(LruCache<String, CacheEntry>),
    Indexed(IndexMap<String, CacheEntry>),
}

impl Store {
    /// `Lru` is built unbounded: capacity is enforced by
    /// `ResponseCache::evict_if_needed` (which also tracks the byte
    /// budget and the eviction counter), not by `LruCache` itself — a
    /// bounded `LruCache::put` would silently evict on its own and
    /// both of those would fall out of sync.
    fn new(policy: EvictionPolicy) -> Self {
        match policy {
            EvictionPolicy::Lru => Store::Lru(LruCache::unbounded()),
            EvictionPolicy::Fifo | EvictionPolicy::Lfu => Store::Indexed(IndexMap::new()),
        }
    }

    fn get_mut(&mut self, key: &str) -> Option<&mut CacheEntry> {
        match self {
            Store::Lru(c) => c.get_mut(key),
            Store::Indexed(m) => m.get_mut(key),
        }
    }

    fn insert(&mut self, key: String, entry: CacheEntry) {
        match self {
            Store::Lru(c) => {
                c.put(key, entry);
            }
            Store::Indexed(m) => {
                m.insert(key, entry);
            }
        }
    }

    fn remove(&mut self, key: &str) {
        match self {
            Store::Lru(c) => {
                c.pop(key);
            }
            Store::Indexed(m) => {
                m.shift_remove(key);
            }
        }
    }

    fn len(&self) -> usize {
        match self {
            Store::Lru(c) => c.len(),
            Store::Indexed(m) => m.len(),
        }
    }

    fn total_bytes(&self) -> u64 {
        match self {
            Store::Lru(c) => c.iter().map(|(_, e)| e.size_bytes).sum(),
            Store::Indexed(m) => m.values().map(|e| e.size_bytes).sum(),
        }
    }

    /// Evict and return the victim key under `policy`. `Lru` pops the
    /// cache's own least-recently-used entry; `Fifo` pops the oldest
    /// insertion; `Lfu` pops the lowest `hit_count`, ties broken by
    /// insertion order.
    fn pop_victim(&mut self, policy: EvictionPolicy) -> Option<String> {
        match self {
            Store::Lru(c) => c.pop_lru().map(|(k, _)| k),
            Store::Indexed(m) => {
                let victim = match policy {
                    EvictionPolicy::Fifo => m.get_index(0).map(|(k, _)| k.clone()),
                    EvictionPolicy::Lfu => m
                        .iter()
                        .enumerate()
                        .min_by_key(|(i, (_, e))| (e.hit_count, *i))
                        .map(|(_, (k, _))| k.clone()),
                    EvictionPolicy::Lru => unreachable!("Lru policy never backs an Indexed store"),
                };
                if let Some(key) = &victim {
                    m.shift_remove(key);
                }
                victim
            }
        }
    }
}

pub struct ResponseCache {
    ttl: Duration,
    max_size: usize,
    max_memory_bytes: u64,
    policy: EvictionPolicy,
    conditional_enabled: bool,
    etag_enabled: bool,
    last_modified_enabled: bool,
    store: Mutex<Store>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    conditional_304s: AtomicU64,
}

impl ResponseCache {
    pub fn new(
        ttl: Duration,
        max_size: usize,
        max_memory_bytes: u64,
        policy: EvictionPolicy,
        conditional_enabled: bool,
        etag_enabled: bool,
        last_modified_enabled: bool,
    ) -> Self {
        Self {
            ttl,
            max_size,
            max_memory_bytes,
            policy,
            conditional_enabled,
            etag_enabled,
            last_modified_enabled,
            store: Mutex::new(Store::new(policy)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            conditional_304s: AtomicU64::new(0),
        }
    }

    pub fn key(method: &str, url: &str, headers: &[(&str, &str)]) -> String {
        hash_key(method, url, headers)
    }

    /// Look up `key` at time `now`. Returns `Miss` immediately if
    /// `max_size == 0` (degrades to "no cache", `spec.md` §8).
    pub fn lookup(&self, key: &str, now: Instant) -> Lookup {
        if self.max_size == 0 {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Lookup::Miss;
        }
        let mut store = self.store.lock().unwrap();
        let Some(entry) = store.get_mut(key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Lookup::Miss;
        };

        if now.saturating_duration_since(entry.stored_at) < self.ttl {
            entry.last_access = now;
            entry.hit_count += 1;
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Lookup::Fresh(entry.clone());
        }

        if self.conditional_enabled && (entry.etag.is_some() || entry.last_modified.is_some()) {
            let etag = entry.etag.clone().filter(|_| self.etag_enabled);
            let last_modified = entry.last_modified.clone().filter(|_| self.last_modified_enabled);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Lookup::Revalidate { etag, last_modified };
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        Lookup::Miss
    }

    /// Store a freshly fetched (200) response, evicting if necessary.
    pub fn store(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: Option<String>,
        etag: Option<String>,
        last_modified: Option<String>,
        now: Instant,
    ) {
        if self.max_size == 0 {
            return;
        }
        let entry = CacheEntry::new(body, content_type, etag, last_modified, now);
        let mut store = self.store.lock().unwrap();
        store.insert(key.to_string(), entry);
        self.evict_if_needed(&mut store);
    }

    /// Refresh `stored_at` after a `304 Not Modified` (§4.6 step 2).
    pub fn mark_revalidated(&self, key: &str, now: Instant) {
        let mut store = self.store.lock().unwrap();
        if let Some(entry) = store.get_mut(key) {
            entry.stored_at = now;
            entry.last_access = now;
            self.conditional_304s.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Invalidate a single key (e.g. on a configured error class).
    pub fn invalidate(&self, key: &str) {
        self.store.lock().unwrap().remove(key);
    }

    fn evict_if_needed(&self, store: &mut Store) {
        loop {
            if store.len() <= self.max_size && store.total_bytes() <= self.max_memory_bytes {
                break;
            }
            if store.pop_victim(self.policy).is_none() {
                break;
            }
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    pub fn conditional_304s(&self) -> u64 {
        self.conditional_304s.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.store.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
