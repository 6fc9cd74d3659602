//! LRU + TTL cache for translation results.
//!
//! Keys are fingerprints of (text, source, target, provider); values are
//! JSON so single strings and batch arrays share one path. Recency is a
//! doubly-linked list threaded through the node map, evicting strictly
//! from the tail whenever the entry count or resident bytes exceed their
//! maxima. TTL is checked lazily on `get`; there is no background sweep.
//!
//! An optional [`KeyValueStore`] adds persistence: every mutation
//! reschedules a debounced flush of the full entry set, and a cold start
//! reloads whatever has not expired. Persistence failures never reach the
//! caller — in-memory correctness does not depend on durability.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::config::duration_ms;

mod persist;
mod sizing;

pub use persist::{KeyValueStore, MemoryStore, PersistedEntry, StoreError, CACHE_STORE_KEY};
pub use sizing::{approximate_size, fingerprint, ENTRY_OVERHEAD};

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum resident entries.
    pub max_entries: usize,

    /// Maximum resident bytes (approximate accounting).
    pub max_bytes: usize,

    /// TTL applied when `set` is called without one.
    #[serde(with = "duration_ms")]
    pub default_ttl: Duration,

    /// Quiet period before a scheduled flush runs; each mutation resets it.
    #[serde(with = "duration_ms")]
    pub persist_debounce: Duration,

    /// Gzip the persisted payload.
    pub compress: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            max_bytes: 5 * 1024 * 1024,
            default_ttl: Duration::from_secs(3600),
            persist_debounce: Duration::from_millis(100),
            compress: true,
        }
    }
}

/// Fingerprint key for a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(pub u64);

impl CacheKey {
    /// Key for a translation request.
    pub fn for_request(text: &str, source: &str, target: &str, provider: &str) -> Self {
        Self(fingerprint(text, source, target, provider))
    }
}

/// Cache counters. All monotonically increasing for the cache's lifetime.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub rejected: u64,
    pub serialize_errors: u64,
    pub persist_errors: u64,
}

impl CacheStats {
    /// Hit rate over all lookups, 0.0 when nothing was looked up.
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

#[derive(Debug, Clone)]
struct Node {
    value: Value,
    stored_at_ms: u64,
    last_accessed_ms: u64,
    access_count: u64,
    ttl_ms: u64,
    size_bytes: usize,
    prev: Option<u64>,
    next: Option<u64>,
}

#[derive(Default)]
struct LruState {
    map: HashMap<u64, Node>,
    head: Option<u64>,
    tail: Option<u64>,
    total_bytes: usize,
}

impl LruState {
    fn detach(&mut self, key: u64) {
        let Some(node) = self.map.get(&key) else {
            return;
        };
        let (prev, next) = (node.prev, node.next);

        match prev {
            Some(p) => {
                if let Some(prev_node) = self.map.get_mut(&p) {
                    prev_node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(next_node) = self.map.get_mut(&n) {
                    next_node.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, key: u64) {
        let old_head = self.head;
        if let Some(node) = self.map.get_mut(&key) {
            node.prev = None;
            node.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(head_node) = self.map.get_mut(&h) {
                head_node.prev = Some(key);
            }
        }
        self.head = Some(key);
        if self.tail.is_none() {
            self.tail = Some(key);
        }
    }

    fn touch(&mut self, key: u64) {
        self.detach(key);
        self.push_front(key);
    }

    fn remove(&mut self, key: u64) -> Option<Node> {
        if !self.map.contains_key(&key) {
            return None;
        }
        self.detach(key);
        let node = self.map.remove(&key)?;
        self.total_bytes = self.total_bytes.saturating_sub(node.size_bytes);
        Some(node)
    }

    fn insert_front(&mut self, key: u64, node: Node) {
        self.total_bytes += node.size_bytes;
        self.map.insert(key, node);
        self.push_front(key);
    }
}

struct CacheInner {
    state: Mutex<LruState>,
    stats: Mutex<CacheStats>,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn KeyValueStore>>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
}

/// LRU + TTL translation result cache.
#[derive(Clone)]
pub struct TranslationCache {
    inner: Arc<CacheInner>,
}

impl TranslationCache {
    /// Memory-only cache.
    pub fn new(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self::build(config, clock, None)
    }

    /// Cache backed by a persistent store. Call [`load`](Self::load) once
    /// at startup to warm it.
    pub fn with_store(
        config: CacheConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        Self::build(config, clock, Some(store))
    }

    fn build(config: CacheConfig, clock: Arc<dyn Clock>, store: Option<Arc<dyn KeyValueStore>>) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                state: Mutex::new(LruState::default()),
                stats: Mutex::new(CacheStats::default()),
                config,
                clock,
                store,
                flush_task: Mutex::new(None),
            }),
        }
    }

    /// Look up a key, refreshing its recency on a hit.
    ///
    /// An entry whose TTL has lapsed is evicted here and counted as both
    /// an expiration and a miss.
    pub fn get(&self, key: CacheKey) -> Option<Value> {
        let now = self.inner.clock.now_ms();
        let mut state = self.inner.state.lock();

        let expired = state
            .map
            .get(&key.0)
            .map(|node| now.saturating_sub(node.stored_at_ms) >= node.ttl_ms);

        let Some(expired) = expired else {
            drop(state);
            self.inner.stats.lock().misses += 1;
            return None;
        };

        if expired {
            state.remove(key.0);
            drop(state);
            let mut stats = self.inner.stats.lock();
            stats.expirations += 1;
            stats.misses += 1;
            drop(stats);
            self.schedule_flush();
            return None;
        }

        state.touch(key.0);
        let value = state.map.get_mut(&key.0).map(|node| {
            node.access_count += 1;
            node.last_accessed_ms = now;
            node.value.clone()
        });
        drop(state);
        self.inner.stats.lock().hits += 1;
        value
    }

    /// Insert a value, evicting from the LRU tail as needed.
    ///
    /// Returns false (and caches nothing) when the entry alone exceeds
    /// total capacity — rejecting beats inserting something that would be
    /// evicted immediately.
    pub fn set(&self, key: CacheKey, value: Value, ttl: Option<Duration>) -> bool {
        let size_bytes = approximate_size(&value) + ENTRY_OVERHEAD;
        if size_bytes > self.inner.config.max_bytes {
            self.inner.stats.lock().rejected += 1;
            tracing::debug!(size_bytes, "cache entry larger than total capacity, rejected");
            return false;
        }

        let now = self.inner.clock.now_ms();
        let ttl_ms = ttl.unwrap_or(self.inner.config.default_ttl).as_millis() as u64;

        let mut state = self.inner.state.lock();
        state.remove(key.0);
        state.insert_front(
            key.0,
            Node {
                value,
                stored_at_ms: now,
                last_accessed_ms: now,
                access_count: 0,
                ttl_ms,
                size_bytes,
                prev: None,
                next: None,
            },
        );

        let evicted = self.enforce_limits(&mut state);
        drop(state);

        let mut stats = self.inner.stats.lock();
        stats.inserts += 1;
        stats.evictions += evicted;
        drop(stats);

        self.schedule_flush();
        true
    }

    /// Remove a key. Returns whether it was present.
    pub fn remove(&self, key: CacheKey) -> bool {
        let removed = self.inner.state.lock().remove(key.0).is_some();
        if removed {
            self.schedule_flush();
        }
        removed
    }

    /// Drop every entry. Counters are kept.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        *state = LruState::default();
        drop(state);
        self.schedule_flush();
    }

    /// Counter snapshot.
    pub fn stats(&self) -> CacheStats {
        self.inner.stats.lock().clone()
    }

    /// Resident entry count.
    pub fn len(&self) -> usize {
        self.inner.state.lock().map.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Approximate resident bytes.
    pub fn total_bytes(&self) -> usize {
        self.inner.state.lock().total_bytes
    }

    /// Cold-start reload: fetch the persisted entry set, drop expired
    /// entries, then re-apply eviction limits.
    pub async fn load(&self) {
        let Some(store) = self.inner.store.clone() else {
            return;
        };

        let payload = match store.get(&[CACHE_STORE_KEY.to_string()]).await {
            Ok(mut map) => map.remove(CACHE_STORE_KEY),
            Err(e) => {
                self.inner.stats.lock().persist_errors += 1;
                tracing::warn!(error = %e, "cache reload failed, starting cold");
                return;
            }
        };
        let Some(bytes) = payload else {
            return;
        };
        let Some(entries) = persist::decode_entries(&bytes) else {
            self.inner.stats.lock().serialize_errors += 1;
            return;
        };

        let now = self.inner.clock.now_ms();
        let mut state = self.inner.state.lock();
        // Entries were snapshotted most-recent-first; reinsert in reverse
        // so push_front restores the original recency order.
        for entry in entries.into_iter().rev() {
            if now.saturating_sub(entry.stored_at_ms) >= entry.ttl_ms {
                continue;
            }
            let size_bytes = approximate_size(&entry.value) + ENTRY_OVERHEAD;
            if size_bytes > self.inner.config.max_bytes {
                continue;
            }
            state.remove(entry.key);
            state.insert_front(
                entry.key,
                Node {
                    value: entry.value,
                    stored_at_ms: entry.stored_at_ms,
                    last_accessed_ms: entry.stored_at_ms,
                    access_count: entry.access_count,
                    ttl_ms: entry.ttl_ms,
                    size_bytes,
                    prev: None,
                    next: None,
                },
            );
        }
        let evicted = self.enforce_limits(&mut state);
        let loaded = state.map.len();
        drop(state);
        self.inner.stats.lock().evictions += evicted;
        tracing::debug!(loaded, "cache warmed from persistent store");
    }

    /// Flush immediately, cancelling any pending debounced flush.
    pub async fn flush_now(&self) {
        if let Some(task) = self.inner.flush_task.lock().take() {
            task.abort();
        }
        Self::persist(&self.inner).await;
    }

    /// Evict from the tail until both limits hold. The whole batch for
    /// one call is logged and counted together.
    fn enforce_limits(&self, state: &mut LruState) -> u64 {
        let config = &self.inner.config;
        let mut evicted = 0u64;
        while state.map.len() > config.max_entries || state.total_bytes > config.max_bytes {
            let Some(tail) = state.tail else {
                break;
            };
            state.remove(tail);
            evicted += 1;
        }
        if evicted > 0 {
            tracing::debug!(evicted, "evicted LRU tail entries");
        }
        evicted
    }

    /// Reschedule the debounced flush; each mutation resets the window.
    fn schedule_flush(&self) {
        if self.inner.store.is_none() {
            return;
        }
        // Persistence rides on an async runtime; without one the cache
        // stays memory-correct and simply skips the flush.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let inner = Arc::clone(&self.inner);
        let debounce = self.inner.config.persist_debounce;
        let task = handle.spawn(async move {
            tokio::time::sleep(debounce).await;
            Self::persist(&inner).await;
        });

        let mut slot = self.inner.flush_task.lock();
        if let Some(previous) = slot.replace(task) {
            previous.abort();
        }
    }

    async fn persist(inner: &Arc<CacheInner>) {
        let Some(store) = inner.store.clone() else {
            return;
        };

        let entries: Vec<PersistedEntry> = {
            let state = inner.state.lock();
            let mut ordered = Vec::with_capacity(state.map.len());
            let mut cursor = state.head;
            while let Some(key) = cursor {
                let Some(node) = state.map.get(&key) else {
                    break;
                };
                ordered.push(PersistedEntry {
                    key,
                    value: node.value.clone(),
                    stored_at_ms: node.stored_at_ms,
                    ttl_ms: node.ttl_ms,
                    access_count: node.access_count,
                });
                cursor = node.next;
            }
            ordered
        };

        let Some((bytes, _compressed)) = persist::encode_entries(&entries, inner.config.compress)
        else {
            inner.stats.lock().serialize_errors += 1;
            return;
        };

        let mut payload = HashMap::new();
        payload.insert(CACHE_STORE_KEY.to_string(), bytes);
        if let Err(e) = store.set(payload).await {
            inner.stats.lock().persist_errors += 1;
            tracing::warn!(error = %e, "cache flush failed");
        }
    }
}

impl std::fmt::Debug for TranslationCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslationCache")
            .field("entries", &self.len())
            .field("bytes", &self.total_bytes())
            .finish()
    }
}
