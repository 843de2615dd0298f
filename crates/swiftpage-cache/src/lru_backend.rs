//! Bounded in-memory LRU backend.
//!
//! Entries are charged `key.len() + value.len()` bytes. A store that pushes
//! the total over the byte budget drops least recently used entries until it
//! fits; a single entry larger than the whole budget is never stored.

use crate::{CacheBackend, Result};
use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

/// Capacity of an [`LruCacheBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LruLimits {
    /// Most entries kept at once.
    pub max_entries: usize,
    /// Most bytes of keys and values kept at once.
    pub max_bytes: usize,
}

impl Default for LruLimits {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_bytes: 64 << 20,
        }
    }
}

/// What an [`LruCacheBackend`] holds and has done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LruStats {
    /// Lookups that found a value.
    pub hits: u64,
    /// Lookups that found nothing.
    pub misses: u64,
    /// Values stored, replacements included.
    pub stores: u64,
    /// Values refused for being larger than the byte budget.
    pub rejected: u64,
    /// Entries dropped to stay within the limits.
    pub evictions: u64,
    /// Entries removed by `delete`.
    pub deletes: u64,
    /// Entries held now.
    pub entries: usize,
    /// Bytes held now.
    pub bytes: usize,
}

struct Store {
    entries: LruCache<String, Bytes>,
    bytes: usize,
    stats: LruStats,
}

impl Store {
    fn charge(key: &str, value: &Bytes) -> usize {
        key.len() + value.len()
    }

    fn evicted(&mut self, key: &str, value: &Bytes) {
        self.bytes -= Self::charge(key, value);
        self.stats.evictions += 1;
    }
}

/// In-memory LRU cache bounded by entry count and total bytes.
pub struct LruCacheBackend {
    store: Mutex<Store>,
    limits: LruLimits,
}

impl LruCacheBackend {
    /// Creates a backend with the given limits. A zero entry limit is
    /// treated as one.
    pub fn new(limits: LruLimits) -> Self {
        let max_entries = NonZeroUsize::new(limits.max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            store: Mutex::new(Store {
                entries: LruCache::new(max_entries),
                bytes: 0,
                stats: LruStats::default(),
            }),
            limits,
        }
    }

    /// Creates a backend with [`LruLimits::default`].
    pub fn with_defaults() -> Self {
        Self::new(LruLimits::default())
    }

    /// Counters and current occupancy.
    pub fn stats(&self) -> LruStats {
        let store = self.store.lock();
        LruStats {
            entries: store.entries.len(),
            bytes: store.bytes,
            ..store.stats
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.store.lock().entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every entry. Counters are kept.
    pub fn clear(&self) {
        let mut store = self.store.lock();
        store.entries.clear();
        store.bytes = 0;
    }
}

impl Default for LruCacheBackend {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[async_trait]
impl CacheBackend for LruCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut store = self.store.lock();
        let value = store.entries.get(key).cloned();
        match value {
            Some(_) => store.stats.hits += 1,
            None => store.stats.misses += 1,
        }
        Ok(value)
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        let charge = Store::charge(key, &value);
        let mut store = self.store.lock();
        if charge > self.limits.max_bytes {
            tracing::debug!(key, charge, max_bytes = self.limits.max_bytes, "value exceeds cache budget");
            store.stats.rejected += 1;
            return Ok(());
        }

        // `push` hands back either the replaced value or the entry evicted
        // by the count limit.
        if let Some((old_key, old_value)) = store.entries.push(key.to_string(), value) {
            if old_key == key {
                store.bytes -= Store::charge(&old_key, &old_value);
            } else {
                store.evicted(&old_key, &old_value);
            }
        }
        store.bytes += charge;
        while store.bytes > self.limits.max_bytes {
            let Some((old_key, old_value)) = store.entries.pop_lru() else {
                break;
            };
            store.evicted(&old_key, &old_value);
        }
        store.stats.stores += 1;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut store = self.store.lock();
        let Some(value) = store.entries.pop(key) else {
            return Ok(false);
        };
        store.bytes -= Store::charge(key, &value);
        store.stats.deletes += 1;
        Ok(true)
    }

    fn name(&self) -> &'static str {
        "lru"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn bounded(max_entries: usize, max_bytes: usize) -> LruCacheBackend {
        LruCacheBackend::new(LruLimits {
            max_entries,
            max_bytes,
        })
    }

    #[tokio::test]
    async fn put_get_delete() {
        let cache = LruCacheBackend::with_defaults();
        cache.put("k", Bytes::from("value")).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(Bytes::from("value")));
        assert!(cache.delete("k").await.unwrap());
        assert!(!cache.delete("k").await.unwrap());
        assert_eq!(cache.get("k").await.unwrap(), None);

        assert_eq!(
            cache.stats(),
            LruStats {
                hits: 1,
                misses: 1,
                stores: 1,
                deletes: 1,
                ..LruStats::default()
            }
        );
    }

    #[tokio::test]
    async fn evicts_least_recently_used_by_count() {
        let cache = bounded(2, 1024);
        cache.put("a", Bytes::from("1")).await.unwrap();
        cache.put("b", Bytes::from("2")).await.unwrap();
        cache.get("a").await.unwrap();
        cache.put("c", Bytes::from("3")).await.unwrap();

        assert!(cache.get("a").await.unwrap().is_some());
        assert!(cache.get("b").await.unwrap().is_none());
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.stats().bytes, 4);
    }

    #[tokio::test]
    async fn evicts_by_size() {
        let cache = bounded(100, 10);
        cache.put("a", Bytes::from("1234")).await.unwrap();
        cache.put("b", Bytes::from("1234")).await.unwrap();
        assert_eq!(cache.len(), 2);
        cache.put("c", Bytes::from("1234")).await.unwrap();
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").await.unwrap().is_none());
        assert_eq!(cache.stats().bytes, 10);
    }

    #[tokio::test]
    async fn replacing_is_not_an_eviction() {
        let cache = LruCacheBackend::with_defaults();
        cache.put("k", Bytes::from("12345")).await.unwrap();
        cache.put("k", Bytes::from("1")).await.unwrap();
        let stats = cache.stats();
        assert_eq!(stats.bytes, 2);
        assert_eq!(stats.evictions, 0);
        assert_eq!(stats.stores, 2);
    }

    #[tokio::test]
    async fn values_over_budget_are_rejected() {
        let cache = bounded(10, 4);
        cache.put("key", Bytes::from("too big")).await.unwrap();
        assert!(cache.is_empty());
        assert_eq!(cache.stats().stores, 0);
        assert_eq!(cache.stats().rejected, 1);
    }

    #[tokio::test]
    async fn clear_keeps_counters() {
        let cache = LruCacheBackend::with_defaults();
        cache.put("a", Bytes::from("1")).await.unwrap();
        cache.clear();
        assert!(cache.get("a").await.unwrap().is_none());
        let stats = cache.stats();
        assert_eq!((stats.entries, stats.bytes, stats.stores), (0, 0, 1));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Put(u8, usize),
        Get(u8),
        Delete(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            3 => (0u8..12, 0usize..40).prop_map(|(k, len)| Op::Put(k, len)),
            2 => (0u8..12).prop_map(Op::Get),
            1 => (0u8..12).prop_map(Op::Delete),
        ]
    }

    proptest! {
        #[test]
        fn stays_within_limits(
            max_entries in 1usize..8,
            max_bytes in 1usize..100,
            ops in proptest::collection::vec(op(), 1..80),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let cache = bounded(max_entries, max_bytes);
                let mut held: HashMap<String, Bytes> = HashMap::new();
                for op in ops {
                    match op {
                        Op::Put(k, len) => {
                            let key = format!("k{k}");
                            let value = Bytes::from(vec![k; len]);
                            cache.put(&key, value.clone()).await.unwrap();
                            if key.len() + len <= max_bytes {
                                // The newest entry always survives its own store.
                                prop_assert_eq!(cache.get(&key).await.unwrap(), Some(value.clone()));
                                held.insert(key, value);
                            }
                        }
                        Op::Get(k) => {
                            let key = format!("k{k}");
                            if let Some(found) = cache.get(&key).await.unwrap() {
                                prop_assert_eq!(held.get(&key), Some(&found));
                            }
                        }
                        Op::Delete(k) => {
                            cache.delete(&format!("k{k}")).await.unwrap();
                            held.remove(&format!("k{k}"));
                        }
                    }
                    let stats = cache.stats();
                    prop_assert!(stats.entries <= max_entries);
                    prop_assert!(stats.bytes <= max_bytes);
                }
                Ok::<(), TestCaseError>(())
            })?;
        }
    }
}
