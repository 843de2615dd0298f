//! A cache wrapper that delays lookups of chosen keys.
//!
//! Tests use this to make a cache lookup complete after other work, e.g.
//! to have the property cache answer after the origin response started
//! streaming.

use crate::{CacheBackend, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::watch;

/// Holds `get` calls for delayed keys until [`DelayCache::release_key`].
pub struct DelayCache<B> {
    inner: B,
    delayed: Mutex<HashMap<String, watch::Sender<bool>>>,
}

impl<B: CacheBackend> DelayCache<B> {
    /// Wraps `inner`.
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            delayed: Mutex::new(HashMap::new()),
        }
    }

    /// Makes future lookups of `key` wait until it is released.
    pub fn delay_key(&self, key: &str) {
        let (tx, _) = watch::channel(false);
        self.delayed.lock().insert(key.to_string(), tx);
    }

    /// Releases every lookup waiting on `key`.
    pub fn release_key(&self, key: &str) {
        if let Some(tx) = self.delayed.lock().remove(key) {
            tx.send_replace(true);
        }
    }

    /// Releases every delayed key.
    pub fn release_all(&self) {
        for (_, tx) in self.delayed.lock().drain() {
            tx.send_replace(true);
        }
    }

    /// The wrapped backend.
    pub fn inner(&self) -> &B {
        &self.inner
    }
}

#[async_trait]
impl<B: CacheBackend> CacheBackend for DelayCache<B> {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let gate = self.delayed.lock().get(key).map(watch::Sender::subscribe);
        if let Some(mut rx) = gate {
            tracing::trace!(key, "delaying cache lookup");
            // A dropped sender means the key was released.
            let _ = rx.wait_for(|released| *released).await;
        }
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        self.inner.put(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.inner.delete(key).await
    }

    fn name(&self) -> &'static str {
        "delay"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LruCacheBackend;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn undelayed_keys_pass_through() {
        let cache = DelayCache::new(LruCacheBackend::with_defaults());
        cache.put("k", Bytes::from("v")).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(Bytes::from("v")));
    }

    #[tokio::test]
    async fn delayed_key_waits_for_release() {
        let cache = Arc::new(DelayCache::new(LruCacheBackend::with_defaults()));
        cache.put("k", Bytes::from("v")).await.unwrap();
        cache.delay_key("k");

        let lookup = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get("k").await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!lookup.is_finished());

        cache.release_key("k");
        let value = lookup.await.unwrap().unwrap();
        assert_eq!(value, Some(Bytes::from("v")));
    }

    #[tokio::test]
    async fn release_all_unblocks_everything() {
        let cache = Arc::new(DelayCache::new(LruCacheBackend::with_defaults()));
        cache.delay_key("a");
        cache.delay_key("b");

        let lookups: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|key| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.get(key).await })
            })
            .collect();

        cache.release_all();
        for lookup in lookups {
            assert_eq!(lookup.await.unwrap().unwrap(), None);
        }
    }
}
