//! The key/value interface shared by every cache layer.

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// An async key/value cache.
///
/// Lookups may complete on another task; callers never hold locks across
/// them.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Reads the value stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Stores `value` under `key`, replacing any previous value.
    async fn put(&self, key: &str, value: Bytes) -> Result<()>;

    /// Removes `key`. Returns whether a value was present.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

#[async_trait]
impl<T: CacheBackend + ?Sized> CacheBackend for Arc<T> {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        (**self).get(key).await
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<()> {
        (**self).put(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        (**self).delete(key).await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}
