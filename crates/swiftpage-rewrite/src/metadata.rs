//! The metadata cache: what a rewrite produced, keyed by its inputs.
//!
//! An entry maps a partition key (transformer id, options signature and
//! input URLs) to the rewritten URL plus the validators and expirations of
//! every input, or to a remembered failure. An entry is usable while every
//! input is still fresh. Once an input expires, it is refetched
//! conditionally: if every input is unchanged the entry is rewritten with
//! the new expirations, otherwise it is dropped and the rewrite runs again.

use crate::loader::{ResourceLoader, Revalidation};
use crate::resource::LoadedResource;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use swiftpage_cache::CacheBackend;
use swiftpage_core::{Hasher, RewriteErrorKind, Timer, TimestampMs};

/// Prefix of every metadata cache key.
pub const METADATA_KEY_PREFIX: &str = "rname/";

/// Builds the partition key of a rewrite.
pub fn partition_key(
    hasher: &dyn Hasher,
    filter_id: &str,
    options_signature: &str,
    input_urls: &[String],
) -> String {
    let inputs = hasher.hash_str(&input_urls.join("\n"));
    format!("{METADATA_KEY_PREFIX}{filter_id}/{options_signature}/{inputs}")
}

/// What the cache remembers about one input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputInfo {
    /// Input URL.
    pub url: String,
    /// When the input stops being fresh.
    pub expiration_ms: TimestampMs,
    /// Hash of the input body.
    pub content_hash: String,
    /// The input's `Etag`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// The input's `Last-Modified`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
}

impl InputInfo {
    /// Describes a loaded input.
    pub fn from_loaded(resource: &LoadedResource, hasher: &dyn Hasher) -> Self {
        Self {
            url: resource.url().to_string(),
            expiration_ms: resource.expiration_ms(),
            content_hash: resource.fingerprint(hasher).to_string(),
            etag: resource.etag().map(str::to_string),
            last_modified: resource.last_modified().map(str::to_string),
        }
    }
}

/// A remembered rewrite result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataEntry {
    /// Rewritten URLs, one per output slot.
    pub outputs: Vec<String>,
    /// The inputs the outputs were computed from.
    pub inputs: Vec<InputInfo>,
    /// Why the rewrite failed, for remembered failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<RewriteErrorKind>,
    /// When a remembered failure stops applying.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_expiration_ms: Option<TimestampMs>,
    /// When the entry was written.
    pub written_at_ms: TimestampMs,
}

impl MetadataEntry {
    /// A successful rewrite.
    pub fn success(outputs: Vec<String>, inputs: Vec<InputInfo>, now_ms: TimestampMs) -> Self {
        Self {
            outputs,
            inputs,
            failure: None,
            failure_expiration_ms: None,
            written_at_ms: now_ms,
        }
    }

    /// A remembered failure, valid for `ttl_ms`.
    pub fn failure(
        kind: RewriteErrorKind,
        inputs: Vec<InputInfo>,
        now_ms: TimestampMs,
        ttl_ms: i64,
    ) -> Self {
        Self {
            outputs: Vec::new(),
            inputs,
            failure: Some(kind),
            failure_expiration_ms: Some(now_ms.saturating_add(ttl_ms)),
            written_at_ms: now_ms,
        }
    }

    /// The earliest moment at which the entry stops being valid.
    pub fn min_valid_until(&self) -> TimestampMs {
        if let Some(expiration) = self.failure_expiration_ms {
            return expiration;
        }
        self.inputs
            .iter()
            .map(|i| i.expiration_ms)
            .min()
            .unwrap_or(TimestampMs::MAX)
    }

    /// Whether the entry applies at `now_ms`.
    pub fn is_valid(&self, now_ms: TimestampMs) -> bool {
        now_ms <= self.min_valid_until()
    }
}

/// Result of a metadata lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataLookup {
    /// A valid entry.
    Hit(MetadataEntry),
    /// A successful entry with at least one expired input.
    Expired(MetadataEntry),
    /// Nothing usable.
    Miss,
}

/// Metadata cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataCacheStats {
    /// Valid entries found.
    pub hits: u64,
    /// Lookups without a valid entry.
    pub misses: u64,
    /// Expired entries refreshed by conditional refetch.
    pub revalidations: u64,
    /// Entries written.
    pub inserts: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    revalidations: AtomicU64,
    inserts: AtomicU64,
}

/// Partition-keyed store of rewrite results.
pub struct MetadataCache {
    backend: Arc<dyn CacheBackend>,
    timer: Arc<dyn Timer>,
    hasher: Arc<dyn Hasher>,
    counters: Counters,
}

impl MetadataCache {
    /// Creates a metadata cache over `backend`.
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        timer: Arc<dyn Timer>,
        hasher: Arc<dyn Hasher>,
    ) -> Self {
        Self {
            backend,
            timer,
            hasher,
            counters: Counters::default(),
        }
    }

    /// Looks up a partition.
    pub async fn lookup(&self, key: &str) -> MetadataLookup {
        let stored = match self.backend.get(key).await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(key, error = %e, "metadata lookup failed");
                None
            }
        };
        let entry = stored.and_then(|bytes| {
            serde_json::from_slice::<MetadataEntry>(&bytes)
                .map_err(|e| tracing::warn!(key, error = %e, "corrupt metadata entry"))
                .ok()
        });
        let Some(entry) = entry else {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return MetadataLookup::Miss;
        };

        let now_ms = self.timer.now_ms();
        if entry.is_valid(now_ms) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return MetadataLookup::Hit(entry);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        if entry.failure.is_some() {
            MetadataLookup::Miss
        } else {
            MetadataLookup::Expired(entry)
        }
    }

    /// Writes an entry. Failures are logged and reported as `false`.
    pub async fn put(&self, key: &str, entry: &MetadataEntry) -> bool {
        let encoded = match serde_json::to_vec(entry) {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!(key, error = %e, "could not encode metadata entry");
                return false;
            }
        };
        match self.backend.put(key, Bytes::from(encoded)).await {
            Ok(()) => {
                self.counters.inserts.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                tracing::warn!(
                    key,
                    error = %e,
                    kind = %RewriteErrorKind::CacheWriteFailed,
                    "metadata write failed"
                );
                false
            }
        }
    }

    /// Drops an entry.
    pub async fn invalidate(&self, key: &str) {
        if let Err(e) = self.backend.delete(key).await {
            tracing::warn!(key, error = %e, "metadata delete failed");
        }
    }

    /// Refetches every expired input of `entry` conditionally. Returns the
    /// refreshed entry, already written back, if every input is unchanged;
    /// otherwise drops the entry and returns `None`.
    pub async fn revalidate_inputs(
        &self,
        key: &str,
        entry: &MetadataEntry,
        loader: &ResourceLoader,
    ) -> Option<MetadataEntry> {
        let now_ms = self.timer.now_ms();
        let mut refreshed = entry.clone();

        for input in refreshed.inputs.iter_mut() {
            if input.expiration_ms >= now_ms {
                continue;
            }
            let result = loader
                .revalidate(&input.url, input.etag.as_deref(), input.last_modified.as_deref())
                .await;
            match result {
                Revalidation::NotModified { expiration_ms } => {
                    input.expiration_ms = expiration_ms;
                }
                Revalidation::Modified(loaded)
                    if loaded.fingerprint(self.hasher.as_ref()) == input.content_hash =>
                {
                    input.expiration_ms = loaded.expiration_ms();
                }
                _ => {
                    tracing::debug!(key, url = %input.url, "input changed, dropping metadata");
                    self.invalidate(key).await;
                    return None;
                }
            }
        }

        if !refreshed.is_valid(now_ms) {
            self.invalidate(key).await;
            return None;
        }
        refreshed.written_at_ms = now_ms;
        self.put(key, &refreshed).await;
        self.counters.revalidations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(key, "metadata revalidated");
        Some(refreshed)
    }

    /// Returns current statistics.
    pub fn stats(&self) -> MetadataCacheStats {
        MetadataCacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            revalidations: self.counters.revalidations.load(Ordering::Relaxed),
            inserts: self.counters.inserts.load(Ordering::Relaxed),
        }
    }
}
