//! The property cache: facts learned about a page between requests.
//!
//! Properties are grouped into cohorts. A request reads every cohort of its
//! page at the start, filters update values while the page streams, and the
//! cohorts those filters use are written back when the request completes.
//!
//! Each value remembers a history of whether recent writes changed it, so
//! callers can tell a stable fact (the same value written several times in
//! a row) from a volatile one.

use crate::{CacheBackend, CacheError, Result};
use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use swiftpage_core::{DeviceClass, Timer, TimestampMs, Wildcard};

/// Suffix distinguishing the query-stripped fallback page from the actual
/// page in cache keys.
const FALLBACK_SUFFIX: &str = "@fallback";

/// A single learned property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyValue {
    value: String,
    write_timestamp_ms: TimestampMs,
    /// One bit per write, newest in bit 0; set if that write changed the
    /// value.
    update_mask: u64,
    num_writes: u64,
    #[serde(skip)]
    changed: bool,
}

impl PropertyValue {
    /// The value.
    pub fn value(&self) -> &str {
        &self.value
    }

    /// When the value was last written.
    pub fn write_timestamp_ms(&self) -> TimestampMs {
        self.write_timestamp_ms
    }

    /// Total number of writes.
    pub fn num_writes(&self) -> u64 {
        self.num_writes
    }

    /// Whether the value changed during this request.
    pub fn has_changed(&self) -> bool {
        self.changed
    }

    /// Number of most recent writes that stored the current value.
    pub fn consecutive_identical_writes(&self) -> u64 {
        (u64::from(self.update_mask.trailing_zeros()) + 1).min(self.num_writes)
    }

    /// Whether the value was written identically at least `threshold`
    /// times in a row.
    pub fn is_stable(&self, threshold: u32) -> bool {
        self.consecutive_identical_writes() >= u64::from(threshold)
    }

    fn record_write(&mut self, value: &str, now_ms: TimestampMs) {
        let changed = self.num_writes == 0 || self.value != value;
        self.update_mask = (self.update_mask << 1) | u64::from(changed);
        self.num_writes += 1;
        self.write_timestamp_ms = now_ms;
        self.changed |= changed;
        if changed {
            self.value = value.to_string();
        }
    }

    fn empty() -> Self {
        Self {
            value: String::new(),
            write_timestamp_ms: 0,
            update_mask: 0,
            num_writes: 0,
            changed: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct CohortData {
    values: BTreeMap<String, PropertyValue>,
}

/// All cohorts of one page, as read at request start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyPage {
    url: String,
    key: String,
    cohorts: BTreeMap<String, CohortData>,
    dirty: BTreeSet<String>,
    found: BTreeSet<String>,
}

impl PropertyPage {
    /// Creates an empty page.
    pub fn new(url: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            key: key.into(),
            cohorts: BTreeMap::new(),
            dirty: BTreeSet::new(),
            found: BTreeSet::new(),
        }
    }

    /// The page URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The cache key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Reads a property.
    pub fn get(&self, cohort: &str, name: &str) -> Option<&PropertyValue> {
        self.cohorts
            .get(cohort)
            .and_then(|c| c.values.get(name))
            .filter(|v| v.num_writes > 0)
    }

    /// Writes a property; the cohort is written back on commit.
    pub fn update(&mut self, cohort: &str, name: &str, value: &str, now_ms: TimestampMs) {
        self.cohorts
            .entry(cohort.to_string())
            .or_default()
            .values
            .entry(name.to_string())
            .or_insert_with(PropertyValue::empty)
            .record_write(value, now_ms);
        self.dirty.insert(cohort.to_string());
    }

    /// Removes a property.
    pub fn delete(&mut self, cohort: &str, name: &str) {
        if let Some(c) = self.cohorts.get_mut(cohort) {
            if c.values.remove(name).is_some() {
                self.dirty.insert(cohort.to_string());
            }
        }
    }

    /// Whether the cohort was found in the cache when the page was read.
    pub fn cohort_found(&self, cohort: &str) -> bool {
        self.found.contains(cohort)
    }

    /// Whether the cohort was modified since it was read.
    pub fn is_dirty(&self, cohort: &str) -> bool {
        self.dirty.contains(cohort)
    }
}

/// A page paired with the page for its query-stripped URL.
///
/// Reads prefer the actual page and use the fallback only when enabled and
/// the actual page lacks the property. Writes go to both.
#[derive(Debug, Clone)]
pub struct FallbackPropertyPage {
    actual: PropertyPage,
    fallback: Option<PropertyPage>,
    use_fallback_values: bool,
}

impl FallbackPropertyPage {
    /// Pairs `actual` with an optional fallback page.
    pub fn new(
        actual: PropertyPage,
        fallback: Option<PropertyPage>,
        use_fallback_values: bool,
    ) -> Self {
        Self {
            actual,
            fallback,
            use_fallback_values,
        }
    }

    /// An empty page for `url` with no fallback.
    pub fn empty(url: &str) -> Self {
        Self::new(PropertyPage::new(url, url), None, false)
    }

    /// The actual page.
    pub fn actual(&self) -> &PropertyPage {
        &self.actual
    }

    /// The fallback page, if any.
    pub fn fallback(&self) -> Option<&PropertyPage> {
        self.fallback.as_ref()
    }

    /// Reads a property, falling back when allowed.
    pub fn get(&self, cohort: &str, name: &str) -> Option<&PropertyValue> {
        self.actual.get(cohort, name).or_else(|| {
            if self.use_fallback_values {
                self.fallback.as_ref().and_then(|f| f.get(cohort, name))
            } else {
                None
            }
        })
    }

    /// Writes a property to both pages.
    pub fn update(&mut self, cohort: &str, name: &str, value: &str, now_ms: TimestampMs) {
        self.actual.update(cohort, name, value, now_ms);
        if let Some(fallback) = self.fallback.as_mut() {
            fallback.update(cohort, name, value, now_ms);
        }
    }

    /// Removes a property from both pages.
    pub fn delete(&mut self, cohort: &str, name: &str) {
        self.actual.delete(cohort, name);
        if let Some(fallback) = self.fallback.as_mut() {
            fallback.delete(cohort, name);
        }
    }
}

/// Hit and miss counts for one cohort.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CohortStats {
    /// Reads that found the cohort.
    pub hits: u64,
    /// Reads that found nothing.
    pub misses: u64,
}

#[derive(Debug, Default)]
struct CohortCounters {
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Reads and writes property pages through a cache backend.
pub struct PropertyCache {
    backend: Arc<dyn CacheBackend>,
    timer: Arc<dyn Timer>,
    cohorts: HashMap<String, CohortCounters>,
    stability_threshold: u32,
    enabled: bool,
    invalidations: RwLock<Vec<(Wildcard, TimestampMs)>>,
}

impl PropertyCache {
    /// Creates a property cache with the given cohorts.
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        timer: Arc<dyn Timer>,
        cohorts: &[&str],
        stability_threshold: u32,
    ) -> Self {
        Self {
            backend,
            timer,
            cohorts: cohorts
                .iter()
                .map(|c| (c.to_string(), CohortCounters::default()))
                .collect(),
            stability_threshold,
            enabled: true,
            invalidations: RwLock::new(Vec::new()),
        }
    }

    /// Turns all reads into misses and all writes into no-ops.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Whether the cache is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Identical consecutive writes needed for stability.
    pub fn stability_threshold(&self) -> u32 {
        self.stability_threshold
    }

    /// Whether `value` is stable under this cache's threshold.
    pub fn is_stable(&self, value: &PropertyValue) -> bool {
        value.is_stable(self.stability_threshold)
    }

    /// Registered cohort names.
    pub fn cohort_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.cohorts.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Builds the cache key of a page.
    pub fn page_key(url: &str, options_signature: &str, device: DeviceClass) -> String {
        format!("{url} {options_signature}{}", device.key_suffix())
    }

    /// Builds the cache key of the query-stripped fallback page.
    pub fn fallback_page_key(url: &str, options_signature: &str, device: DeviceClass) -> String {
        let stripped = url.split_once('?').map_or(url, |(path, _)| path);
        format!(
            "{}{FALLBACK_SUFFIX}",
            Self::page_key(stripped, options_signature, device)
        )
    }

    fn cohort_key(page_key: &str, cohort: &str) -> String {
        format!("prop/{cohort}/{page_key}")
    }

    /// Drops every value of pages matching `pattern` written at or before
    /// `timestamp_ms`. A later call with the same pattern replaces the
    /// earlier one.
    pub fn invalidate(&self, pattern: &str, timestamp_ms: TimestampMs) -> Result<()> {
        let wildcard = Wildcard::new(pattern)?;
        let mut invalidations = self.invalidations.write();
        invalidations.retain(|(w, _)| w.spec() != pattern);
        invalidations.push((wildcard, timestamp_ms));
        Ok(())
    }

    /// The invalidation timestamp that applies to `url`. When several
    /// patterns match, the most specific one decides.
    fn invalidation_timestamp(&self, url: &str) -> Option<TimestampMs> {
        self.invalidations
            .read()
            .iter()
            .filter(|(w, _)| w.matches(url))
            .max_by_key(|(w, _)| w.specificity())
            .map(|(_, ts)| *ts)
    }

    /// Reads every cohort of a page. Backend failures read as misses.
    pub async fn read(&self, url: &str, key: &str) -> PropertyPage {
        let mut page = PropertyPage::new(url, key);
        if !self.enabled {
            return page;
        }
        let invalidated_at = self.invalidation_timestamp(url);

        for (cohort, counters) in &self.cohorts {
            let stored = match self.backend.get(&Self::cohort_key(key, cohort)).await {
                Ok(stored) => stored,
                Err(e) => {
                    tracing::warn!(cohort = %cohort, error = %e, "property cache read failed");
                    None
                }
            };
            let data = stored.and_then(|bytes| {
                serde_json::from_slice::<CohortData>(&bytes)
                    .map_err(|e| tracing::warn!(cohort = %cohort, error = %e, "corrupt cohort"))
                    .ok()
            });

            match data {
                Some(mut data) => {
                    if let Some(ts) = invalidated_at {
                        data.values.retain(|_, v| v.write_timestamp_ms > ts);
                    }
                    counters.hits.fetch_add(1, Ordering::Relaxed);
                    page.found.insert(cohort.clone());
                    page.cohorts.insert(cohort.clone(), data);
                }
                None => {
                    counters.misses.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        tracing::debug!(url, cohorts_found = page.found.len(), "property page read");
        page
    }

    /// Reads a page and its fallback page.
    pub async fn read_with_fallback(
        &self,
        url: &str,
        options_signature: &str,
        device: DeviceClass,
        use_fallback_values: bool,
    ) -> FallbackPropertyPage {
        let actual = self
            .read(url, &Self::page_key(url, options_signature, device))
            .await;
        let stripped = url.split_once('?').map_or(url, |(path, _)| path);
        let fallback = self
            .read(
                stripped,
                &Self::fallback_page_key(url, options_signature, device),
            )
            .await;
        FallbackPropertyPage::new(actual, Some(fallback), use_fallback_values)
    }

    /// Writes one cohort of a page back to the cache.
    pub async fn write_cohort(&self, page: &PropertyPage, cohort: &str) -> Result<()> {
        if !self.cohorts.contains_key(cohort) {
            return Err(CacheError::UnknownCohort(cohort.to_string()));
        }
        if !self.enabled {
            return Ok(());
        }
        let data = page.cohorts.get(cohort).cloned().unwrap_or_default();
        let encoded = serde_json::to_vec(&data)?;
        self.backend
            .put(&Self::cohort_key(&page.key, cohort), Bytes::from(encoded))
            .await
    }

    /// Writes every dirty cohort among `cohorts` for the page and its
    /// fallback.
    pub async fn commit(&self, page: &FallbackPropertyPage, cohorts: &[&str]) -> Result<()> {
        for cohort in cohorts {
            if page.actual.is_dirty(cohort) {
                self.write_cohort(&page.actual, cohort).await?;
            }
            if let Some(fallback) = &page.fallback {
                if fallback.is_dirty(cohort) {
                    self.write_cohort(fallback, cohort).await?;
                }
            }
        }
        Ok(())
    }

    /// Current time from the cache's clock.
    pub fn now_ms(&self) -> TimestampMs {
        self.timer.now_ms()
    }

    /// Hit and miss counts for a cohort.
    pub fn cohort_stats(&self, cohort: &str) -> Option<CohortStats> {
        self.cohorts.get(cohort).map(|c| CohortStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LruCacheBackend;
    use pretty_assertions::assert_eq;
    use swiftpage_core::MockTimer;

    const DOM: &str = "dom";
    const URL: &str = "http://test.com/page.html";

    fn cache(timer: Arc<MockTimer>) -> PropertyCache {
        PropertyCache::new(
            Arc::new(LruCacheBackend::with_defaults()),
            timer,
            &[DOM, "beacon"],
            3,
        )
    }

    async fn write_value(cache: &PropertyCache, value: &str) -> PropertyPage {
        let mut page = cache.read(URL, URL).await;
        page.update(DOM, "num_elements", value, cache.now_ms());
        cache.write_cohort(&page, DOM).await.unwrap();
        page
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let timer = Arc::new(MockTimer::default());
        let cache = cache(timer);

        let page = cache.read(URL, URL).await;
        assert!(!page.cohort_found(DOM));
        assert_eq!(cache.cohort_stats(DOM).unwrap().misses, 1);

        write_value(&cache, "7").await;
        let page = cache.read(URL, URL).await;
        assert!(page.cohort_found(DOM));
        assert_eq!(page.get(DOM, "num_elements").unwrap().value(), "7");
        assert!(!page.cohort_found("beacon"));
    }

    #[tokio::test]
    async fn value_becomes_stable_after_identical_writes() {
        let timer = Arc::new(MockTimer::default());
        let cache = cache(Arc::clone(&timer));

        for expected_stable in [false, false, true, true] {
            write_value(&cache, "7").await;
            timer.advance_ms(1);
            let page = cache.read(URL, URL).await;
            let value = page.get(DOM, "num_elements").unwrap();
            assert_eq!(cache.is_stable(value), expected_stable);
        }

        write_value(&cache, "8").await;
        let page = cache.read(URL, URL).await;
        let value = page.get(DOM, "num_elements").unwrap();
        assert_eq!(value.consecutive_identical_writes(), 1);
        assert!(!cache.is_stable(value));
        assert_eq!(value.num_writes(), 5);
    }

    #[tokio::test]
    async fn invalidation_hides_older_values() {
        let timer = Arc::new(MockTimer::default());
        let cache = cache(Arc::clone(&timer));

        write_value(&cache, "7").await;
        cache
            .invalidate("http://test.com/*", timer.now_ms())
            .unwrap();
        let page = cache.read(URL, URL).await;
        assert!(page.get(DOM, "num_elements").is_none());

        timer.advance_ms(10);
        write_value(&cache, "9").await;
        let page = cache.read(URL, URL).await;
        assert_eq!(page.get(DOM, "num_elements").unwrap().value(), "9");
    }

    #[tokio::test]
    async fn most_specific_invalidation_wins() {
        let timer = Arc::new(MockTimer::new(1_000));
        let cache = cache(Arc::clone(&timer));

        write_value(&cache, "7").await;
        cache.invalidate("http://test.com/*", 2_000).unwrap();
        cache.invalidate("http://test.com/page.html", 500).unwrap();

        let page = cache.read(URL, URL).await;
        assert_eq!(page.get(DOM, "num_elements").unwrap().value(), "7");
    }

    #[tokio::test]
    async fn fallback_page_used_only_when_enabled() {
        let timer = Arc::new(MockTimer::default());
        let cache = cache(timer);
        let sig = "sig";

        let mut page = cache
            .read_with_fallback("http://test.com/a?x=1", sig, DeviceClass::Desktop, true)
            .await;
        page.update(DOM, "status_code", "200", cache.now_ms());
        cache.commit(&page, &[DOM]).await.unwrap();

        let other = cache
            .read_with_fallback("http://test.com/a?x=2", sig, DeviceClass::Desktop, true)
            .await;
        assert_eq!(other.get(DOM, "status_code").unwrap().value(), "200");
        assert!(other.actual().get(DOM, "status_code").is_none());

        let disabled = cache
            .read_with_fallback("http://test.com/a?x=2", sig, DeviceClass::Desktop, false)
            .await;
        assert!(disabled.get(DOM, "status_code").is_none());
    }

    #[tokio::test]
    async fn device_classes_are_separate() {
        let a = PropertyCache::page_key(URL, "s", DeviceClass::Desktop);
        let b = PropertyCache::page_key(URL, "s", DeviceClass::Mobile);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn unknown_cohort_is_rejected() {
        let cache = cache(Arc::new(MockTimer::default()));
        let page = PropertyPage::new(URL, URL);
        assert!(matches!(
            cache.write_cohort(&page, "nope").await,
            Err(CacheError::UnknownCohort(_))
        ));
    }

    #[tokio::test]
    async fn disabled_cache_reads_nothing() {
        let mut cache = cache(Arc::new(MockTimer::default()));
        write_value(&cache, "7").await;
        cache.set_enabled(false);
        assert!(cache.read(URL, URL).await.get(DOM, "num_elements").is_none());
    }

    #[test]
    fn changed_flag_tracks_request_writes() {
        let mut page = PropertyPage::new(URL, URL);
        page.update(DOM, "a", "1", 0);
        assert!(page.get(DOM, "a").unwrap().has_changed());
        assert!(page.is_dirty(DOM));
        page.delete(DOM, "a");
        assert!(page.get(DOM, "a").is_none());
    }
}
