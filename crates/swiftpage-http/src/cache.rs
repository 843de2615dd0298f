//! TTL- and etag-aware cache of fetched and generated responses.

use crate::caching::{compute_caching, format_http_date, is_cacheable_status, CachingInfo};
use crate::headers::{names, RequestHeaders, ResponseHeaders};
use crate::value::HttpValue;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use swiftpage_cache::CacheBackend;
use swiftpage_core::{Hasher, RewriteOptions, Timer, TimestampMs};

/// Prefix of every HTTP cache key. Bumped whenever the stored layout
/// changes so entries written by an older layout read as misses.
pub const CACHE_KEY_PREFIX: &str = "v3/";

/// Prefix of synthesized etags.
pub const ETAG_PREFIX: &str = "W/\"PSA-";

/// A remembered failure, stored in place of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMemo {
    /// The origin could not be reached or answered with an error.
    FetchFailed,
    /// The origin answered with an uncacheable response.
    Uncacheable,
}

impl FailureMemo {
    const FETCH_FAILED_STATUS: u16 = 10_001;
    const UNCACHEABLE_STATUS: u16 = 10_002;

    fn status_code(self) -> u16 {
        match self {
            Self::FetchFailed => Self::FETCH_FAILED_STATUS,
            Self::Uncacheable => Self::UNCACHEABLE_STATUS,
        }
    }

    fn from_status(status: u16) -> Option<Self> {
        match status {
            Self::FETCH_FAILED_STATUS => Some(Self::FetchFailed),
            Self::UNCACHEABLE_STATUS => Some(Self::Uncacheable),
            _ => None,
        }
    }
}

/// Why a response was not stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotCacheable {
    /// The status code is not cacheable.
    Status(u16),
    /// The request carried `Authorization` and the response is not public.
    Authorized,
    /// `private`, `no-cache` or `no-store`.
    Private,
    /// The response varies on something other than `Accept-Encoding`.
    Vary,
    /// The response sets cookies and is not public.
    Cookies,
    /// The response has no remaining freshness.
    Expired,
    /// The body exceeds the cacheable size.
    TooLarge,
    /// HTML fetched over https while such caching is disabled.
    HtmlOverHttps,
}

impl fmt::Display for NotCacheable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(code) => write!(f, "status {code}"),
            Self::Authorized => f.write_str("authorized request"),
            Self::Private => f.write_str("private"),
            Self::Vary => f.write_str("vary"),
            Self::Cookies => f.write_str("sets cookies"),
            Self::Expired => f.write_str("expired"),
            Self::TooLarge => f.write_str("too large"),
            Self::HtmlOverHttps => f.write_str("html over https"),
        }
    }
}

/// Result of a lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum FindResult {
    /// A fresh entry.
    Found {
        /// The cached response.
        value: HttpValue,
        /// The entry is close to expiry and should be refreshed in the
        /// background.
        needs_freshen: bool,
    },
    /// No usable entry.
    NotFound {
        /// An expired `200` entry, returned only when stale serving is
        /// enabled.
        stale: Option<HttpValue>,
    },
    /// A remembered failure that has not expired.
    RecentFailure(FailureMemo),
}

/// Settings of the HTTP cache, taken from the rewrite options.
#[derive(Debug, Clone)]
pub struct HttpCacheConfig {
    /// Largest cacheable body; `-1` means unlimited.
    pub max_cacheable_response_content_length: i64,
    /// TTL of responses without caching headers.
    pub implicit_cache_ttl_ms: i64,
    /// Never store HTML fetched over https.
    pub disable_html_caching_on_https: bool,
    /// Refuse responses varying on anything but `Accept-Encoding`.
    pub respect_vary: bool,
    /// Lifetime of fetch-failure memos.
    pub fetch_failure_ttl_ms: i64,
    /// Lifetime of uncacheable memos.
    pub uncacheable_memo_ttl_ms: i64,
    /// Entries this close to expiry are flagged for freshening.
    pub freshen_threshold_ms: i64,
    /// Return expired entries as fallbacks.
    pub serve_stale_on_fetch_failure: bool,
}

impl From<&RewriteOptions> for HttpCacheConfig {
    fn from(options: &RewriteOptions) -> Self {
        Self {
            max_cacheable_response_content_length: options.max_cacheable_response_content_length,
            implicit_cache_ttl_ms: options.implicit_cache_ttl_ms,
            disable_html_caching_on_https: options.disable_html_caching_on_https,
            respect_vary: options.respect_vary,
            fetch_failure_ttl_ms: options.fetch_failure_ttl_ms,
            uncacheable_memo_ttl_ms: options.uncacheable_memo_ttl_ms,
            freshen_threshold_ms: options.freshen_threshold_ms,
            serve_stale_on_fetch_failure: options.serve_stale_on_fetch_failure,
        }
    }
}

impl Default for HttpCacheConfig {
    fn default() -> Self {
        Self::from(&RewriteOptions::default())
    }
}

/// HTTP cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpCacheStats {
    /// Fresh entries returned.
    pub hits: u64,
    /// Lookups without a fresh entry.
    pub misses: u64,
    /// Lookups the backend answered with a value.
    pub backend_hits: u64,
    /// Lookups the backend answered with nothing.
    pub backend_misses: u64,
    /// Expired entries returned as stale fallbacks.
    pub fallbacks: u64,
    /// Entries found expired or invalidated.
    pub expirations: u64,
    /// Responses stored.
    pub inserts: u64,
    /// Failure memos stored. Not counted in `inserts`.
    pub failure_memos: u64,
    /// Entries deleted.
    pub deletes: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    backend_hits: AtomicU64,
    backend_misses: AtomicU64,
    fallbacks: AtomicU64,
    expirations: AtomicU64,
    inserts: AtomicU64,
    failure_memos: AtomicU64,
    deletes: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Cache of responses keyed by URL.
pub struct HttpCache {
    backend: Arc<dyn CacheBackend>,
    timer: Arc<dyn Timer>,
    hasher: Arc<dyn Hasher>,
    config: HttpCacheConfig,
    invalidated_before_ms: AtomicI64,
    counters: Counters,
}

impl HttpCache {
    /// Creates an HTTP cache over `backend`.
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        timer: Arc<dyn Timer>,
        hasher: Arc<dyn Hasher>,
        config: HttpCacheConfig,
    ) -> Self {
        Self {
            backend,
            timer,
            hasher,
            config,
            invalidated_before_ms: AtomicI64::new(i64::MIN),
            counters: Counters::default(),
        }
    }

    /// The backend key of `url`.
    pub fn cache_key(url: &str) -> String {
        format!("{CACHE_KEY_PREFIX}{url}")
    }

    /// The cache settings.
    pub fn config(&self) -> &HttpCacheConfig {
        &self.config
    }

    /// The etag synthesized for `body`.
    pub fn etag_for(&self, body: &[u8]) -> String {
        format!("{ETAG_PREFIX}{}\"", self.hasher.hash(body))
    }

    /// Looks up `url`.
    pub async fn find(&self, url: &str) -> FindResult {
        let now_ms = self.timer.now_ms();
        let stored = match self.backend.get(&Self::cache_key(url)).await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::warn!(url, error = %e, "http cache lookup failed");
                None
            }
        };
        let Some(stored) = stored else {
            bump(&self.counters.backend_misses);
            bump(&self.counters.misses);
            return FindResult::NotFound { stale: None };
        };
        bump(&self.counters.backend_hits);

        let value = match HttpValue::decode(&stored) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(url, error = %e, "dropping corrupt http cache entry");
                bump(&self.counters.misses);
                return FindResult::NotFound { stale: None };
            }
        };

        let info = compute_caching(&value.headers, self.config.implicit_cache_ttl_ms, now_ms);
        if let Some(memo) = FailureMemo::from_status(value.headers.status_code()) {
            if info.is_fresh(now_ms) {
                tracing::debug!(url, ?memo, "recent failure remembered");
                return FindResult::RecentFailure(memo);
            }
            bump(&self.counters.expirations);
            bump(&self.counters.misses);
            return FindResult::NotFound { stale: None };
        }

        if info.date_ms <= self.invalidated_before_ms.load(Ordering::Acquire) {
            bump(&self.counters.expirations);
            bump(&self.counters.misses);
            return FindResult::NotFound { stale: None };
        }

        if !info.is_fresh(now_ms) {
            bump(&self.counters.expirations);
            bump(&self.counters.misses);
            let stale = (self.config.serve_stale_on_fetch_failure
                && value.headers.status_code() == 200)
                .then(|| {
                    bump(&self.counters.fallbacks);
                    value
                });
            return FindResult::NotFound { stale };
        }

        bump(&self.counters.hits);
        let needs_freshen = now_ms > info.expiration_ms() - self.config.freshen_threshold_ms;
        FindResult::Found {
            value,
            needs_freshen,
        }
    }

    /// Decides whether a response may be stored.
    pub fn check_cacheable(
        &self,
        url: &str,
        request: Option<&RequestHeaders>,
        headers: &ResponseHeaders,
        body_len: usize,
    ) -> Result<CachingInfo, NotCacheable> {
        let now_ms = self.timer.now_ms();
        let info = compute_caching(headers, self.config.implicit_cache_ttl_ms, now_ms);

        if !is_cacheable_status(headers.status_code()) {
            return Err(NotCacheable::Status(headers.status_code()));
        }
        if request.is_some_and(RequestHeaders::has_authorization) && !info.is_public() {
            return Err(NotCacheable::Authorized);
        }
        if !info.cache_control.allows_shared_caching() {
            return Err(NotCacheable::Private);
        }
        let vary = headers.tokens(names::VARY);
        if vary.iter().any(|v| v == "*")
            || (self.config.respect_vary && vary.iter().any(|v| v != "accept-encoding"))
        {
            return Err(NotCacheable::Vary);
        }
        if headers.has_cookies() && !info.is_public() {
            return Err(NotCacheable::Cookies);
        }
        if info.ttl_ms <= 0 || !info.is_fresh(now_ms) {
            return Err(NotCacheable::Expired);
        }
        let max = self.config.max_cacheable_response_content_length;
        if max >= 0 {
            let declared = headers.content_length().unwrap_or(0);
            let too_large = u64::try_from(max).map_or(true, |max| {
                declared > max || body_len as u64 > max
            });
            if too_large {
                return Err(NotCacheable::TooLarge);
            }
        }
        if self.config.disable_html_caching_on_https
            && url.starts_with("https://")
            && headers.is_html()
        {
            return Err(NotCacheable::HtmlOverHttps);
        }
        Ok(info)
    }

    /// Stores a response if it is cacheable. Cookies are stripped and an
    /// etag is synthesized when the response has none. Returns whether the
    /// response was stored.
    pub async fn put(
        &self,
        url: &str,
        request: Option<&RequestHeaders>,
        headers: &ResponseHeaders,
        body: Bytes,
    ) -> bool {
        if let Err(reason) = self.check_cacheable(url, request, headers, body.len()) {
            tracing::debug!(url, %reason, "not caching response");
            return false;
        }

        let mut headers = headers.clone();
        headers.strip_cookies();
        if !headers.contains(names::DATE) {
            headers.set(names::DATE, format_http_date(self.timer.now_ms()));
        }
        if !headers.contains(names::ETAG) {
            headers.set(names::ETAG, self.etag_for(&body));
        }
        let stored = self.store(url, &HttpValue::new(headers, body)).await;
        if stored {
            bump(&self.counters.inserts);
        }
        stored
    }

    /// Remembers that fetching `url` failed, unless the request was
    /// authorized, in which case nothing is stored.
    pub async fn remember_failure(
        &self,
        url: &str,
        memo: FailureMemo,
        request: Option<&RequestHeaders>,
    ) -> bool {
        if request.is_some_and(RequestHeaders::has_authorization) {
            return false;
        }
        let ttl_ms = match memo {
            FailureMemo::FetchFailed => self.config.fetch_failure_ttl_ms,
            FailureMemo::Uncacheable => self.config.uncacheable_memo_ttl_ms,
        };
        let mut headers = ResponseHeaders::new(memo.status_code());
        headers.set(names::DATE, format_http_date(self.timer.now_ms()));
        headers.set(names::CACHE_CONTROL, format!("max-age={}", ttl_ms.max(0) / 1000));
        tracing::debug!(url, ?memo, ttl_ms, "remembering failure");
        let stored = self.store(url, &HttpValue::new(headers, Bytes::new())).await;
        if stored {
            bump(&self.counters.failure_memos);
        }
        stored
    }

    async fn store(&self, url: &str, value: &HttpValue) -> bool {
        let encoded = match value.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!(url, error = %e, "could not encode http cache entry");
                return false;
            }
        };
        match self.backend.put(&Self::cache_key(url), encoded).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(url, error = %e, kind = "cache_write_failed", "http cache write failed");
                false
            }
        }
    }

    /// Removes the entry for `url`.
    pub async fn invalidate(&self, url: &str) -> bool {
        match self.backend.delete(&Self::cache_key(url)).await {
            Ok(true) => {
                bump(&self.counters.deletes);
                true
            }
            Ok(false) => false,
            Err(e) => {
                tracing::warn!(url, error = %e, "http cache delete failed");
                false
            }
        }
    }

    /// Treats every entry dated at or before `timestamp_ms` as expired.
    pub fn invalidate_all_before(&self, timestamp_ms: TimestampMs) {
        self.invalidated_before_ms
            .fetch_max(timestamp_ms, Ordering::AcqRel);
    }

    /// Current time from the cache's clock.
    pub fn now_ms(&self) -> TimestampMs {
        self.timer.now_ms()
    }

    /// Returns current statistics.
    pub fn stats(&self) -> HttpCacheStats {
        let c = &self.counters;
        HttpCacheStats {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            backend_hits: c.backend_hits.load(Ordering::Relaxed),
            backend_misses: c.backend_misses.load(Ordering::Relaxed),
            fallbacks: c.fallbacks.load(Ordering::Relaxed),
            expirations: c.expirations.load(Ordering::Relaxed),
            inserts: c.inserts.load(Ordering::Relaxed),
            failure_memos: c.failure_memos.load(Ordering::Relaxed),
            deletes: c.deletes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use swiftpage_cache::LruCacheBackend;
    use swiftpage_core::{MockHasher, MockTimer};

    const URL: &str = "http://test.com/a.css";

    fn cache_with(timer: Arc<MockTimer>, config: HttpCacheConfig) -> HttpCache {
        HttpCache::new(
            Arc::new(LruCacheBackend::with_defaults()),
            timer,
            Arc::new(MockHasher::new()),
            config,
        )
    }

    fn cache(timer: Arc<MockTimer>) -> HttpCache {
        cache_with(timer, HttpCacheConfig::default())
    }

    fn css(cache_control: &str) -> ResponseHeaders {
        let mut headers = ResponseHeaders::ok("text/css");
        headers.add(names::CACHE_CONTROL, cache_control);
        headers
    }

    #[tokio::test]
    async fn put_then_find() {
        let timer = Arc::new(MockTimer::default());
        let cache = cache(Arc::clone(&timer));
        assert!(cache.put(URL, None, &css("max-age=300"), Bytes::from("a{}")).await);

        match cache.find(URL).await {
            FindResult::Found {
                value,
                needs_freshen,
            } => {
                assert_eq!(value.body, Bytes::from("a{}"));
                assert!(value.headers.get(names::ETAG).unwrap().starts_with(ETAG_PREFIX));
                assert!(!needs_freshen);
            }
            other => panic!("unexpected {other:?}"),
        }
        let stats = cache.stats();
        assert_eq!(stats.inserts, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn keys_carry_version_prefix() {
        assert_eq!(HttpCache::cache_key(URL), "v3/http://test.com/a.css");
    }

    #[tokio::test]
    async fn authorization_without_public_is_not_cached() {
        let cache = cache(Arc::new(MockTimer::default()));
        let request: RequestHeaders = [(names::AUTHORIZATION, "Basic xyz")].into_iter().collect();

        assert!(!cache.put(URL, Some(&request), &css("max-age=300"), Bytes::from("x")).await);
        assert_eq!(cache.stats().inserts, 0);
        assert!(cache.put(URL, Some(&request), &css("max-age=300, public"), Bytes::from("x")).await);
    }

    #[tokio::test]
    async fn oversized_content_length_is_not_cached() {
        let config = HttpCacheConfig {
            max_cacheable_response_content_length: 4,
            ..Default::default()
        };
        let cache = cache_with(Arc::new(MockTimer::default()), config);
        let mut headers = css("max-age=300");
        headers.add(names::CONTENT_LENGTH, "5");
        assert!(!cache.put(URL, None, &headers, Bytes::from("12")).await);
        assert!(!cache.put(URL, None, &css("max-age=300"), Bytes::from("12345")).await);
        assert!(cache.put(URL, None, &css("max-age=300"), Bytes::from("1234")).await);
        assert_eq!(cache.stats().inserts, 1);
    }

    #[tokio::test]
    async fn cookies_refused_unless_public() {
        let cache = cache(Arc::new(MockTimer::default()));
        let mut headers = css("max-age=300");
        headers.add(names::SET_COOKIE2, "a=b");
        assert!(!cache.put(URL, None, &headers, Bytes::new()).await);

        let mut public = css("max-age=300, public");
        public.add(names::SET_COOKIE, "a=b");
        assert!(cache.put(URL, None, &public, Bytes::new()).await);
        let FindResult::Found { value, .. } = cache.find(URL).await else {
            panic!("expected hit");
        };
        assert!(!value.headers.has_cookies());
    }

    #[tokio::test]
    async fn zero_ttl_and_private_not_cached() {
        let cache = cache(Arc::new(MockTimer::default()));
        assert!(!cache.put(URL, None, &css("max-age=0"), Bytes::from("x")).await);
        assert!(!cache.put(URL, None, &css("private, max-age=300"), Bytes::from("x")).await);
        assert!(!cache.put(URL, None, &css("no-store"), Bytes::from("x")).await);
        assert_eq!(cache.stats().inserts, 0);
    }

    #[tokio::test]
    async fn vary_handling() {
        let timer = Arc::new(MockTimer::default());
        let mut headers = css("max-age=300");
        headers.add(names::VARY, "Accept-Encoding, User-Agent");

        let lenient = cache(Arc::clone(&timer));
        assert!(lenient.put(URL, None, &headers, Bytes::new()).await);

        let strict = cache_with(
            timer,
            HttpCacheConfig {
                respect_vary: true,
                ..Default::default()
            },
        );
        assert!(!strict.put(URL, None, &headers, Bytes::new()).await);

        let mut star = css("max-age=300");
        star.add(names::VARY, "*");
        assert!(!lenient.put(URL, None, &star, Bytes::new()).await);
    }

    #[tokio::test]
    async fn html_over_https_refused_when_disabled() {
        let cache = cache_with(
            Arc::new(MockTimer::default()),
            HttpCacheConfig {
                disable_html_caching_on_https: true,
                ..Default::default()
            },
        );
        let mut html = ResponseHeaders::ok("text/html");
        html.add(names::CACHE_CONTROL, "max-age=300");
        assert!(!cache.put("https://test.com/", None, &html, Bytes::new()).await);
        assert!(cache.put("http://test.com/", None, &html, Bytes::new()).await);
    }

    #[tokio::test]
    async fn expiry_and_freshen() {
        let timer = Arc::new(MockTimer::default());
        let cache = cache_with(
            Arc::clone(&timer),
            HttpCacheConfig {
                freshen_threshold_ms: 60_000,
                ..Default::default()
            },
        );
        cache.put(URL, None, &css("max-age=300"), Bytes::from("x")).await;

        timer.advance_ms(250_000);
        assert!(matches!(
            cache.find(URL).await,
            FindResult::Found { needs_freshen: true, .. }
        ));

        timer.advance_ms(60_000);
        assert_eq!(cache.find(URL).await, FindResult::NotFound { stale: None });
        assert_eq!(cache.stats().expirations, 1);
    }

    #[tokio::test]
    async fn stale_fallback_when_enabled() {
        let timer = Arc::new(MockTimer::default());
        let cache = cache_with(
            Arc::clone(&timer),
            HttpCacheConfig {
                serve_stale_on_fetch_failure: true,
                ..Default::default()
            },
        );
        cache.put(URL, None, &css("max-age=300"), Bytes::from("old")).await;
        timer.advance_ms(301_000);
        match cache.find(URL).await {
            FindResult::NotFound { stale: Some(value) } => assert_eq!(value.body, Bytes::from("old")),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(cache.stats().fallbacks, 1);
    }

    #[tokio::test]
    async fn failure_memo_expires() {
        let timer = Arc::new(MockTimer::default());
        let cache = cache_with(
            Arc::clone(&timer),
            HttpCacheConfig {
                fetch_failure_ttl_ms: 10_000,
                ..Default::default()
            },
        );
        assert!(cache.remember_failure(URL, FailureMemo::FetchFailed, None).await);
        assert_eq!(
            cache.find(URL).await,
            FindResult::RecentFailure(FailureMemo::FetchFailed)
        );
        assert_eq!(cache.stats().inserts, 0);
        assert_eq!(cache.stats().failure_memos, 1);
        timer.advance_ms(10_000);
        assert_eq!(cache.find(URL).await, FindResult::NotFound { stale: None });
    }

    #[tokio::test]
    async fn authorized_failures_are_not_remembered() {
        let cache = cache(Arc::new(MockTimer::default()));
        let request: RequestHeaders = [(names::AUTHORIZATION, "Basic xyz")].into_iter().collect();
        assert!(!cache.remember_failure(URL, FailureMemo::FetchFailed, Some(&request)).await);
        assert_eq!(cache.find(URL).await, FindResult::NotFound { stale: None });
    }

    #[tokio::test]
    async fn invalidation() {
        let timer = Arc::new(MockTimer::default());
        let cache = cache(Arc::clone(&timer));
        cache.put(URL, None, &css("max-age=300"), Bytes::from("x")).await;
        assert!(cache.invalidate(URL).await);
        assert_eq!(cache.stats().deletes, 1);
        assert_eq!(cache.find(URL).await, FindResult::NotFound { stale: None });

        cache.put(URL, None, &css("max-age=300"), Bytes::from("x")).await;
        cache.invalidate_all_before(timer.now_ms());
        assert_eq!(cache.find(URL).await, FindResult::NotFound { stale: None });

        timer.advance_ms(1_000);
        cache.put(URL, None, &css("max-age=300"), Bytes::from("y")).await;
        assert!(matches!(cache.find(URL).await, FindResult::Found { .. }));
    }
}
