//! Cache-first loading of input resources.
//!
//! Lookups go to the HTTP cache first. Fresh entries are returned
//! directly; entries close to expiry are returned and refreshed in the
//! background, at most one refresh per URL at a time. Misses are fetched
//! from the origin (through the proxy mapping, if any) and stored when
//! cacheable. Failures and uncacheable responses leave short-lived memos.

use crate::background::BackgroundTasks;
use crate::resource::{LoadedResource, Resource};
use dashmap::DashSet;
use std::sync::Arc;
use swiftpage_core::{DomainLawyer, RewriteErrorKind, Timer};
use swiftpage_http::cache::ETAG_PREFIX;
use swiftpage_http::{
    fetch_recorded, names, BufferSink, FailureMemo, FindResult, HttpCache, HttpValue,
    RequestContext, RequestContextPtr, RequestHeaders, UrlAsyncFetcher,
};

/// Outcome of a conditional refetch.
#[derive(Debug, Clone)]
pub enum Revalidation {
    /// The origin answered `304`; the input is unchanged.
    NotModified {
        /// New expiration of the input.
        expiration_ms: i64,
    },
    /// The origin sent a new response.
    Modified(LoadedResource),
    /// The origin could not be reached or answered with an error.
    Failed,
}

/// Loads resources through the HTTP cache.
#[derive(Clone)]
pub struct ResourceLoader {
    http_cache: Arc<HttpCache>,
    fetcher: Arc<dyn UrlAsyncFetcher>,
    timer: Arc<dyn Timer>,
    domain_lawyer: Arc<DomainLawyer>,
    tasks: BackgroundTasks,
    freshening: Arc<DashSet<String>>,
}

impl ResourceLoader {
    /// Creates a loader.
    pub fn new(
        http_cache: Arc<HttpCache>,
        fetcher: Arc<dyn UrlAsyncFetcher>,
        timer: Arc<dyn Timer>,
        domain_lawyer: Arc<DomainLawyer>,
        tasks: BackgroundTasks,
    ) -> Self {
        Self {
            http_cache,
            fetcher,
            timer,
            domain_lawyer,
            tasks,
            freshening: Arc::new(DashSet::new()),
        }
    }

    /// The HTTP cache loads go through.
    pub fn http_cache(&self) -> &Arc<HttpCache> {
        &self.http_cache
    }

    fn implicit_ttl_ms(&self) -> i64 {
        self.http_cache.config().implicit_cache_ttl_ms
    }

    fn wrap(&self, url: &str, value: HttpValue) -> LoadedResource {
        LoadedResource::new(url, value, self.implicit_ttl_ms(), self.timer.now_ms())
    }

    /// Loads `resource` on behalf of `ctx`.
    ///
    /// With `allow_uncacheable`, a remembered "uncacheable" memo does not
    /// stop the fetch; the caller gets the response and decides.
    pub async fn load(
        &self,
        resource: &Resource,
        ctx: &RequestContextPtr,
        allow_uncacheable: bool,
    ) -> Result<LoadedResource, RewriteErrorKind> {
        let url = match resource {
            Resource::Data { .. } => {
                return LoadedResource::inline(resource, self.timer.now_ms())
                    .ok_or(RewriteErrorKind::DecodeInvalid);
            }
            Resource::Url(url) => url.as_str(),
        };

        let stale = match self.http_cache.find(url).await {
            FindResult::Found {
                value,
                needs_freshen,
            } => {
                if needs_freshen {
                    self.freshen(url);
                }
                return Ok(self.wrap(url, value));
            }
            FindResult::RecentFailure(FailureMemo::FetchFailed) => {
                return Err(RewriteErrorKind::FetchFailed);
            }
            FindResult::RecentFailure(FailureMemo::Uncacheable) if !allow_uncacheable => {
                return Err(RewriteErrorKind::InputUncacheable);
            }
            FindResult::RecentFailure(FailureMemo::Uncacheable) => None,
            FindResult::NotFound { stale } => stale,
        };

        self.fetch_and_store(url, ctx, stale).await
    }

    async fn fetch_and_store(
        &self,
        url: &str,
        ctx: &RequestContext,
        stale: Option<HttpValue>,
    ) -> Result<LoadedResource, RewriteErrorKind> {
        let fetch_url = self
            .domain_lawyer
            .map_request_to_origin(url)
            .unwrap_or_else(|| url.to_string());
        let background = ctx.log_record().was_background_fetch;
        let mut sink = BufferSink::new();
        fetch_recorded(
            self.fetcher.as_ref(),
            self.timer.as_ref(),
            ctx,
            &fetch_url,
            background,
            &mut sink,
        )
        .await;
        let request = Some(ctx.request_headers());

        let value = match sink.into_value() {
            Some(value) if value.headers.status_code() == 200 => value,
            fetched => {
                let status = fetched.as_ref().map(|v| v.headers.status_code());
                let server_error = status.map_or(true, |s| s >= 500);
                if let (true, Some(stale)) = (server_error, stale) {
                    tracing::info!(url, ?status, "origin failed, serving stale copy");
                    return Ok(self.wrap(url, stale));
                }
                tracing::debug!(url, ?status, "input fetch failed");
                self.http_cache
                    .remember_failure(url, FailureMemo::FetchFailed, request)
                    .await;
                return Err(RewriteErrorKind::FetchFailed);
            }
        };

        let mut headers = value.headers.clone();
        if self.domain_lawyer.is_proxy_mapped(url) && headers.strip_cookies() {
            tracing::debug!(url, "stripped cookies from proxied input");
        }
        let stored = self
            .http_cache
            .put(url, request, &headers, value.body.clone())
            .await;
        headers.strip_cookies();
        let loaded = self.wrap(url, HttpValue::new(headers, value.body));
        if stored {
            return Ok(loaded);
        }
        self.http_cache
            .remember_failure(url, FailureMemo::Uncacheable, request)
            .await;
        Ok(loaded.not_cacheable())
    }

    /// Refreshes `url` in the background unless a refresh is already
    /// running.
    pub fn freshen(&self, url: &str) {
        if !self.freshening.insert(url.to_string()) {
            return;
        }
        let loader = self.clone();
        let url = url.to_string();
        self.tasks.spawn(async move {
            let ctx = RequestContext::background(url.clone(), loader.timer.now_ms());
            let result = loader.fetch_and_store(&url, &ctx, None).await;
            tracing::debug!(url = %url, ok = result.is_ok(), "freshened input");
            loader.freshening.remove(&url);
        });
    }

    /// Refetches `url` conditionally on the validators it was last seen
    /// with.
    pub async fn revalidate(
        &self,
        url: &str,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Revalidation {
        let mut request = RequestHeaders::new();
        if let Some(etag) = etag.filter(|e| !e.starts_with(ETAG_PREFIX)) {
            request.set(names::IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = last_modified {
            request.set(names::IF_MODIFIED_SINCE, last_modified);
        }
        let fetch_url = self
            .domain_lawyer
            .map_request_to_origin(url)
            .unwrap_or_else(|| url.to_string());

        let mut sink = BufferSink::new();
        self.fetcher.fetch(&fetch_url, &request, &mut sink).await;
        let Some(value) = sink.into_value() else {
            return Revalidation::Failed;
        };
        match value.headers.status_code() {
            304 => {
                let refreshed = self.wrap(url, value);
                Revalidation::NotModified {
                    expiration_ms: refreshed.expiration_ms(),
                }
            }
            200 => {
                let mut headers = value.headers.clone();
                headers.strip_cookies();
                self.http_cache
                    .put(url, None, &headers, value.body.clone())
                    .await;
                Revalidation::Modified(self.wrap(url, HttpValue::new(headers, value.body)))
            }
            _ => Revalidation::Failed,
        }
    }

    /// Number of background refreshes in progress.
    pub fn freshens_in_progress(&self) -> usize {
        self.freshening.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use swiftpage_cache::LruCacheBackend;
    use swiftpage_core::{DeviceClass, DomainLawyerConfig, MockHasher, MockTimer, ProxyMapping};
    use swiftpage_http::{HttpCacheConfig, MockFetcher, ResponseHeaders};

    const URL: &str = "http://test.com/a.css";

    struct Fixture {
        timer: Arc<MockTimer>,
        fetcher: Arc<MockFetcher>,
        loader: ResourceLoader,
        tasks: BackgroundTasks,
    }

    fn fixture_with(config: HttpCacheConfig, lawyer: DomainLawyer) -> Fixture {
        let timer = Arc::new(MockTimer::default());
        let fetcher = Arc::new(MockFetcher::new());
        let http_cache = Arc::new(HttpCache::new(
            Arc::new(LruCacheBackend::with_defaults()),
            timer.clone(),
            Arc::new(MockHasher::new()),
            config,
        ));
        let tasks = BackgroundTasks::new();
        let loader = ResourceLoader::new(
            http_cache,
            fetcher.clone(),
            timer.clone(),
            Arc::new(lawyer),
            tasks.clone(),
        );
        Fixture {
            timer,
            fetcher,
            loader,
            tasks,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(HttpCacheConfig::default(), DomainLawyer::default())
    }

    fn request(f: &Fixture) -> RequestContextPtr {
        RequestContext::new(
            "http://test.com/",
            RequestHeaders::new(),
            DeviceClass::Desktop,
            f.timer.now_ms(),
        )
    }

    #[tokio::test]
    async fn second_load_is_served_from_cache() {
        let f = fixture();
        f.fetcher.set_text(URL, "text/css", 300, "a{}");
        let ctx = request(&f);
        let resource = Resource::new(URL).unwrap();

        let first = f.loader.load(&resource, &ctx, false).await.unwrap();
        let second = f.loader.load(&resource, &ctx, false).await.unwrap();
        assert_eq!(first.body(), second.body());
        assert_eq!(f.fetcher.fetch_count(), 1);
        assert_eq!(f.loader.http_cache().stats().hits, 1);
    }

    #[tokio::test]
    async fn failures_are_remembered() {
        let f = fixture();
        f.fetcher.set_failure(URL);
        let ctx = request(&f);
        let resource = Resource::new(URL).unwrap();

        assert_eq!(
            f.loader.load(&resource, &ctx, false).await.unwrap_err(),
            RewriteErrorKind::FetchFailed
        );
        assert_eq!(
            f.loader.load(&resource, &ctx, false).await.unwrap_err(),
            RewriteErrorKind::FetchFailed
        );
        assert_eq!(f.fetcher.fetch_count(), 1);
    }

    #[tokio::test]
    async fn uncacheable_inputs_load_once_then_memo() {
        let f = fixture();
        f.fetcher.set_text(URL, "text/css", 0, "a{}");
        let ctx = request(&f);
        let resource = Resource::new(URL).unwrap();

        let loaded = f.loader.load(&resource, &ctx, false).await.unwrap();
        assert!(!loaded.is_cacheable_for(0));
        assert_eq!(
            f.loader.load(&resource, &ctx, false).await.unwrap_err(),
            RewriteErrorKind::InputUncacheable
        );
        assert!(f.loader.load(&resource, &ctx, true).await.is_ok());
        assert_eq!(f.fetcher.fetch_count(), 2);
    }

    #[tokio::test]
    async fn oversized_input_is_memoized_not_inserted() {
        let config = HttpCacheConfig {
            max_cacheable_response_content_length: 10,
            ..HttpCacheConfig::default()
        };
        let f = fixture_with(config, DomainLawyer::default());
        let mut headers = ResponseHeaders::ok("text/css");
        headers.set(names::CACHE_CONTROL, "max-age=300");
        headers.set(names::CONTENT_LENGTH, "100");
        f.fetcher.set_response(URL, headers, "a".repeat(100));
        let ctx = request(&f);
        let resource = Resource::new(URL).unwrap();

        let loaded = f.loader.load(&resource, &ctx, false).await.unwrap();
        assert_eq!(loaded.body().len(), 100);
        assert!(!loaded.is_cacheable_for(0));
        let stats = f.loader.http_cache().stats();
        assert_eq!(stats.inserts, 0);
        assert_eq!(stats.failure_memos, 1);

        assert_eq!(
            f.loader.load(&resource, &ctx, false).await.unwrap_err(),
            RewriteErrorKind::InputUncacheable
        );
        assert_eq!(f.fetcher.fetch_count(), 1);
    }

    #[tokio::test]
    async fn near_expiry_entries_are_freshened_once() {
        let f = fixture();
        f.fetcher.set_text(URL, "text/css", 100, "a{}");
        let ctx = request(&f);
        let resource = Resource::new(URL).unwrap();
        f.loader.load(&resource, &ctx, false).await.unwrap();

        // Inside the default 60s freshen window.
        f.timer.advance_ms(50_000);
        f.loader.load(&resource, &ctx, false).await.unwrap();
        f.loader.load(&resource, &ctx, false).await.unwrap();
        f.tasks.wait_idle().await;
        assert!(f.fetcher.fetch_count() >= 2);
        assert!(f.fetcher.fetch_count() <= 3);
        assert_eq!(f.loader.freshens_in_progress(), 0);
    }

    #[tokio::test]
    async fn stale_copy_served_when_origin_fails() {
        let config = HttpCacheConfig {
            serve_stale_on_fetch_failure: true,
            ..HttpCacheConfig::default()
        };
        let f = fixture_with(config, DomainLawyer::default());
        f.fetcher.set_text(URL, "text/css", 100, "a{}");
        let ctx = request(&f);
        let resource = Resource::new(URL).unwrap();
        f.loader.load(&resource, &ctx, false).await.unwrap();

        f.timer.advance_ms(200_000);
        f.fetcher.set_response(URL, ResponseHeaders::new(503), "");
        let loaded = f.loader.load(&resource, &ctx, false).await.unwrap();
        assert_eq!(loaded.body().as_ref(), b"a{}");
    }

    #[tokio::test]
    async fn client_errors_do_not_use_stale_copy() {
        let config = HttpCacheConfig {
            serve_stale_on_fetch_failure: true,
            ..HttpCacheConfig::default()
        };
        let f = fixture_with(config, DomainLawyer::default());
        f.fetcher.set_text(URL, "text/css", 100, "a{}");
        let ctx = request(&f);
        let resource = Resource::new(URL).unwrap();
        f.loader.load(&resource, &ctx, false).await.unwrap();

        f.timer.advance_ms(200_000);
        f.fetcher.set_response(URL, ResponseHeaders::new(404), "");
        assert_eq!(
            f.loader.load(&resource, &ctx, false).await.unwrap_err(),
            RewriteErrorKind::FetchFailed
        );
    }

    #[tokio::test]
    async fn proxied_inputs_are_fetched_from_origin() {
        let lawyer = DomainLawyer::new(&DomainLawyerConfig {
            proxy_domains: vec![ProxyMapping {
                proxy: "http://proxyhost.com/test.com/".to_string(),
                origin: "http://test.com/".to_string(),
            }],
            ..DomainLawyerConfig::default()
        })
        .unwrap();
        let f = fixture_with(HttpCacheConfig::default(), lawyer);
        let mut headers = ResponseHeaders::ok("text/css");
        headers.add(names::CACHE_CONTROL, "public, max-age=300");
        headers.add(names::SET_COOKIE, "session=1");
        f.fetcher.set_response(URL, headers, "a{}");
        let ctx = request(&f);

        let resource = Resource::new("http://proxyhost.com/test.com/a.css").unwrap();
        let loaded = f.loader.load(&resource, &ctx, false).await.unwrap();
        assert!(!loaded.headers().has_cookies());
        assert_eq!(f.fetcher.fetch_count_for(URL), 1);
    }

    #[tokio::test]
    async fn revalidation_uses_validators() {
        let f = fixture();
        let mut headers = ResponseHeaders::ok("text/css");
        headers.add(names::CACHE_CONTROL, "max-age=100");
        headers.add(names::LAST_MODIFIED, "Mon, 05 Apr 2010 18:00:00 GMT");
        f.fetcher.set_response(URL, headers, "a{}");

        let result = f
            .loader
            .revalidate(URL, Some("W/\"PSA-abcd\""), Some("Mon, 05 Apr 2010 18:00:00 GMT"))
            .await;
        assert!(matches!(result, Revalidation::NotModified { .. }));
        let sent = f.fetcher.last_request_headers(URL).unwrap();
        assert!(!sent.contains(names::IF_NONE_MATCH));

        let changed = f
            .loader
            .revalidate(URL, None, Some("Sun, 04 Apr 2010 18:00:00 GMT"))
            .await;
        assert!(matches!(changed, Revalidation::Modified(_)));
    }
}
