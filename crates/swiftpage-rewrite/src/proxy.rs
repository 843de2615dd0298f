//! The entry point for client requests.
//!
//! [`ProxyInterface`] decides how each request is answered:
//!
//! 1. blacklisted URLs are rejected when the options say so;
//! 2. rewritten URLs go to the [`ResourceServer`];
//! 3. resources with an in-place optimized copy get that copy;
//! 4. other resources are answered from the HTTP cache when fresh;
//! 5. everything else is fetched from the origin and streamed through a
//!    [`ProxyFetch`], with the page's property-cache lookup racing the
//!    fetch.

use crate::collector::PropertyCallbackCollector;
use crate::driver::{is_rewriting_disabled, PAGESPEED_OFF};
use crate::in_place::{InPlaceRewriter, IN_PLACE_ID};
use crate::proxy_fetch::{ProxyFetch, ResponseWriter};
use crate::resource_server::{send_value, ResourceServer};
use crate::server_context::ServerContext;
use std::sync::Arc;
use swiftpage_core::{ContentType, RewrittenUrl};
use swiftpage_http::{
    fetch_recorded, ChannelSink, FindResult, HttpValue, RequestContextPtr, RequestHeaders,
    ResponseHeaders,
};

/// Answers client requests.
#[derive(Debug, Clone)]
pub struct ProxyInterface {
    server: Arc<ServerContext>,
    resources: ResourceServer,
    in_place: InPlaceRewriter,
}

impl ProxyInterface {
    /// Creates the interface.
    pub fn new(server: Arc<ServerContext>) -> Self {
        Self {
            resources: ResourceServer::new(Arc::clone(&server)),
            in_place: InPlaceRewriter::new(Arc::clone(&server)),
            server,
        }
    }

    /// The server context.
    pub fn server(&self) -> &Arc<ServerContext> {
        &self.server
    }

    /// The in-place rewriter.
    pub fn in_place(&self) -> &InPlaceRewriter {
        &self.in_place
    }

    /// Creates a request for `url` and answers it.
    pub async fn fetch(
        &self,
        url: &str,
        headers: RequestHeaders,
        writer: &mut dyn ResponseWriter,
    ) -> bool {
        let request = self.server.new_request_context(url, headers);
        self.handle(&request, writer).await
    }

    /// Answers `request` into `writer`. Returns whether the response
    /// completed.
    pub async fn handle(&self, request: &RequestContextPtr, writer: &mut dyn ResponseWriter) -> bool {
        let url = request.url();
        let options = self.server.options();
        let blacklisted = self.server.is_blacklisted(url);
        if blacklisted && options.reject_blacklisted {
            tracing::debug!(url, "rejecting blacklisted url");
            let status = options.reject_blacklisted_status_code;
            writer.headers_complete(&ResponseHeaders::new(status));
            writer.done(true);
            self.emit_log_record(request, status);
            return true;
        }

        let registry = self.server.registry();
        let hash_len = self.server.hasher().hash_size_in_chars();
        if RewrittenUrl::parse(url, hash_len, |id| registry.contains(id)).is_ok() {
            let status = self.resources.serve(request, writer).await;
            return status < 400;
        }

        let rewriting = !blacklisted && !is_rewriting_disabled(url);
        let in_place = rewriting && options.in_place_rewriting_enabled;
        if in_place {
            if let Some(value) = self.in_place.find(url).await {
                tracing::debug!(url, "serving in-place optimized resource");
                request.log_record().log_applied(IN_PLACE_ID, url);
                return self.send_cached(request, &value, writer);
            }
        }

        if !request.request_headers().has_authorization() {
            if let Some(value) = self.find_cached(url).await {
                if in_place {
                    self.maybe_rewrite_in_place(url, &value);
                }
                return self.send_cached(request, &value, writer);
            }
        }

        let completed = self.proxy(request, rewriting, writer).await;
        if completed && in_place {
            if let FindResult::Found { value, .. } = self.server.http_cache().find(url).await {
                self.maybe_rewrite_in_place(url, &value);
            }
        }
        completed
    }

    /// A fresh cached response for a non-HTML `url`.
    async fn find_cached(&self, url: &str) -> Option<HttpValue> {
        match self.server.http_cache().find(url).await {
            FindResult::Found {
                value,
                needs_freshen,
            } if !value.headers.is_html() => {
                if needs_freshen {
                    self.server.loader().freshen(url);
                }
                Some(value)
            }
            _ => None,
        }
    }

    fn maybe_rewrite_in_place(&self, url: &str, value: &HttpValue) {
        let optimizable = value
            .headers
            .content_type()
            .and_then(ContentType::from_mime)
            .is_some_and(|ct| self.in_place.transformer_for(&ct).is_some());
        if optimizable {
            self.in_place.schedule(url);
        }
    }

    fn send_cached(
        &self,
        request: &RequestContextPtr,
        value: &HttpValue,
        writer: &mut dyn ResponseWriter,
    ) -> bool {
        let status = send_value(request, value, writer);
        self.emit_log_record(request, status);
        true
    }

    /// Fetches from the origin and streams the response through a
    /// [`ProxyFetch`].
    async fn proxy(
        &self,
        request: &RequestContextPtr,
        rewriting: bool,
        writer: &mut dyn ResponseWriter,
    ) -> bool {
        let url = request.url();
        let maybe_html = ContentType::from_url(url).map_or(true, |ct| ct.is_html());
        let collector = (rewriting && maybe_html)
            .then(|| PropertyCallbackCollector::start(&self.server, request));

        let origin = without_rewriting_switch(url);
        let fetch_url = self
            .server
            .domain_lawyer()
            .map_request_to_origin(&origin)
            .unwrap_or(origin);
        let (mut sink, events) = ChannelSink::channel();
        let fetcher = Arc::clone(self.server.fetcher());
        let timer = Arc::clone(self.server.timer());
        let fetch_request = Arc::clone(request);
        self.server.tasks().spawn(async move {
            fetch_recorded(
                fetcher.as_ref(),
                timer.as_ref(),
                &fetch_request,
                &fetch_url,
                false,
                &mut sink,
            )
            .await
        });

        let mut fetch = ProxyFetch::new(Arc::clone(&self.server), Arc::clone(request), collector);
        if !rewriting {
            fetch = fetch.without_rewriting();
        }
        fetch.run(events, writer).await
    }

    fn emit_log_record(&self, request: &RequestContextPtr, status_code: u16) {
        let now_ms = self.server.timer().now_ms();
        let mut record = request.log_record();
        record.status_code = Some(status_code);
        record.timing.total_ms = Some(now_ms - request.start_ms());
        record.emit();
    }
}

/// Drops the parameter that turns rewriting off, which the origin never
/// sees.
fn without_rewriting_switch(url: &str) -> String {
    let Some((base, query)) = url.split_once('?') else {
        return url.to_string();
    };
    let kept: Vec<&str> = query
        .split('&')
        .filter(|param| !param.eq_ignore_ascii_case(PAGESPEED_OFF))
        .collect();
    if kept.is_empty() {
        base.to_string()
    } else {
        format!("{base}?{}", kept.join("&"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy_fetch::CollectingWriter;
    use pretty_assertions::assert_eq;
    use swiftpage_core::{MockHasher, MockTimer, RewriteOptions};
    use swiftpage_http::{names, MockFetcher};

    fn proxy_with(fetcher: Arc<MockFetcher>, options: RewriteOptions) -> ProxyInterface {
        let server = ServerContext::builder(options)
            .fetcher(fetcher)
            .timer(Arc::new(MockTimer::default()))
            .hasher(Arc::new(MockHasher::new()))
            .build()
            .unwrap();
        ProxyInterface::new(server)
    }

    async fn get(proxy: &ProxyInterface, url: &str) -> CollectingWriter {
        let writer = CollectingWriter::new();
        proxy.fetch(url, RequestHeaders::new(), &mut writer.clone()).await;
        writer
    }

    #[test]
    fn rewriting_switch_is_removed() {
        assert_eq!(without_rewriting_switch("http://test.com/?PageSpeed=off"), "http://test.com/");
        assert_eq!(
            without_rewriting_switch("http://test.com/?a=1&PageSpeed=off&b=2"),
            "http://test.com/?a=1&b=2"
        );
        assert_eq!(without_rewriting_switch("http://test.com/a"), "http://test.com/a");
    }

    #[tokio::test]
    async fn blacklisted_urls_are_rejected() {
        let options = RewriteOptions {
            blacklist: vec!["*/admin/*".to_string()],
            reject_blacklisted: true,
            ..RewriteOptions::default()
        };
        let fetcher = Arc::new(MockFetcher::new());
        let proxy = proxy_with(fetcher.clone(), options);
        let writer = get(&proxy, "http://test.com/admin/index.html").await;
        assert_eq!(writer.response().status_code(), Some(403));
        assert_eq!(fetcher.fetch_count(), 0);
    }

    #[tokio::test]
    async fn html_is_rewritten() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.set_text("http://test.com/a.css", "text/css", 300, "a {  color: red; }");
        fetcher.set_text(
            "http://test.com/",
            "text/html",
            0,
            "<html><head><link rel=\"stylesheet\" href=\"a.css\"></head></html>",
        );
        let options = RewriteOptions {
            rewrite_deadline_ms: 5_000,
            ..RewriteOptions::default()
        };
        let proxy = proxy_with(fetcher, options);

        let response = get(&proxy, "http://test.com/").await.response();
        assert_eq!(response.status_code(), Some(200));
        assert!(response.text().contains("a.css.pagespeed.cf."), "{}", response.text());
    }

    #[tokio::test]
    async fn rewriting_switch_passes_html_through() {
        let fetcher = Arc::new(MockFetcher::new());
        let html = "<html><head><link rel=\"stylesheet\" href=\"a.css\"></head></html>";
        fetcher.set_text("http://test.com/a.css", "text/css", 300, "a {  color: red; }");
        fetcher.set_text("http://test.com/", "text/html", 0, html);
        let proxy = proxy_with(fetcher.clone(), RewriteOptions::default());

        let response = get(&proxy, "http://test.com/?PageSpeed=off").await.response();
        assert_eq!(response.text(), html);
        assert_eq!(fetcher.fetch_count_for("http://test.com/"), 1);
        assert_eq!(fetcher.fetch_count_for("http://test.com/a.css"), 0);
    }

    #[tokio::test]
    async fn resources_are_served_from_cache() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.set_text("http://test.com/file.txt", "text/plain", 300, "hello");
        let proxy = proxy_with(fetcher.clone(), RewriteOptions::default());

        assert_eq!(get(&proxy, "http://test.com/file.txt").await.response().text(), "hello");
        assert_eq!(get(&proxy, "http://test.com/file.txt").await.response().text(), "hello");
        assert_eq!(fetcher.fetch_count(), 1);
    }

    #[tokio::test]
    async fn in_place_rewrite_serves_optimized_copy_later() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.set_text("http://test.com/a.css", "text/css", 300, "a {  color: red; }");
        let options = RewriteOptions {
            in_place_rewriting_enabled: true,
            ..RewriteOptions::default()
        };
        let proxy = proxy_with(fetcher, options);

        let first = get(&proxy, "http://test.com/a.css").await.response();
        assert_eq!(first.text(), "a {  color: red; }");
        proxy.server().quiesce().await;

        let second = get(&proxy, "http://test.com/a.css").await.response();
        assert_eq!(second.text(), "a{color:red}");
        assert_eq!(
            second.headers.unwrap().get(names::CACHE_CONTROL),
            Some("max-age=300")
        );
    }
}
