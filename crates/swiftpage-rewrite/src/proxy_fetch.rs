//! Streams an origin response to the client, rewriting HTML on the way.
//!
//! The origin fetch feeds a channel of [`FetchEvent`]s. A [`ProxyFetch`]
//! consumes them: headers go out once, HTML bodies go through a
//! [`RewriteDriver`], everything else passes through unchanged and is
//! stored in the HTTP cache when cacheable. While a document is being
//! rewritten, a quiet origin triggers an idle flush so the client is not
//! left waiting on buffered bytes.

use crate::collector::PropertyCallbackCollector;
use crate::driver::RewriteDriver;
use crate::server_context::ServerContext;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use swiftpage_cache::FallbackPropertyPage;
use swiftpage_core::TimestampMs;
use swiftpage_http::caching::set_cache_lifetime;
use swiftpage_http::{compute_caching, names, FetchEvent, RequestContextPtr, ResponseHeaders};
use tokio::sync::mpsc::UnboundedReceiver;
use url::Url;

/// Receives the response sent to the client.
pub trait ResponseWriter: Send {
    /// Status and headers.
    fn headers_complete(&mut self, headers: &ResponseHeaders);

    /// A piece of the body.
    fn write(&mut self, bytes: &[u8]);

    /// Pushes buffered bytes to the client.
    fn flush(&mut self);

    /// The response ended.
    fn done(&mut self, success: bool);
}

/// What a [`CollectingWriter`] received.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectedResponse {
    /// Headers, if sent.
    pub headers: Option<ResponseHeaders>,
    /// The body.
    pub body: Vec<u8>,
    /// Number of flushes.
    pub flushes: usize,
    /// The value passed to `done`.
    pub success: Option<bool>,
}

impl CollectedResponse {
    /// The body as text.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// The status code, if headers were sent.
    pub fn status_code(&self) -> Option<u16> {
        self.headers.as_ref().map(ResponseHeaders::status_code)
    }
}

/// A writer that keeps the response in memory. Clones share the same
/// response.
#[derive(Debug, Clone, Default)]
pub struct CollectingWriter {
    inner: Arc<Mutex<CollectedResponse>>,
}

impl CollectingWriter {
    /// Creates an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of what was received so far.
    pub fn response(&self) -> CollectedResponse {
        self.inner.lock().clone()
    }

    /// Whether `done` was called.
    pub fn is_done(&self) -> bool {
        self.inner.lock().success.is_some()
    }
}

impl ResponseWriter for CollectingWriter {
    fn headers_complete(&mut self, headers: &ResponseHeaders) {
        self.inner.lock().headers = Some(headers.clone());
    }

    fn write(&mut self, bytes: &[u8]) {
        self.inner.lock().body.extend_from_slice(bytes);
    }

    fn flush(&mut self) {
        self.inner.lock().flushes += 1;
    }

    fn done(&mut self, success: bool) {
        self.inner.lock().success = Some(success);
    }
}

/// Sends headers at most once and drops everything after `done`.
struct GuardedWriter<'a> {
    inner: &'a mut dyn ResponseWriter,
    headers_sent: bool,
    done: bool,
}

impl<'a> GuardedWriter<'a> {
    fn new(inner: &'a mut dyn ResponseWriter) -> Self {
        Self {
            inner,
            headers_sent: false,
            done: false,
        }
    }
}

impl ResponseWriter for GuardedWriter<'_> {
    fn headers_complete(&mut self, headers: &ResponseHeaders) {
        if self.headers_sent || self.done {
            tracing::debug!("ignoring repeated response headers");
            return;
        }
        self.headers_sent = true;
        self.inner.headers_complete(headers);
    }

    fn write(&mut self, bytes: &[u8]) {
        if !self.done && !bytes.is_empty() {
            self.inner.write(bytes);
        }
    }

    fn flush(&mut self) {
        if !self.done {
            self.inner.flush();
        }
    }

    fn done(&mut self, success: bool) {
        if !self.done {
            self.done = true;
            self.inner.done(success);
        }
    }
}

/// Adjusts the headers of an HTML response that will be rewritten: the
/// body changes, so length and validators go, and the TTL is capped at
/// `max_html_cache_time_ms`.
pub fn apply_html_header_policy(
    headers: &mut ResponseHeaders,
    max_html_cache_time_ms: i64,
    now_ms: TimestampMs,
) {
    headers.remove(names::CONTENT_LENGTH);
    headers.remove(names::ETAG);
    headers.remove(names::LAST_MODIFIED);
    let info = compute_caching(headers, 0, now_ms);
    if info.ttl_ms > max_html_cache_time_ms || !headers.contains(names::CACHE_CONTROL) {
        let ttl_ms = info.ttl_ms.min(max_html_cache_time_ms);
        set_cache_lifetime(headers, now_ms, ttl_ms, info.cache_control.private);
    }
}

enum Body {
    /// Headers have not arrived.
    Waiting,
    Rewriting(Box<RewriteDriver>),
    Passing {
        status_code: u16,
        /// The response as stored in the HTTP cache, while it may still
        /// fit.
        cached: Option<(ResponseHeaders, BytesMut)>,
    },
}

/// Consumes one origin response on behalf of one request.
pub struct ProxyFetch {
    server: Arc<ServerContext>,
    request: RequestContextPtr,
    collector: Option<Arc<PropertyCallbackCollector>>,
    rewrite_html: bool,
}

impl ProxyFetch {
    /// Creates a proxy fetch. Without a collector, rewriting starts with
    /// an empty property page.
    pub fn new(
        server: Arc<ServerContext>,
        request: RequestContextPtr,
        collector: Option<Arc<PropertyCallbackCollector>>,
    ) -> Self {
        Self {
            server,
            request,
            collector,
            rewrite_html: true,
        }
    }

    /// Passes HTML through without rewriting.
    pub fn without_rewriting(mut self) -> Self {
        self.rewrite_html = false;
        self
    }

    /// Streams the events of one fetch into `writer`. Returns whether the
    /// response completed.
    pub async fn run(
        self,
        mut events: UnboundedReceiver<FetchEvent>,
        writer: &mut dyn ResponseWriter,
    ) -> bool {
        let mut out = GuardedWriter::new(writer);
        let idle = match self.server.options().idle_flush_time_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        let mut body = Body::Waiting;
        let mut unflushed = false;

        loop {
            let event = match (&mut body, idle) {
                (Body::Rewriting(driver), Some(idle)) if unflushed => {
                    tokio::select! {
                        event = events.recv() => event,
                        () = tokio::time::sleep(idle) => {
                            tracing::debug!(url = %self.request.url(), "idle flush");
                            driver.flush(&mut out).await;
                            unflushed = false;
                            continue;
                        }
                    }
                }
                _ => events.recv().await,
            };
            if self.request.is_canceled() {
                self.abort(body, &mut out).await;
                return false;
            }

            match event {
                Some(FetchEvent::Headers(headers)) => {
                    if matches!(body, Body::Waiting) {
                        body = self.headers_complete(headers, &mut out).await;
                    }
                }
                Some(FetchEvent::Chunk(chunk)) => match &mut body {
                    Body::Waiting => {
                        tracing::warn!(url = %self.request.url(), "body bytes before headers");
                    }
                    Body::Rewriting(driver) => {
                        driver.parse_chunk(&chunk);
                        unflushed = true;
                        // Bytes past a bail-out are not rewritten, so nothing is
                        // gained by holding them back.
                        if driver.is_passing_through() || driver.should_flush() {
                            driver.flush(&mut out).await;
                            unflushed = false;
                        }
                    }
                    Body::Passing { cached, .. } => {
                        out.write(&chunk);
                        self.buffer_for_cache(cached, &chunk);
                    }
                },
                Some(FetchEvent::Flush) => match &mut body {
                    Body::Rewriting(driver) => {
                        driver.flush(&mut out).await;
                        unflushed = false;
                    }
                    Body::Passing { .. } => out.flush(),
                    Body::Waiting => {}
                },
                Some(FetchEvent::Done(success)) => return self.done(body, success, &mut out).await,
                None => return self.done(body, false, &mut out).await,
            }
        }
    }

    async fn headers_complete(
        &self,
        mut headers: ResponseHeaders,
        out: &mut GuardedWriter<'_>,
    ) -> Body {
        let url = self.request.url();
        if self.server.domain_lawyer().is_proxy_mapped(url) && headers.strip_cookies() {
            tracing::debug!(url, "stripped cookies from proxied response");
        }
        let status_code = headers.status_code();
        let base_url = (self.rewrite_html && status_code == 200 && headers.is_html())
            .then(|| Url::parse(url).ok())
            .flatten();

        let Some(base_url) = base_url else {
            if let Some(collector) = &self.collector {
                collector.detach(status_code);
            }
            out.headers_complete(&headers);
            let cached = (status_code == 200 && !headers.is_html())
                .then(|| (headers.clone(), BytesMut::new()));
            return Body::Passing {
                status_code,
                cached,
            };
        };

        let options = self.server.options();
        apply_html_header_policy(
            &mut headers,
            options.max_html_cache_time_ms,
            self.server.timer().now_ms(),
        );
        out.headers_complete(&headers);

        let page = match &self.collector {
            Some(collector) => collector
                .connect_proxy_fetch()
                .await
                .unwrap_or_else(|_| FallbackPropertyPage::empty(url)),
            None => FallbackPropertyPage::empty(url),
        };
        let mut driver = RewriteDriver::new(
            Arc::clone(&self.server),
            Arc::clone(&self.request),
            base_url,
            page,
        );
        driver.set_status_code(status_code);
        Body::Rewriting(Box::new(driver))
    }

    fn buffer_for_cache(&self, cached: &mut Option<(ResponseHeaders, BytesMut)>, chunk: &[u8]) {
        let Some((_, buffer)) = cached else {
            return;
        };
        buffer.extend_from_slice(chunk);
        if !self.server.options().is_cacheable_body_size(buffer.len()) {
            tracing::debug!(url = %self.request.url(), "response too large to cache");
            *cached = None;
        }
    }

    async fn done(self, body: Body, success: bool, out: &mut GuardedWriter<'_>) -> bool {
        match body {
            Body::Waiting => {
                tracing::info!(url = %self.request.url(), success, "origin sent no response");
                if let Some(collector) = &self.collector {
                    collector.detach(502);
                }
                out.headers_complete(&ResponseHeaders::new(502));
                self.emit_log_record(502);
                out.done(false);
                false
            }
            Body::Rewriting(mut driver) => {
                driver.finish(out).await;
                out.done(success);
                success
            }
            Body::Passing {
                status_code,
                cached,
            } => {
                out.flush();
                if let (true, Some((headers, buffer))) = (success, cached) {
                    let url = self.request.url();
                    let stored = self
                        .server
                        .http_cache()
                        .put(url, Some(self.request.request_headers()), &headers, buffer.freeze())
                        .await;
                    tracing::debug!(url, stored, "proxied response complete");
                }
                self.emit_log_record(status_code);
                out.done(success);
                success
            }
        }
    }

    /// Emits whatever is buffered and stops.
    async fn abort(self, body: Body, out: &mut GuardedWriter<'_>) {
        tracing::info!(url = %self.request.url(), "request canceled, stopping response");
        let status_code = match body {
            Body::Waiting => {
                if let Some(collector) = &self.collector {
                    collector.detach(502);
                }
                502
            }
            Body::Rewriting(mut driver) => {
                driver.flush(out).await;
                200
            }
            Body::Passing { status_code, .. } => {
                out.flush();
                status_code
            }
        };
        self.emit_log_record(status_code);
        out.done(false);
    }

    fn emit_log_record(&self, status_code: u16) {
        let now_ms = self.server.timer().now_ms();
        let mut record = self.request.log_record();
        record.status_code = Some(status_code);
        record.timing.total_ms = Some(now_ms - self.request.start_ms());
        record.emit();
    }
}
