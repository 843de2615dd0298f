//! Fetchers for tests: canned responses, held fetches and counting.

use crate::fetcher::{FetchSink, UrlAsyncFetcher};
use crate::headers::{names, RequestHeaders, ResponseHeaders};
use crate::value::HttpValue;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::watch;

#[derive(Debug, Clone)]
enum MockResponse {
    Ok(HttpValue),
    Fail,
}

/// Serves canned responses. Unknown URLs fail.
///
/// Conditional requests whose validators match the canned response get a
/// `304` without a body.
#[derive(Debug, Default)]
pub struct MockFetcher {
    responses: RwLock<HashMap<String, MockResponse>>,
    requests: Mutex<Vec<(String, RequestHeaders)>>,
    fetch_count: AtomicU64,
}

impl MockFetcher {
    /// Creates a fetcher with no responses.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the response for `url`.
    pub fn set_response(&self, url: &str, headers: ResponseHeaders, body: impl Into<Bytes>) {
        self.responses
            .write()
            .insert(url.to_string(), MockResponse::Ok(HttpValue::new(headers, body)));
    }

    /// Sets a `200` response with a content type and `max-age`.
    pub fn set_text(&self, url: &str, content_type: &str, max_age_secs: i64, body: &str) {
        let mut headers = ResponseHeaders::ok(content_type);
        headers.add(names::CACHE_CONTROL, format!("max-age={max_age_secs}"));
        self.set_response(url, headers, body.to_string());
    }

    /// Makes fetches of `url` fail.
    pub fn set_failure(&self, url: &str) {
        self.responses
            .write()
            .insert(url.to_string(), MockResponse::Fail);
    }

    /// Number of fetches so far.
    pub fn fetch_count(&self) -> u64 {
        self.fetch_count.load(Ordering::SeqCst)
    }

    /// Number of fetches of `url` so far.
    pub fn fetch_count_for(&self, url: &str) -> usize {
        self.requests.lock().iter().filter(|(u, _)| u == url).count()
    }

    /// Request headers of the most recent fetch of `url`.
    pub fn last_request_headers(&self, url: &str) -> Option<RequestHeaders> {
        self.requests
            .lock()
            .iter()
            .rev()
            .find(|(u, _)| u == url)
            .map(|(_, h)| h.clone())
    }
}

#[async_trait]
impl UrlAsyncFetcher for MockFetcher {
    async fn fetch(&self, url: &str, request: &RequestHeaders, sink: &mut dyn FetchSink) -> bool {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push((url.to_string(), request.clone()));

        let response = self.responses.read().get(url).cloned();
        let Some(MockResponse::Ok(value)) = response else {
            tracing::debug!(url, "mock fetch failed");
            sink.on_done(false);
            return false;
        };

        if request.is_not_modified(&value.headers) {
            let mut not_modified = value.headers.clone();
            not_modified.set_status_code(304);
            not_modified.remove(names::CONTENT_LENGTH);
            sink.on_headers(&not_modified);
        } else {
            sink.on_headers(&value.headers);
            if !value.body.is_empty() {
                sink.on_body_chunk(&value.body);
            }
        }
        sink.on_done(true);
        true
    }
}

/// Holds fetches until released.
///
/// Starts paused. [`WaitFetcher::release`] lets every held and future
/// fetch through until [`WaitFetcher::pause`] is called again.
pub struct WaitFetcher<F> {
    inner: F,
    paused: watch::Sender<bool>,
    pass_through: RwLock<HashSet<String>>,
}

impl<F: UrlAsyncFetcher> WaitFetcher<F> {
    /// Wraps `inner`, paused.
    pub fn new(inner: F) -> Self {
        let (paused, _) = watch::channel(true);
        Self {
            inner,
            paused,
            pass_through: RwLock::new(HashSet::new()),
        }
    }

    /// Holds future fetches.
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    /// Lets held and future fetches through.
    pub fn release(&self) {
        self.paused.send_replace(false);
    }

    /// Never holds fetches of `url`.
    pub fn do_not_delay(&self, url: &str) {
        self.pass_through.write().insert(url.to_string());
    }

    /// The wrapped fetcher.
    pub fn inner(&self) -> &F {
        &self.inner
    }
}

#[async_trait]
impl<F: UrlAsyncFetcher> UrlAsyncFetcher for WaitFetcher<F> {
    async fn fetch(&self, url: &str, request: &RequestHeaders, sink: &mut dyn FetchSink) -> bool {
        let delay = !self.pass_through.read().contains(url);
        if delay {
            let mut rx = self.paused.subscribe();
            // The sender lives as long as self.
            let _ = rx.wait_for(|paused| !*paused).await;
        }
        self.inner.fetch(url, request, sink).await
    }
}

/// Counts fetches and body bytes.
#[derive(Debug)]
pub struct CountingFetcher<F> {
    inner: F,
    fetches: AtomicU64,
    bytes: AtomicU64,
}

struct CountingSink<'a> {
    inner: &'a mut dyn FetchSink,
    bytes: &'a AtomicU64,
}

impl FetchSink for CountingSink<'_> {
    fn on_headers(&mut self, headers: &ResponseHeaders) {
        self.inner.on_headers(headers);
    }

    fn on_body_chunk(&mut self, chunk: &[u8]) {
        self.bytes.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        self.inner.on_body_chunk(chunk);
    }

    fn on_flush(&mut self) {
        self.inner.on_flush();
    }

    fn on_done(&mut self, success: bool) {
        self.inner.on_done(success);
    }
}

impl<F: UrlAsyncFetcher> CountingFetcher<F> {
    /// Wraps `inner`.
    pub fn new(inner: F) -> Self {
        Self {
            inner,
            fetches: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    /// Number of fetches started.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Body bytes received.
    pub fn byte_count(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// The wrapped fetcher.
    pub fn inner(&self) -> &F {
        &self.inner
    }
}

#[async_trait]
impl<F: UrlAsyncFetcher> UrlAsyncFetcher for CountingFetcher<F> {
    async fn fetch(&self, url: &str, request: &RequestHeaders, sink: &mut dyn FetchSink) -> bool {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        let mut counting = CountingSink {
            inner: sink,
            bytes: &self.bytes,
        };
        self.inner.fetch(url, request, &mut counting).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::{fetch_value, BufferSink};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn mock_answers_conditional_requests() {
        let fetcher = MockFetcher::new();
        let mut headers = ResponseHeaders::ok("text/css");
        headers.add(names::LAST_MODIFIED, "Mon, 05 Apr 2010 18:51:26 GMT");
        fetcher.set_response("http://test.com/a.css", headers, "a{}");

        let request: RequestHeaders = [(names::IF_MODIFIED_SINCE, "Mon, 05 Apr 2010 18:51:26 GMT")]
            .into_iter()
            .collect();
        let value = fetch_value(&fetcher, "http://test.com/a.css", &request)
            .await
            .unwrap();
        assert_eq!(value.headers.status_code(), 304);
        assert!(value.body.is_empty());
        assert_eq!(fetcher.fetch_count_for("http://test.com/a.css"), 1);
        assert!(fetcher.last_request_headers("http://test.com/a.css").is_some());
    }

    #[tokio::test]
    async fn mock_failure() {
        let fetcher = MockFetcher::new();
        fetcher.set_failure("http://test.com/a.css");
        let mut sink = BufferSink::new();
        assert!(!fetcher.fetch("http://test.com/a.css", &RequestHeaders::new(), &mut sink).await);
        assert!(!sink.succeeded());
    }

    #[tokio::test]
    async fn wait_fetcher_holds_until_release() {
        let mock = MockFetcher::new();
        mock.set_text("http://test.com/a.css", "text/css", 300, "a{}");
        let fetcher = Arc::new(WaitFetcher::new(mock));

        let pending = {
            let fetcher = Arc::clone(&fetcher);
            tokio::spawn(async move {
                fetch_value(fetcher.as_ref(), "http://test.com/a.css", &RequestHeaders::new()).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        fetcher.release();
        assert!(pending.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn wait_fetcher_pass_through() {
        let mock = MockFetcher::new();
        mock.set_text("http://test.com/a.css", "text/css", 300, "a{}");
        let fetcher = WaitFetcher::new(mock);
        fetcher.do_not_delay("http://test.com/a.css");
        assert!(fetch_value(&fetcher, "http://test.com/a.css", &RequestHeaders::new())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn counting_fetcher_counts() {
        let mock = MockFetcher::new();
        mock.set_text("http://test.com/a.css", "text/css", 300, "abcd");
        let fetcher = CountingFetcher::new(mock);
        fetch_value(&fetcher, "http://test.com/a.css", &RequestHeaders::new())
            .await
            .unwrap();
        assert_eq!(fetcher.fetch_count(), 1);
        assert_eq!(fetcher.byte_count(), 4);
    }
}
