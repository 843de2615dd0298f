//! Asynchronous URL fetching.
//!
//! A fetcher streams a response into a [`FetchSink`]: headers once, any
//! number of body chunks, then `on_done`. Sinks are plain synchronous
//! callbacks; consumers that need to await between chunks use a
//! [`ChannelSink`] and read [`FetchEvent`]s from the other end.

use crate::error::{HttpError, Result};
use crate::headers::{RequestHeaders, ResponseHeaders};
use crate::request_context::RequestContext;
use crate::value::HttpValue;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use swiftpage_core::Timer;
use tokio::sync::mpsc;

/// Receives a streamed response.
pub trait FetchSink: Send {
    /// Called once with the status and headers.
    fn on_headers(&mut self, headers: &ResponseHeaders);

    /// Called for every body chunk.
    fn on_body_chunk(&mut self, chunk: &[u8]);

    /// Called when the origin flushed.
    fn on_flush(&mut self) {}

    /// Called once at the end. `success` is false when the fetch failed
    /// before a complete response arrived.
    fn on_done(&mut self, success: bool);
}

/// Fetches URLs.
#[async_trait]
pub trait UrlAsyncFetcher: Send + Sync {
    /// Fetches `url`, streaming the response into `sink`. Returns the
    /// value passed to `on_done`.
    async fn fetch(&self, url: &str, request: &RequestHeaders, sink: &mut dyn FetchSink) -> bool;
}

#[async_trait]
impl<T: UrlAsyncFetcher + ?Sized> UrlAsyncFetcher for Arc<T> {
    async fn fetch(&self, url: &str, request: &RequestHeaders, sink: &mut dyn FetchSink) -> bool {
        (**self).fetch(url, request, sink).await
    }
}

/// Collects a whole response in memory.
#[derive(Debug, Default)]
pub struct BufferSink {
    headers: Option<ResponseHeaders>,
    body: BytesMut,
    success: Option<bool>,
}

impl BufferSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the fetch completed successfully.
    pub fn succeeded(&self) -> bool {
        self.success == Some(true) && self.headers.is_some()
    }

    /// The collected response, if the fetch succeeded.
    pub fn into_value(self) -> Option<HttpValue> {
        if self.success != Some(true) {
            return None;
        }
        self.headers
            .map(|headers| HttpValue::new(headers, self.body.freeze()))
    }
}

impl FetchSink for BufferSink {
    fn on_headers(&mut self, headers: &ResponseHeaders) {
        self.headers = Some(headers.clone());
    }

    fn on_body_chunk(&mut self, chunk: &[u8]) {
        self.body.extend_from_slice(chunk);
    }

    fn on_done(&mut self, success: bool) {
        self.success = Some(success);
    }
}

/// One step of a streamed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchEvent {
    /// Status and headers.
    Headers(ResponseHeaders),
    /// A body chunk.
    Chunk(Bytes),
    /// The origin flushed.
    Flush,
    /// The response ended.
    Done(bool),
}

/// Forwards sink callbacks into a channel.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<FetchEvent>,
}

impl ChannelSink {
    /// Creates a sink and the receiver of its events.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<FetchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: FetchEvent) {
        // The consumer may have stopped listening after an abort.
        let _ = self.tx.send(event);
    }
}

impl FetchSink for ChannelSink {
    fn on_headers(&mut self, headers: &ResponseHeaders) {
        self.send(FetchEvent::Headers(headers.clone()));
    }

    fn on_body_chunk(&mut self, chunk: &[u8]) {
        self.send(FetchEvent::Chunk(Bytes::copy_from_slice(chunk)));
    }

    fn on_flush(&mut self) {
        self.send(FetchEvent::Flush);
    }

    fn on_done(&mut self, success: bool) {
        self.send(FetchEvent::Done(success));
    }
}

/// Records header and total latency on the request's log record.
struct TimingSink<'a> {
    inner: &'a mut dyn FetchSink,
    ctx: &'a RequestContext,
    timer: &'a dyn Timer,
    start_ms: i64,
    saw_headers: bool,
}

impl FetchSink for TimingSink<'_> {
    fn on_headers(&mut self, headers: &ResponseHeaders) {
        if !self.saw_headers {
            self.saw_headers = true;
            let elapsed = self.timer.now_ms() - self.start_ms;
            let mut record = self.ctx.log_record();
            record.timing.header_fetch_ms.get_or_insert(elapsed);
        }
        self.inner.on_headers(headers);
    }

    fn on_body_chunk(&mut self, chunk: &[u8]) {
        self.inner.on_body_chunk(chunk);
    }

    fn on_flush(&mut self) {
        self.inner.on_flush();
    }

    fn on_done(&mut self, success: bool) {
        let elapsed = self.timer.now_ms() - self.start_ms;
        self.ctx.log_record().timing.fetch_ms.get_or_insert(elapsed);
        self.inner.on_done(success);
    }
}

/// Fetches `url` on behalf of a request, recording latency and whether the
/// fetch ran in the background on the request's log record.
pub async fn fetch_recorded(
    fetcher: &dyn UrlAsyncFetcher,
    timer: &dyn Timer,
    ctx: &RequestContext,
    url: &str,
    background: bool,
    sink: &mut dyn FetchSink,
) -> bool {
    if background {
        ctx.log_record().was_background_fetch = true;
    }
    let mut timing = TimingSink {
        inner: sink,
        ctx,
        timer,
        start_ms: timer.now_ms(),
        saw_headers: false,
    };
    let success = fetcher.fetch(url, ctx.request_headers(), &mut timing).await;
    tracing::debug!(url, background, success, "fetch complete");
    success
}

/// Fetches a whole response into memory.
pub async fn fetch_value(
    fetcher: &dyn UrlAsyncFetcher,
    url: &str,
    request: &RequestHeaders,
) -> Result<HttpValue> {
    let mut sink = BufferSink::new();
    fetcher.fetch(url, request, &mut sink).await;
    sink.into_value()
        .ok_or_else(|| HttpError::fetch(url, "no complete response"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockFetcher;
    use crate::request_context::RequestContext;
    use swiftpage_core::{DeviceClass, MockTimer};

    #[tokio::test]
    async fn buffer_sink_collects_response() {
        let fetcher = MockFetcher::new();
        fetcher.set_response("http://test.com/a.css", ResponseHeaders::ok("text/css"), "a{}");
        let value = fetch_value(&fetcher, "http://test.com/a.css", &RequestHeaders::new())
            .await
            .unwrap();
        assert_eq!(value.body, Bytes::from("a{}"));
        assert!(fetch_value(&fetcher, "http://test.com/missing.css", &RequestHeaders::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn channel_sink_streams_events() {
        let fetcher = MockFetcher::new();
        fetcher.set_response("http://test.com/", ResponseHeaders::ok("text/html"), "<p>");
        let (mut sink, mut rx) = ChannelSink::channel();
        assert!(fetcher.fetch("http://test.com/", &RequestHeaders::new(), &mut sink).await);

        assert!(matches!(rx.recv().await, Some(FetchEvent::Headers(_))));
        assert_eq!(rx.recv().await, Some(FetchEvent::Chunk(Bytes::from("<p>"))));
        assert_eq!(rx.recv().await, Some(FetchEvent::Done(true)));
    }

    #[tokio::test]
    async fn recorded_fetch_tags_background_and_latency() {
        let fetcher = MockFetcher::new();
        fetcher.set_response("http://test.com/a.css", ResponseHeaders::ok("text/css"), "a{}");
        let timer = MockTimer::default();
        let ctx = RequestContext::new(
            "http://test.com/",
            RequestHeaders::new(),
            DeviceClass::Desktop,
            timer.now_ms(),
        );
        let mut sink = BufferSink::new();
        assert!(fetch_recorded(&fetcher, &timer, &ctx, "http://test.com/a.css", true, &mut sink).await);

        let record = ctx.log_record();
        assert!(record.was_background_fetch);
        assert_eq!(record.timing.header_fetch_ms, Some(0));
        assert_eq!(record.timing.fetch_ms, Some(0));
    }
}
