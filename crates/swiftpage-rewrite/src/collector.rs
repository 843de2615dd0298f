//! Joins property-cache lookups with the fetch they race against.
//!
//! A request starts its property-cache lookups and the origin fetch at the
//! same time. The collector counts outstanding lookups (plus one for the
//! request headers) and, once all are done, hands the assembled page to
//! the proxy fetch. The proxy fetch may connect before or after that
//! moment; whichever happens second delivers the page. A detached
//! collector (the fetch failed or was not HTML) drops the page, but tasks
//! queued to run after the lookup still see one.

use crate::server_context::ServerContext;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use swiftpage_cache::FallbackPropertyPage;
use swiftpage_http::RequestContextPtr;
use tokio::sync::oneshot;

/// Work that needs the property page once it is read.
pub type PostLookupTask = Box<dyn FnOnce(&FallbackPropertyPage) + Send>;

struct State {
    pending: usize,
    headers_complete: bool,
    page: Option<FallbackPropertyPage>,
    sink: Option<oneshot::Sender<FallbackPropertyPage>>,
    tasks: Vec<PostLookupTask>,
    finished: bool,
    detached_status: Option<u16>,
}

/// Collects property-cache lookups for one request.
pub struct PropertyCallbackCollector {
    url: String,
    state: Mutex<State>,
}

impl fmt::Debug for PropertyCallbackCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("PropertyCallbackCollector")
            .field("url", &self.url)
            .field("pending", &state.pending)
            .field("finished", &state.finished)
            .finish()
    }
}

/// One outstanding lookup. Dropping it without calling
/// [`PropertyCallback::done`] counts as a lookup that found nothing.
pub struct PropertyCallback {
    collector: Arc<PropertyCallbackCollector>,
    done: bool,
}

impl PropertyCallback {
    /// Reports the lookup's result.
    pub fn done(mut self, page: FallbackPropertyPage) {
        self.done = true;
        self.collector.lookup_done(Some(page));
    }
}

impl Drop for PropertyCallback {
    fn drop(&mut self) {
        if !self.done {
            self.collector.lookup_done(None);
        }
    }
}

impl PropertyCallbackCollector {
    /// Creates a collector for the page at `url`.
    pub fn new(url: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            url: url.into(),
            state: Mutex::new(State {
                pending: 0,
                headers_complete: false,
                page: None,
                sink: None,
                tasks: Vec::new(),
                finished: false,
                detached_status: None,
            }),
        })
    }

    /// Creates a collector and starts the page's lookup in the background.
    pub fn start(server: &Arc<ServerContext>, request: &RequestContextPtr) -> Arc<Self> {
        let collector = Self::new(request.url());
        let callback = collector.add_callback();
        let server_for_lookup = Arc::clone(server);
        let request = Arc::clone(request);
        server.tasks().spawn(async move {
            let server = server_for_lookup;
            let start_ms = server.timer().now_ms();
            let page = server
                .property_cache()
                .read_with_fallback(
                    request.url(),
                    server.options_signature(),
                    request.device_class(),
                    server.options().use_fallback_property_cache_values,
                )
                .await;
            let elapsed = server.timer().now_ms() - start_ms;
            request.log_record().timing.property_cache_ms = Some(elapsed);
            callback.done(page);
        });
        collector.request_headers_complete();
        collector
    }

    /// Registers a lookup.
    pub fn add_callback(self: &Arc<Self>) -> PropertyCallback {
        self.state.lock().pending += 1;
        PropertyCallback {
            collector: Arc::clone(self),
            done: false,
        }
    }

    /// Signals that the request headers are known. Completion waits for
    /// this as well as for every lookup.
    pub fn request_headers_complete(&self) {
        let mut state = self.state.lock();
        if state.headers_complete {
            return;
        }
        state.headers_complete = true;
        self.maybe_complete(&mut state);
    }

    /// Runs `task` with the page once every lookup is done, or right away
    /// if they already are.
    pub fn add_post_lookup_task(&self, task: PostLookupTask) {
        let mut state = self.state.lock();
        if state.finished || (state.pending == 0 && state.headers_complete) {
            let page = self.page_or_empty(&state);
            drop(state);
            task(&page);
            return;
        }
        state.tasks.push(task);
    }

    /// Returns a receiver for the page. A receiver whose sender is dropped
    /// means the collector was detached.
    pub fn connect_proxy_fetch(&self) -> oneshot::Receiver<FallbackPropertyPage> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock();
        if state.detached_status.is_some() {
            return rx;
        }
        match state.page.take() {
            Some(page) if state.finished => {
                let _ = tx.send(page);
            }
            page => {
                state.page = page;
                state.sink = Some(tx);
            }
        }
        rx
    }

    /// Gives up on delivering the page, for a response with `status_code`
    /// that will not be rewritten.
    pub fn detach(&self, status_code: u16) {
        let mut state = self.state.lock();
        if state.detached_status.is_some() {
            return;
        }
        state.detached_status = Some(status_code);
        state.sink = None;
        tracing::debug!(url = %self.url, status_code, "property collector detached");
        if !state.finished {
            state.finished = true;
            let tasks = std::mem::take(&mut state.tasks);
            let page = self.page_or_empty(&state);
            drop(state);
            for task in tasks {
                task(&page);
            }
        }
    }

    /// Whether every lookup has finished or the collector was detached.
    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    fn page_or_empty(&self, state: &State) -> FallbackPropertyPage {
        state
            .page
            .clone()
            .unwrap_or_else(|| FallbackPropertyPage::empty(&self.url))
    }

    fn lookup_done(&self, page: Option<FallbackPropertyPage>) {
        let mut state = self.state.lock();
        state.pending = state.pending.saturating_sub(1);
        if state.finished {
            return;
        }
        if let Some(page) = page {
            state.page = Some(page);
        }
        self.maybe_complete(&mut state);
    }

    fn maybe_complete(&self, state: &mut parking_lot::MutexGuard<'_, State>) {
        if state.finished || state.pending > 0 || !state.headers_complete {
            return;
        }
        state.finished = true;
        let page = self.page_or_empty(state);
        for task in std::mem::take(&mut state.tasks) {
            task(&page);
        }
        match state.sink.take() {
            Some(sink) => {
                let _ = sink.send(page);
            }
            None => state.page = Some(page),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use swiftpage_cache::PropertyPage;

    fn page(url: &str) -> FallbackPropertyPage {
        let mut actual = PropertyPage::new(url, url);
        actual.update("dom", "num_elements", "7", 1);
        FallbackPropertyPage::new(actual, None, false)
    }

    #[tokio::test]
    async fn connect_after_lookup_gets_page() {
        let collector = PropertyCallbackCollector::new("http://test.com/");
        let callback = collector.add_callback();
        collector.request_headers_complete();
        callback.done(page("http://test.com/"));
        assert!(collector.is_finished());

        let received = collector.connect_proxy_fetch().await.unwrap();
        assert_eq!(received.get("dom", "num_elements").unwrap().value(), "7");
    }

    #[tokio::test]
    async fn connect_before_lookup_waits_for_it() {
        let collector = PropertyCallbackCollector::new("http://test.com/");
        let callback = collector.add_callback();
        collector.request_headers_complete();
        let rx = collector.connect_proxy_fetch();
        let handle = tokio::spawn(async move { rx.await });
        callback.done(page("http://test.com/"));
        let received = handle.await.unwrap().unwrap();
        assert!(received.get("dom", "num_elements").is_some());
    }

    #[tokio::test]
    async fn completion_waits_for_request_headers() {
        let collector = PropertyCallbackCollector::new("http://test.com/");
        collector.add_callback().done(page("http://test.com/"));
        assert!(!collector.is_finished());
        collector.request_headers_complete();
        assert!(collector.is_finished());
    }

    #[tokio::test]
    async fn dropped_callback_yields_empty_page() {
        let collector = PropertyCallbackCollector::new("http://test.com/");
        drop(collector.add_callback());
        collector.request_headers_complete();
        let received = collector.connect_proxy_fetch().await.unwrap();
        assert!(received.get("dom", "num_elements").is_none());
        assert_eq!(received.actual().url(), "http://test.com/");
    }

    #[test]
    fn post_lookup_tasks_run_once_with_a_page() {
        let runs = Arc::new(AtomicUsize::new(0));
        let collector = PropertyCallbackCollector::new("http://test.com/");
        let callback = collector.add_callback();
        collector.request_headers_complete();

        let counter = Arc::clone(&runs);
        collector.add_post_lookup_task(Box::new(move |page| {
            assert_eq!(page.actual().url(), "http://test.com/");
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        // Detaching first still runs queued tasks against an empty page.
        collector.detach(404);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        callback.done(page("http://test.com/"));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let counter = Arc::clone(&runs);
        collector.add_post_lookup_task(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn detached_collector_drops_the_sink() {
        let collector = PropertyCallbackCollector::new("http://test.com/");
        let callback = collector.add_callback();
        collector.request_headers_complete();
        let rx = collector.connect_proxy_fetch();
        collector.detach(500);
        assert!(rx.await.is_err());
        callback.done(page("http://test.com/"));
        assert!(collector.connect_proxy_fetch().await.is_err());
    }
}
