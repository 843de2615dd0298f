//! Rewrite contexts and the process-wide intern map.
//!
//! A rewrite context is one pending rewrite of a set of inputs by one
//! transformer. It runs as a task:
//!
//! ```text
//! pending -> input_fetch -> rewriting -> ok
//!                 |             |
//!                 +-> failed <--+
//! (any non-final state) -> canceled
//! ```
//!
//! Contexts are interned by partition key: a request for a rewrite that is
//! already running attaches to the running context and receives the same
//! outcome, so a transformer runs once however many pages reference the
//! same inputs at the same time.

use crate::metadata::{InputInfo, MetadataEntry, MetadataLookup};
use crate::resource::{LoadedResource, Resource};
use crate::server_context::ServerContext;
use crate::transformer::{TransformInput, TransformResult, Transformer, TransformerKind};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use swiftpage_core::{RewriteErrorKind, RewrittenUrl};
use swiftpage_http::caching::set_cache_lifetime;
use swiftpage_http::{names, HttpValue, RequestContextPtr, ResponseHeaders};

/// Lifecycle of a rewrite context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ContextState {
    /// Registered, looking at the metadata cache.
    Pending = 0,
    /// Loading inputs.
    InputFetch = 1,
    /// The transformer is queued or running.
    Rewriting = 2,
    /// Produced an output.
    Ok = 3,
    /// Failed; the original reference stays.
    Failed = 4,
    /// Abandoned before finishing; nothing was persisted.
    Canceled = 5,
}

impl ContextState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Pending,
            1 => Self::InputFetch,
            2 => Self::Rewriting,
            3 => Self::Ok,
            4 => Self::Failed,
            _ => Self::Canceled,
        }
    }

    /// Whether no further transition is possible.
    pub fn is_final(self) -> bool {
        matches!(self, Self::Ok | Self::Failed | Self::Canceled)
    }

    /// Lowercase name used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InputFetch => "input_fetch",
            Self::Rewriting => "rewriting",
            Self::Ok => "ok",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The observable state of a running context.
#[derive(Debug)]
pub struct ContextStatus {
    key: String,
    state: AtomicU8,
}

impl ContextStatus {
    fn new(key: String) -> Self {
        Self {
            key,
            state: AtomicU8::new(ContextState::Pending as u8),
        }
    }

    /// The partition key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The current state.
    pub fn state(&self) -> ContextState {
        ContextState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves to `to` if that is a forward transition. Final states are
    /// never left; `canceled` is reachable from any other state.
    fn advance(&self, to: ContextState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            let from = ContextState::from_u8(current);
            let allowed = !from.is_final()
                && (to == ContextState::Canceled || (to as u8) > (from as u8));
            if !allowed {
                return false;
            }
            match self.state.compare_exchange(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    tracing::debug!(key = %self.key, from = %from, to = %to, "context state");
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }
}

/// How a rewrite ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RewriteOutcome {
    /// The inputs are available under `url`.
    Rewritten {
        /// The rewritten URL.
        url: String,
        /// The output, when it was computed by this context rather than
        /// remembered.
        output: Option<HttpValue>,
        /// Whether the output may be cached; false when an input was not.
        cacheable: bool,
    },
    /// The rewrite failed.
    Failed(RewriteErrorKind),
    /// The rewrite was abandoned.
    Canceled(RewriteErrorKind),
}

impl RewriteOutcome {
    /// The rewritten URL, if any.
    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Rewritten { url, .. } => Some(url),
            _ => None,
        }
    }

    /// Why no URL was produced.
    pub fn error(&self) -> Option<RewriteErrorKind> {
        match self {
            Self::Rewritten { .. } => None,
            Self::Failed(kind) | Self::Canceled(kind) => Some(*kind),
        }
    }

    fn final_state(&self) -> ContextState {
        match self {
            Self::Rewritten { .. } => ContextState::Ok,
            Self::Failed(_) => ContextState::Failed,
            Self::Canceled(_) => ContextState::Canceled,
        }
    }
}

/// A shared, cloneable future of a context's outcome.
pub type SharedOutcome = Shared<BoxFuture<'static, RewriteOutcome>>;

/// What to rewrite.
#[derive(Debug, Clone)]
pub struct RewriteSpec {
    /// Id of the transformer.
    pub filter_id: String,
    /// Absolute input URLs, in order.
    pub input_urls: Vec<String>,
    /// The request on whose behalf the rewrite runs.
    pub request: RequestContextPtr,
    /// Run the transformer on the low-priority pool.
    pub background: bool,
    /// Rewrite inputs that may not be cached. Outputs of such inputs are
    /// returned but never stored.
    pub allow_uncacheable: bool,
}

impl RewriteSpec {
    /// A foreground rewrite of cacheable inputs.
    pub fn new(filter_id: &str, input_urls: Vec<String>, request: RequestContextPtr) -> Self {
        Self {
            filter_id: filter_id.to_string(),
            input_urls,
            request,
            background: false,
            allow_uncacheable: false,
        }
    }
}

/// A caller's view of a context.
#[derive(Clone)]
pub struct RewriteHandle {
    outcome: SharedOutcome,
    status: Arc<ContextStatus>,
    attached: bool,
}

impl fmt::Debug for RewriteHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RewriteHandle")
            .field("key", &self.status.key())
            .field("state", &self.status.state())
            .field("attached", &self.attached)
            .finish()
    }
}

impl RewriteHandle {
    pub(crate) fn ready(key: String, outcome: RewriteOutcome) -> Self {
        let status = ContextStatus::new(key);
        status.advance(outcome.final_state());
        Self {
            outcome: futures::future::ready(outcome).boxed().shared(),
            status: Arc::new(status),
            attached: false,
        }
    }

    /// Waits for the outcome.
    pub async fn outcome(&self) -> RewriteOutcome {
        self.outcome.clone().await
    }

    /// The outcome future, for waiting with a deadline.
    pub fn shared(&self) -> SharedOutcome {
        self.outcome.clone()
    }

    /// The outcome if the context already finished.
    pub fn peek(&self) -> Option<RewriteOutcome> {
        self.outcome.peek().cloned()
    }

    /// The context's state.
    pub fn state(&self) -> ContextState {
        self.status.state()
    }

    /// The partition key.
    pub fn key(&self) -> &str {
        self.status.key()
    }

    /// Whether this handle attached to a context started by someone else.
    pub fn is_attached(&self) -> bool {
        self.attached
    }
}

/// Intern map statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InternStats {
    /// Contexts started.
    pub started: u64,
    /// Requests that attached to a running context.
    pub attached: u64,
    /// Contexts currently running.
    pub in_flight: usize,
}

struct InFlight {
    id: u64,
    outcome: SharedOutcome,
    status: Arc<ContextStatus>,
}

/// Running contexts by partition key.
#[derive(Default)]
pub struct InternMap {
    in_flight: DashMap<String, InFlight>,
    next_id: AtomicU64,
    started: AtomicU64,
    attached: AtomicU64,
}

impl InternMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    fn attach(&self, entry: &InFlight) -> RewriteHandle {
        self.attached.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(key = %entry.status.key(), "attached to running context");
        RewriteHandle {
            outcome: entry.outcome.clone(),
            status: Arc::clone(&entry.status),
            attached: true,
        }
    }

    /// Returns the running context for `key`, or starts one with `start`,
    /// which receives the new context's id and status.
    pub(crate) fn get_or_start<F>(&self, key: String, start: F) -> RewriteHandle
    where
        F: FnOnce(u64, Arc<ContextStatus>) -> SharedOutcome,
    {
        if let Some(entry) = self.in_flight.get(&key) {
            return self.attach(&entry);
        }
        match self.in_flight.entry(key) {
            Entry::Occupied(entry) => self.attach(entry.get()),
            Entry::Vacant(vacant) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let status = Arc::new(ContextStatus::new(vacant.key().clone()));
                let outcome = start(id, Arc::clone(&status));
                self.started.fetch_add(1, Ordering::Relaxed);
                let handle = RewriteHandle {
                    outcome: outcome.clone(),
                    status: Arc::clone(&status),
                    attached: false,
                };
                vacant.insert(InFlight {
                    id,
                    outcome,
                    status,
                });
                handle
            }
        }
    }

    /// Removes a finished context.
    pub(crate) fn finish(&self, key: &str, id: u64) {
        self.in_flight.remove_if(key, |_, entry| entry.id == id);
    }

    /// Returns current statistics.
    pub fn stats(&self) -> InternStats {
        InternStats {
            started: self.started.load(Ordering::Relaxed),
            attached: self.attached.load(Ordering::Relaxed),
            in_flight: self.in_flight.len(),
        }
    }
}

/// Runs a context to completion under the background deadline and
/// records its final state.
pub(crate) async fn run_context(
    server: Arc<ServerContext>,
    spec: RewriteSpec,
    transformer: Arc<dyn Transformer>,
    inputs: Vec<Resource>,
    id: u64,
    status: Arc<ContextStatus>,
) -> RewriteOutcome {
    let deadline = Duration::from_millis(server.options().background_rewrite_deadline_ms);
    let execution = execute(&server, &spec, &transformer, &inputs, &status);
    let outcome = match tokio::time::timeout(deadline, execution).await {
        Ok(outcome) => outcome,
        Err(_) => {
            tracing::warn!(key = %status.key(), kind = %RewriteErrorKind::DeadlineExceeded, "rewrite abandoned");
            RewriteOutcome::Canceled(RewriteErrorKind::DeadlineExceeded)
        }
    };
    status.advance(outcome.final_state());
    server.contexts().finish(status.key(), id);
    outcome
}

async fn execute(
    server: &ServerContext,
    spec: &RewriteSpec,
    transformer: &Arc<dyn Transformer>,
    inputs: &[Resource],
    status: &ContextStatus,
) -> RewriteOutcome {
    let key = status.key();
    let metadata = server.metadata_cache();
    let cached = transformer.kind() == TransformerKind::Cached;

    match metadata.lookup(key).await {
        MetadataLookup::Hit(entry) => return outcome_from_entry(&entry),
        MetadataLookup::Expired(entry) => {
            if let Some(refreshed) = metadata.revalidate_inputs(key, &entry, server.loader()).await {
                return outcome_from_entry(&refreshed);
            }
        }
        MetadataLookup::Miss => {}
    }

    if !cached && spec.request.is_canceled() {
        return RewriteOutcome::Canceled(RewriteErrorKind::DeadlineExceeded);
    }
    status.advance(ContextState::InputFetch);

    let loads = inputs
        .iter()
        .map(|input| server.loader().load(input, &spec.request, spec.allow_uncacheable));
    let mut loaded = Vec::with_capacity(inputs.len());
    for result in futures::future::join_all(loads).await {
        match result {
            Ok(resource) => loaded.push(resource),
            Err(kind) => return fail(server, key, kind, Vec::new()).await,
        }
    }
    let infos: Vec<InputInfo> = loaded
        .iter()
        .map(|r| InputInfo::from_loaded(r, server.hasher().as_ref()))
        .collect();

    let min_ttl_ms = server.options().min_resource_cache_time_to_rewrite_ms;
    let mut cacheable = true;
    let mut transform_inputs = Vec::with_capacity(loaded.len());
    for resource in &loaded {
        if !resource.is_ok() {
            return fail(server, key, RewriteErrorKind::FetchFailed, infos).await;
        }
        let Some(content_type) = resource.content_type().filter(|ct| transformer.accepts(ct)) else {
            return fail(server, key, RewriteErrorKind::TransformerDeclined, infos).await;
        };
        if !resource.is_cacheable_for(min_ttl_ms.max(1)) {
            if !spec.allow_uncacheable {
                return fail(server, key, RewriteErrorKind::InputUncacheable, infos).await;
            }
            cacheable = false;
        }
        transform_inputs.push(TransformInput {
            url: resource.url().to_string(),
            content_type: content_type.clone(),
            body: resource.body().clone(),
        });
    }

    if !cached && spec.request.is_canceled() {
        return RewriteOutcome::Canceled(RewriteErrorKind::DeadlineExceeded);
    }
    status.advance(ContextState::Rewriting);

    let pool = if spec.background {
        server.low_priority_pool()
    } else {
        server.worker_pool()
    };
    let options = server.options_arc();
    let runner = Arc::clone(transformer);
    let result = pool
        .run(move || runner.run(&transform_inputs, &options))
        .await;
    let output = match result {
        Err(RewriteErrorKind::LoadShed) => {
            return RewriteOutcome::Canceled(RewriteErrorKind::LoadShed);
        }
        Err(kind) => return fail(server, key, kind, infos).await,
        Ok(TransformResult::Unoptimizable) => {
            return fail(server, key, RewriteErrorKind::TransformerDeclined, infos).await;
        }
        Ok(TransformResult::Error(message)) => {
            tracing::warn!(key, error = %message, "transformer failed");
            return fail(server, key, RewriteErrorKind::TransformerErrored, infos).await;
        }
        Ok(TransformResult::Ok(output)) => output,
    };

    if !server.options().is_cacheable_body_size(output.body.len()) {
        return fail(server, key, RewriteErrorKind::TransformerDeclined, infos).await;
    }

    let hash = server.hasher().hash(&output.body);
    let private = loaded.iter().any(LoadedResource::is_private);
    let mut headers = ResponseHeaders::ok(&output.content_type.header_value());
    set_cache_lifetime(
        &mut headers,
        server.timer().now_ms(),
        server.options().cache_extend_ttl_ms,
        private,
    );
    headers.set(names::ETAG, server.http_cache().etag_for(&output.body));

    let url = if inputs.iter().all(Resource::is_inline) {
        format!(
            "data:{};base64,{}",
            output.content_type.mime(),
            STANDARD.encode(&output.body)
        )
    } else {
        let input_urls: Vec<&str> = spec.input_urls.iter().map(String::as_str).collect();
        let rewritten = match RewrittenUrl::for_inputs(
            &input_urls,
            transformer.id(),
            &hash,
            output.content_type.ext(),
        ) {
            Ok(rewritten) => rewritten,
            Err(e) => {
                tracing::debug!(key, error = %e, "inputs cannot be named");
                return fail(server, key, RewriteErrorKind::TransformerDeclined, infos).await;
            }
        };
        let rewritten = match server.domain_lawyer().map_rewrite_domain(&rewritten.base) {
            Some(base) => rewritten.with_base(base),
            None => rewritten,
        };
        match rewritten.to_url() {
            Ok(url) => url,
            Err(e) => {
                tracing::debug!(key, error = %e, "inputs cannot be named");
                return fail(server, key, RewriteErrorKind::TransformerDeclined, infos).await;
            }
        }
    };

    let value = HttpValue::new(headers, output.body);
    if cacheable {
        if cached && !url.starts_with("data:") {
            let stored = server
                .http_cache()
                .put(&url, None, &value.headers, value.body.clone())
                .await;
            if !stored {
                tracing::warn!(key, url = %url, kind = %RewriteErrorKind::CacheWriteFailed, "output not cached");
            }
        }
        if cached {
            let entry = MetadataEntry::success(vec![url.clone()], infos, server.timer().now_ms());
            metadata.put(key, &entry).await;
        }
    }
    tracing::debug!(key, url = %url, "rewrite produced output");
    RewriteOutcome::Rewritten {
        url,
        output: Some(value),
        cacheable,
    }
}

fn outcome_from_entry(entry: &MetadataEntry) -> RewriteOutcome {
    if let Some(kind) = entry.failure {
        return RewriteOutcome::Failed(kind);
    }
    match entry.outputs.first() {
        Some(url) => RewriteOutcome::Rewritten {
            url: url.clone(),
            output: None,
            cacheable: true,
        },
        None => RewriteOutcome::Failed(RewriteErrorKind::TransformerDeclined),
    }
}

/// Records a failure, remembering it when its kind is memoizable.
async fn fail(
    server: &ServerContext,
    key: &str,
    kind: RewriteErrorKind,
    inputs: Vec<InputInfo>,
) -> RewriteOutcome {
    if kind.is_memoizable() {
        let ttl_ms = match kind {
            RewriteErrorKind::FetchFailed => server.options().fetch_failure_ttl_ms,
            _ => server.options().metadata_failure_ttl_ms,
        };
        let entry = MetadataEntry::failure(kind, inputs, server.timer().now_ms(), ttl_ms);
        server.metadata_cache().put(key, &entry).await;
    }
    tracing::debug!(key, kind = %kind, "rewrite failed");
    RewriteOutcome::Failed(kind)
}
