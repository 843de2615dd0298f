//! The application-lifetime object.
//!
//! A [`ServerContext`] owns everything shared across requests: the three
//! caches, the resource loader, the transformer registry, the worker pools
//! and the intern map of running rewrites. It is built once at startup
//! and handed around as an `Arc`.

use crate::background::BackgroundTasks;
use crate::context::{run_context, InternMap, InternStats, RewriteHandle, RewriteOutcome, RewriteSpec};
use crate::driver::DOM_COHORT;
use crate::error::{Result, RewriteError};
use crate::loader::ResourceLoader;
use crate::metadata::{partition_key, MetadataCache, MetadataCacheStats};
use crate::resource::Resource;
use crate::transformer::TransformerRegistry;
use crate::worker::{WorkerPool, WorkerPoolStats};
use futures::FutureExt;
use std::fmt;
use std::sync::Arc;
use swiftpage_cache::{CacheBackend, LruCacheBackend, PropertyCache};
use swiftpage_core::{
    DeviceClassifier, DomainLawyer, Hasher, RewriteErrorKind, RewriteOptions, RewrittenUrl,
    Sha256Hasher, SystemTimer, Timer, UserAgentClassifier, WildcardGroup,
};
use swiftpage_http::{
    HttpCache, HttpCacheConfig, HttpCacheStats, RequestContext, RequestContextPtr,
    RequestHeaders, UrlAsyncFetcher,
};

/// Counters from every shared component.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServerStats {
    /// HTTP cache.
    pub http_cache: HttpCacheStats,
    /// Metadata cache.
    pub metadata_cache: MetadataCacheStats,
    /// Running and attached rewrites.
    pub contexts: InternStats,
    /// Foreground transformer pool.
    pub worker_pool: WorkerPoolStats,
    /// Background transformer pool.
    pub low_priority_pool: WorkerPoolStats,
}

/// Builds a [`ServerContext`].
pub struct ServerContextBuilder {
    options: RewriteOptions,
    fetcher: Option<Arc<dyn UrlAsyncFetcher>>,
    timer: Option<Arc<dyn Timer>>,
    hasher: Option<Arc<dyn Hasher>>,
    http_backend: Option<Arc<dyn CacheBackend>>,
    metadata_backend: Option<Arc<dyn CacheBackend>>,
    property_backend: Option<Arc<dyn CacheBackend>>,
    registry: Option<TransformerRegistry>,
    device_classifier: Option<Arc<dyn DeviceClassifier>>,
}

impl ServerContextBuilder {
    /// The fetcher for origin content. Required.
    pub fn fetcher(mut self, fetcher: Arc<dyn UrlAsyncFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// The clock. Defaults to the system clock.
    pub fn timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = Some(timer);
        self
    }

    /// The content hasher. Defaults to SHA-256 truncated to
    /// `hash_length`.
    pub fn hasher(mut self, hasher: Arc<dyn Hasher>) -> Self {
        self.hasher = Some(hasher);
        self
    }

    /// Backing store of the HTTP cache.
    pub fn http_cache_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.http_backend = Some(backend);
        self
    }

    /// Backing store of the metadata cache.
    pub fn metadata_cache_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.metadata_backend = Some(backend);
        self
    }

    /// Backing store of the property cache.
    pub fn property_cache_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.property_backend = Some(backend);
        self
    }

    /// The transformers. Defaults to the builtins.
    pub fn registry(mut self, registry: TransformerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// The device classifier. Defaults to [`UserAgentClassifier`].
    pub fn device_classifier(mut self, classifier: Arc<dyn DeviceClassifier>) -> Self {
        self.device_classifier = Some(classifier);
        self
    }

    /// Validates the options and builds the context.
    pub fn build(self) -> Result<Arc<ServerContext>> {
        let options = self.options;
        options
            .validate()
            .map_err(|e| RewriteError::InvalidOptions(e.to_string()))?;
        let fetcher = self
            .fetcher
            .ok_or_else(|| RewriteError::InvalidOptions("no fetcher configured".to_string()))?;

        let timer = self.timer.unwrap_or_else(|| Arc::new(SystemTimer));
        let hasher = self
            .hasher
            .unwrap_or_else(|| Arc::new(Sha256Hasher::with_length(options.hash_length)));
        let backend = |b: Option<Arc<dyn CacheBackend>>| -> Arc<dyn CacheBackend> {
            b.unwrap_or_else(|| Arc::new(LruCacheBackend::with_defaults()))
        };

        let http_cache = Arc::new(HttpCache::new(
            backend(self.http_backend),
            Arc::clone(&timer),
            Arc::clone(&hasher),
            HttpCacheConfig::from(&options),
        ));
        let metadata_cache = MetadataCache::new(
            backend(self.metadata_backend),
            Arc::clone(&timer),
            Arc::clone(&hasher),
        );
        let mut property_cache = PropertyCache::new(
            backend(self.property_backend),
            Arc::clone(&timer),
            &[DOM_COHORT],
            options.property_cache_stability_threshold,
        );
        property_cache.set_enabled(options.property_cache_enabled);

        let domain_lawyer = Arc::new(DomainLawyer::new(&options.domain_lawyer)?);
        let blacklist = options.blacklist_group()?;
        let tasks = BackgroundTasks::new();
        let loader = ResourceLoader::new(
            Arc::clone(&http_cache),
            Arc::clone(&fetcher),
            Arc::clone(&timer),
            Arc::clone(&domain_lawyer),
            tasks.clone(),
        );
        let worker_pool = WorkerPool::new("rewrite", options.worker_threads, None)?;
        let low_priority_pool = WorkerPool::new(
            "rewrite-low",
            options.low_priority_threads,
            Some(options.low_priority_queue_limit),
        )?;
        let options_signature = options.signature(hasher.as_ref());

        tracing::info!(
            signature = %options_signature,
            filters = ?options.enabled_filters,
            worker_threads = options.worker_threads,
            "server context ready"
        );

        Ok(Arc::new(ServerContext {
            options: Arc::new(options),
            options_signature,
            fetcher,
            timer,
            hasher,
            http_cache,
            metadata_cache,
            property_cache,
            loader,
            registry: self.registry.unwrap_or_else(TransformerRegistry::with_builtins),
            domain_lawyer,
            blacklist,
            device_classifier: self
                .device_classifier
                .unwrap_or_else(|| Arc::new(UserAgentClassifier)),
            worker_pool,
            low_priority_pool,
            contexts: InternMap::new(),
            tasks,
        }))
    }
}

/// Process-wide state of the rewrite engine.
pub struct ServerContext {
    options: Arc<RewriteOptions>,
    options_signature: String,
    fetcher: Arc<dyn UrlAsyncFetcher>,
    timer: Arc<dyn Timer>,
    hasher: Arc<dyn Hasher>,
    http_cache: Arc<HttpCache>,
    metadata_cache: MetadataCache,
    property_cache: PropertyCache,
    loader: ResourceLoader,
    registry: TransformerRegistry,
    domain_lawyer: Arc<DomainLawyer>,
    blacklist: WildcardGroup,
    device_classifier: Arc<dyn DeviceClassifier>,
    worker_pool: WorkerPool,
    low_priority_pool: WorkerPool,
    contexts: InternMap,
    tasks: BackgroundTasks,
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerContext")
            .field("options_signature", &self.options_signature)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl ServerContext {
    /// Starts building a context with `options`.
    pub fn builder(options: RewriteOptions) -> ServerContextBuilder {
        ServerContextBuilder {
            options,
            fetcher: None,
            timer: None,
            hasher: None,
            http_backend: None,
            metadata_backend: None,
            property_backend: None,
            registry: None,
            device_classifier: None,
        }
    }

    /// The options.
    pub fn options(&self) -> &RewriteOptions {
        &self.options
    }

    /// The options, shareable with worker threads.
    pub fn options_arc(&self) -> Arc<RewriteOptions> {
        Arc::clone(&self.options)
    }

    /// Hash of the options that affect outputs.
    pub fn options_signature(&self) -> &str {
        &self.options_signature
    }

    /// The origin fetcher.
    pub fn fetcher(&self) -> &Arc<dyn UrlAsyncFetcher> {
        &self.fetcher
    }

    /// The clock.
    pub fn timer(&self) -> &Arc<dyn Timer> {
        &self.timer
    }

    /// The content hasher.
    pub fn hasher(&self) -> &Arc<dyn Hasher> {
        &self.hasher
    }

    /// The HTTP cache.
    pub fn http_cache(&self) -> &Arc<HttpCache> {
        &self.http_cache
    }

    /// The metadata cache.
    pub fn metadata_cache(&self) -> &MetadataCache {
        &self.metadata_cache
    }

    /// The property cache.
    pub fn property_cache(&self) -> &PropertyCache {
        &self.property_cache
    }

    /// The resource loader.
    pub fn loader(&self) -> &ResourceLoader {
        &self.loader
    }

    /// The transformer registry.
    pub fn registry(&self) -> &TransformerRegistry {
        &self.registry
    }

    /// The domain rules.
    pub fn domain_lawyer(&self) -> &DomainLawyer {
        &self.domain_lawyer
    }

    /// Whether `url` is excluded from rewriting.
    pub fn is_blacklisted(&self, url: &str) -> bool {
        self.blacklist.matches(url, false)
    }

    /// The device classifier.
    pub fn device_classifier(&self) -> &dyn DeviceClassifier {
        self.device_classifier.as_ref()
    }

    /// Creates the context of a client request.
    pub fn new_request_context(&self, url: &str, headers: RequestHeaders) -> RequestContextPtr {
        let device = self.device_classifier.classify(headers.user_agent());
        RequestContext::new(url, headers, device, self.timer.now_ms())
    }

    /// Pool for foreground transformer work.
    pub fn worker_pool(&self) -> &WorkerPool {
        &self.worker_pool
    }

    /// Pool for background transformer work, with a bounded queue.
    pub fn low_priority_pool(&self) -> &WorkerPool {
        &self.low_priority_pool
    }

    /// Running rewrites.
    pub fn contexts(&self) -> &InternMap {
        &self.contexts
    }

    /// Work running in the background.
    pub fn tasks(&self) -> &BackgroundTasks {
        &self.tasks
    }

    /// Starts a rewrite, or attaches to the identical one already running.
    ///
    /// Requests that cannot name a rewrite (unknown transformer, bad input
    /// URLs, too many inputs) resolve immediately to a failure. A single
    /// input that is already the output of the same transformer resolves
    /// to itself.
    pub fn rewrite(self: &Arc<Self>, spec: RewriteSpec) -> RewriteHandle {
        let Some(transformer) = self.registry.lookup(&spec.filter_id) else {
            tracing::debug!(filter = %spec.filter_id, "unknown transformer");
            return RewriteHandle::ready(
                String::new(),
                RewriteOutcome::Failed(RewriteErrorKind::DecodeInvalid),
            );
        };
        if spec.input_urls.is_empty() || spec.input_urls.len() > transformer.max_inputs() {
            return RewriteHandle::ready(
                String::new(),
                RewriteOutcome::Failed(RewriteErrorKind::TransformerDeclined),
            );
        }
        if let [only] = spec.input_urls.as_slice() {
            let id = transformer.id();
            if RewrittenUrl::parse(only, usize::MAX, |known| known == id).is_ok() {
                return RewriteHandle::ready(
                    only.clone(),
                    RewriteOutcome::Rewritten {
                        url: only.clone(),
                        output: None,
                        cacheable: true,
                    },
                );
            }
        }
        let inputs = match spec
            .input_urls
            .iter()
            .map(|url| Resource::new(url))
            .collect::<std::result::Result<Vec<_>, _>>()
        {
            Ok(inputs) => inputs,
            Err(kind) => return RewriteHandle::ready(String::new(), RewriteOutcome::Failed(kind)),
        };

        let key = partition_key(
            self.hasher.as_ref(),
            transformer.id(),
            &self.options_signature,
            &spec.input_urls,
        );
        let server = Arc::clone(self);
        self.contexts.get_or_start(key, move |id, status| {
            let tasks = server.tasks.clone();
            let task = tasks.spawn(run_context(server, spec, transformer, inputs, id, status));
            async move {
                match task.await {
                    Ok(outcome) => outcome,
                    Err(e) if e.is_panic() => {
                        tracing::error!(error = %e, "rewrite task panicked");
                        RewriteOutcome::Failed(RewriteErrorKind::TransformerErrored)
                    }
                    Err(_) => RewriteOutcome::Canceled(RewriteErrorKind::LoadShed),
                }
            }
            .boxed()
            .shared()
        })
    }

    /// Waits until background work (rewrites that missed their deadline,
    /// freshens, in-place rewrites) has finished.
    pub async fn quiesce(&self) {
        self.tasks.wait_idle().await;
    }

    /// Returns counters from every shared component.
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            http_cache: self.http_cache.stats(),
            metadata_cache: self.metadata_cache.stats(),
            contexts: self.contexts.stats(),
            worker_pool: self.worker_pool.stats(),
            low_priority_pool: self.low_priority_pool.stats(),
        }
    }
}
