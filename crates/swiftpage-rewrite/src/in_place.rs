//! Rewriting of resources requested at their original URL.
//!
//! The first request for a stylesheet or script is answered with the
//! origin bytes while an optimization runs on the low-priority pool. The
//! result is stored in the HTTP cache under a key derived from the
//! original URL, carrying the original's caching headers, so later
//! requests for the same URL get the optimized bytes.

use crate::context::{RewriteOutcome, RewriteSpec};
use crate::resource::Resource;
use crate::server_context::ServerContext;
use dashmap::DashSet;
use std::sync::Arc;
use swiftpage_core::options::{FILTER_REWRITE_CSS, FILTER_REWRITE_JAVASCRIPT};
use swiftpage_core::{ContentKind, ContentType};
use swiftpage_http::{names, FindResult, HttpValue, RequestContext};

/// Id under which in-place rewrites appear in log records.
pub const IN_PLACE_ID: &str = "ip";

/// Fragments never reach an origin, so this key cannot collide with a
/// fetched URL.
const IN_PLACE_FRAGMENT: &str = "#in-place";

/// HTTP-cache key of the optimized copy of `url`.
pub fn in_place_key(url: &str) -> String {
    let base = url.split_once('#').map_or(url, |(base, _)| base);
    format!("{base}{IN_PLACE_FRAGMENT}")
}

/// Serves and schedules in-place rewrites.
#[derive(Debug, Clone)]
pub struct InPlaceRewriter {
    server: Arc<ServerContext>,
    in_progress: Arc<DashSet<String>>,
}

impl InPlaceRewriter {
    /// Creates a rewriter.
    pub fn new(server: Arc<ServerContext>) -> Self {
        Self {
            server,
            in_progress: Arc::new(DashSet::new()),
        }
    }

    /// The transformer that optimizes `content_type`, if its filter is on.
    pub fn transformer_for(&self, content_type: &ContentType) -> Option<&'static str> {
        let options = self.server.options();
        match content_type.kind() {
            ContentKind::Css if options.is_filter_enabled(FILTER_REWRITE_CSS) => Some("cf"),
            ContentKind::JavaScript if options.is_filter_enabled(FILTER_REWRITE_JAVASCRIPT) => {
                Some("jm")
            }
            _ => None,
        }
    }

    /// The optimized copy of `url`, if one is cached and fresh.
    pub async fn find(&self, url: &str) -> Option<HttpValue> {
        match self.server.http_cache().find(&in_place_key(url)).await {
            FindResult::Found { value, .. } => Some(value),
            _ => None,
        }
    }

    /// Optimizes `url` in the background unless that is already running.
    pub fn schedule(&self, url: &str) {
        if !self.in_progress.insert(url.to_string()) {
            return;
        }
        let rewriter = self.clone();
        let url = url.to_string();
        self.server.tasks().spawn(async move {
            let stored = rewriter.rewrite(&url).await;
            tracing::debug!(url = %url, stored, "in-place rewrite finished");
            rewriter.in_progress.remove(&url);
        });
    }

    /// Number of in-place rewrites running.
    pub fn in_progress(&self) -> usize {
        self.in_progress.len()
    }

    async fn rewrite(&self, url: &str) -> bool {
        let server = &self.server;
        let ctx = RequestContext::background(url, server.timer().now_ms());
        let Ok(resource) = Resource::new(url) else {
            return false;
        };
        let original = match server.loader().load(&resource, &ctx, false).await {
            Ok(original) if original.is_ok() => original,
            Ok(_) => return false,
            Err(kind) => {
                tracing::debug!(url, %kind, "in-place input not loadable");
                return false;
            }
        };
        let Some(filter_id) = original.content_type().and_then(|ct| self.transformer_for(ct)) else {
            return false;
        };

        let mut spec = RewriteSpec::new(filter_id, vec![url.to_string()], Arc::clone(&ctx));
        spec.background = true;
        let output = match server.rewrite(spec).outcome().await {
            RewriteOutcome::Rewritten {
                output: Some(value),
                ..
            } => value,
            RewriteOutcome::Rewritten { url: produced, .. } => {
                match server.http_cache().find(&produced).await {
                    FindResult::Found { value, .. } => value,
                    _ => return false,
                }
            }
            outcome => {
                tracing::debug!(url, kind = ?outcome.error(), "in-place rewrite not applied");
                return false;
            }
        };

        let mut headers = original.headers().clone();
        headers.remove(names::ETAG);
        headers.remove(names::CONTENT_LENGTH);
        if let Some(content_type) = output.headers.get(names::CONTENT_TYPE) {
            headers.set(names::CONTENT_TYPE, content_type);
        }
        server
            .http_cache()
            .put(&in_place_key(url), None, &headers, output.body)
            .await
    }
}
