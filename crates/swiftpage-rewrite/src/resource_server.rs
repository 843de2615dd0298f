//! Serves rewritten resources by their encoded URLs.
//!
//! A request for an encoded URL is answered from the HTTP cache when the
//! output is there. Otherwise the URL is decoded back into its inputs and
//! the rewrite is run again: on-the-fly transformers recompute the output,
//! cached ones find their metadata or refetch their inputs. When the
//! recomputed output no longer matches the hash in the URL, the fresh
//! output is served anyway, with a short private lifetime.

use crate::context::{RewriteOutcome, RewriteSpec};
use crate::proxy_fetch::ResponseWriter;
use crate::server_context::ServerContext;
use crate::transformer::TransformerKind;
use std::sync::Arc;
use swiftpage_core::{RewriteErrorKind, RewrittenUrl};
use swiftpage_http::caching::set_cache_lifetime;
use swiftpage_http::{names, FindResult, HttpValue, RequestContextPtr, ResponseHeaders};
use url::Url;

/// Lifetime of an output served under a stale hash.
pub const HASH_MISMATCH_TTL_MS: i64 = 5 * 60 * 1000;

const CONDITIONAL_HEADERS: &[&str] = &[
    names::CACHE_CONTROL,
    names::DATE,
    names::ETAG,
    names::EXPIRES,
    names::LAST_MODIFIED,
];

/// Answers requests for rewritten URLs.
#[derive(Debug, Clone)]
pub struct ResourceServer {
    server: Arc<ServerContext>,
}

impl ResourceServer {
    /// Creates a resource server.
    pub fn new(server: Arc<ServerContext>) -> Self {
        Self { server }
    }

    /// Serves the rewritten URL of `request` into `writer` and returns the
    /// status code sent.
    pub async fn serve(&self, request: &RequestContextPtr, writer: &mut dyn ResponseWriter) -> u16 {
        let status = self.respond(request, writer).await;
        let now_ms = self.server.timer().now_ms();
        let mut record = request.log_record();
        record.status_code = Some(status);
        record.timing.total_ms = Some(now_ms - request.start_ms());
        record.emit();
        status
    }

    async fn respond(&self, request: &RequestContextPtr, writer: &mut dyn ResponseWriter) -> u16 {
        let url = request.url();
        let registry = self.server.registry();
        let requested = match RewrittenUrl::parse(
            url,
            self.server.hasher().hash_size_in_chars(),
            |id| registry.contains(id),
        ) {
            Ok(requested) => requested,
            Err(e) => {
                tracing::debug!(url, error = %e, "not a servable rewritten url");
                request.log_record().log_error(RewriteErrorKind::DecodeInvalid);
                return not_found(writer);
            }
        };

        if let FindResult::Found { value, .. } = self.server.http_cache().find(url).await {
            tracing::debug!(url, "serving rewritten resource from cache");
            return send_value(request, &value, writer);
        }

        let Some(value) = self.reconstruct(request, &requested).await else {
            return not_found(writer);
        };
        send_value(request, &value, writer)
    }

    /// Reruns the rewrite named by `requested`.
    async fn reconstruct(
        &self,
        request: &RequestContextPtr,
        requested: &RewrittenUrl,
    ) -> Option<HttpValue> {
        let lawyer = self.server.domain_lawyer();
        let requested_url = Url::parse(request.url()).ok()?;
        let mut inputs = Vec::with_capacity(requested.namer.originals.len());
        for input in requested.input_urls() {
            let input = lawyer.map_rewrite_domain_to_origin(&input).unwrap_or(input);
            let authorized = Url::parse(&input)
                .is_ok_and(|parsed| lawyer.is_domain_authorized(&requested_url, &parsed));
            if !authorized || self.server.is_blacklisted(&input) {
                tracing::debug!(input = %input, "input of rewritten url not authorized");
                request.log_record().log_not_applied(
                    &requested.namer.id,
                    &input,
                    Some(RewriteErrorKind::InputUnauthorized),
                );
                return None;
            }
            inputs.push(input);
        }

        let transformer = self.server.registry().lookup(&requested.namer.id)?;
        let mut spec = RewriteSpec::new(&requested.namer.id, inputs.clone(), Arc::clone(request));
        spec.allow_uncacheable = transformer.kind() == TransformerKind::OnTheFly;

        // A second attempt covers metadata that outlived its cached output.
        for attempt in 0..2 {
            let handle = self.server.rewrite(spec.clone());
            match handle.outcome().await {
                RewriteOutcome::Rewritten {
                    url,
                    output: Some(value),
                    cacheable,
                } => return Some(self.finalize(requested, &url, value, cacheable)),
                RewriteOutcome::Rewritten { url, output: None, .. } => {
                    match self.server.http_cache().find(&url).await {
                        FindResult::Found { value, .. } => {
                            return Some(self.finalize(requested, &url, value, true));
                        }
                        _ if attempt == 0 => {
                            tracing::debug!(url = %url, "output evicted, recomputing");
                            self.server.metadata_cache().invalidate(handle.key()).await;
                        }
                        _ => return None,
                    }
                }
                outcome => {
                    let kind = outcome.error();
                    tracing::debug!(url = %request.url(), ?kind, "could not reconstruct resource");
                    request.log_record().log_not_applied(
                        &requested.namer.id,
                        &inputs.join("+"),
                        kind,
                    );
                    return None;
                }
            }
        }
        None
    }

    /// Adjusts the lifetime of a reconstructed output: outputs of
    /// uncacheable inputs and outputs whose hash changed are private and
    /// short-lived.
    fn finalize(
        &self,
        requested: &RewrittenUrl,
        produced_url: &str,
        mut value: HttpValue,
        cacheable: bool,
    ) -> HttpValue {
        let now_ms = self.server.timer().now_ms();
        let hash_matches = RewrittenUrl::parse(produced_url, usize::MAX, |_| true)
            .is_ok_and(|produced| produced.namer.hash == requested.namer.hash);
        if !cacheable {
            set_cache_lifetime(&mut value.headers, now_ms, 0, true);
        } else if !hash_matches {
            tracing::info!(
                requested = %requested,
                produced = produced_url,
                "hash mismatch, serving current output"
            );
            set_cache_lifetime(&mut value.headers, now_ms, HASH_MISMATCH_TTL_MS, true);
        }
        value
    }
}

/// Sends a stored response, or a `304` when the request's validators
/// match it.
pub(crate) fn send_value(
    request: &RequestContextPtr,
    value: &HttpValue,
    writer: &mut dyn ResponseWriter,
) -> u16 {
    if request.request_headers().is_not_modified(&value.headers) {
        let mut headers = ResponseHeaders::new(304);
        for name in CONDITIONAL_HEADERS {
            if let Some(v) = value.headers.get(name) {
                headers.set(name, v);
            }
        }
        writer.headers_complete(&headers);
        writer.done(true);
        return 304;
    }
    let status = value.headers.status_code();
    writer.headers_complete(&value.headers);
    writer.write(&value.body);
    writer.flush();
    writer.done(true);
    status
}

fn not_found(writer: &mut dyn ResponseWriter) -> u16 {
    let mut headers = ResponseHeaders::new(404);
    headers.set(names::CONTENT_TYPE, "text/html");
    writer.headers_complete(&headers);
    writer.write(b"<html><body>Not Found</body></html>");
    writer.done(true);
    404
}
