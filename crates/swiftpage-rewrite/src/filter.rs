//! The HTML filter interface.
//!
//! A driver pushes every token through a chain of filters. A filter may pass
//! a token on, hold it back, or replace it with a pending rewrite: a slot in
//! the output that is filled with either the rewritten markup or the
//! original bytes once the rewrite it is bound to resolves.

use crate::context::{RewriteHandle, RewriteSpec};
use crate::html::Token;
use crate::server_context::ServerContext;
use std::fmt;
use std::sync::Arc;
use swiftpage_cache::FallbackPropertyPage;
use swiftpage_core::{RewriteErrorKind, RewriteOptions};
use swiftpage_http::RequestContextPtr;
use url::Url;

/// Renders the markup for a rewritten URL.
pub type Render = Box<dyn FnOnce(&str) -> Vec<u8> + Send>;

/// An output slot waiting on a rewrite.
pub struct PendingRewrite {
    pub(crate) transformer_id: String,
    pub(crate) input_url: String,
    pub(crate) original: Vec<u8>,
    pub(crate) handle: RewriteHandle,
    pub(crate) render: Render,
}

impl fmt::Debug for PendingRewrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRewrite")
            .field("transformer_id", &self.transformer_id)
            .field("input_url", &self.input_url)
            .field("handle", &self.handle)
            .finish()
    }
}

impl PendingRewrite {
    /// A slot showing `original` unless `handle` yields a URL, in which
    /// case `render` produces the replacement.
    pub fn new(
        transformer_id: &str,
        input_url: impl Into<String>,
        original: Vec<u8>,
        handle: RewriteHandle,
        render: Render,
    ) -> Self {
        Self {
            transformer_id: transformer_id.to_string(),
            input_url: input_url.into(),
            original,
            handle,
            render,
        }
    }

    /// The markup the slot replaces.
    pub fn original(&self) -> &[u8] {
        &self.original
    }
}

/// An element of the filtered stream.
#[derive(Debug)]
pub enum Piece {
    /// A token, emitted as is.
    Token(Token),
    /// A slot bound to a rewrite.
    Pending(PendingRewrite),
}

impl Piece {
    /// Serializes the piece as it was before any rewrite.
    pub fn write_original(&self, out: &mut Vec<u8>) {
        match self {
            Piece::Token(token) => token.write_to(out),
            Piece::Pending(pending) => out.extend_from_slice(&pending.original),
        }
    }
}

/// What a filter sees of the request it runs in.
pub struct FilterContext<'a> {
    pub(crate) server: &'a Arc<ServerContext>,
    pub(crate) request: &'a RequestContextPtr,
    pub(crate) base_url: &'a Url,
    pub(crate) page: &'a mut FallbackPropertyPage,
}

impl FilterContext<'_> {
    /// The options the request runs with.
    pub fn options(&self) -> &RewriteOptions {
        self.server.options()
    }

    /// The request.
    pub fn request(&self) -> &RequestContextPtr {
        self.request
    }

    /// The document's base URL.
    pub fn base_url(&self) -> &Url {
        self.base_url
    }

    /// The page's property-cache record.
    pub fn page(&mut self) -> &mut FallbackPropertyPage {
        self.page
    }

    /// Current time.
    pub fn now_ms(&self) -> i64 {
        self.server.timer().now_ms()
    }

    /// Whether a value read from the property cache is stable.
    pub fn is_stable(&self, cohort: &str, name: &str) -> bool {
        self.page
            .get(cohort, name)
            .is_some_and(|value| self.server.property_cache().is_stable(value))
    }

    /// Resolves a reference against the base URL and checks that it may be
    /// rewritten. Unauthorized references are logged on the request.
    pub fn resolve_input(&self, transformer_id: &str, reference: &str) -> Option<Url> {
        let url = self.base_url.join(reference.trim()).ok()?;
        if url.scheme() == "data" {
            return Some(url);
        }
        if !matches!(url.scheme(), "http" | "https") {
            return None;
        }
        if !self
            .server
            .domain_lawyer()
            .is_domain_authorized(self.base_url, &url)
        {
            self.request.log_record().log_not_applied(
                transformer_id,
                url.as_str(),
                Some(RewriteErrorKind::InputUnauthorized),
            );
            return None;
        }
        if self.server.is_blacklisted(url.as_str()) {
            return None;
        }
        Some(url)
    }

    /// Starts (or attaches to) a rewrite of `inputs`.
    pub fn start_rewrite(&self, transformer_id: &str, inputs: Vec<String>) -> RewriteHandle {
        self.server.rewrite(RewriteSpec::new(
            transformer_id,
            inputs,
            Arc::clone(self.request),
        ))
    }
}

/// A stage of the HTML rewriting chain.
pub trait HtmlFilter: Send {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Property-cache cohorts the filter writes; committed at request end.
    fn cohorts(&self) -> &'static [&'static str] {
        &[]
    }

    /// Called before the first token.
    fn start_document(&mut self, _ctx: &mut FilterContext<'_>) {}

    /// Handles one piece, pushing zero or more pieces to `out`.
    fn process(&mut self, piece: Piece, ctx: &mut FilterContext<'_>, out: &mut Vec<Piece>);

    /// Releases anything held back; called at every flush.
    fn flush(&mut self, _ctx: &mut FilterContext<'_>, _out: &mut Vec<Piece>) {}

    /// Called after the last token; may append trailing pieces.
    fn end_document(&mut self, ctx: &mut FilterContext<'_>, out: &mut Vec<Piece>) {
        self.flush(ctx, out);
    }
}

/// Rewrites `rewritten` relative to the way `reference` was written, when
/// both live in the same directory as `input`.
pub fn relativize(reference: &str, input: &str, rewritten: &str) -> String {
    let reference = reference.trim();
    if reference.contains("://") || reference.starts_with("//") || reference.starts_with("data:") {
        return rewritten.to_string();
    }
    let Some(input_dir) = input.rfind('/').map(|i| &input[..=i]) else {
        return rewritten.to_string();
    };
    let Some(leaf) = rewritten.strip_prefix(input_dir) else {
        return rewritten.to_string();
    };
    let reference_path = reference.split(['?', '#']).next().unwrap_or(reference);
    let reference_dir = reference_path.rfind('/').map_or("", |i| &reference_path[..=i]);
    format!("{reference_dir}{leaf}")
}
