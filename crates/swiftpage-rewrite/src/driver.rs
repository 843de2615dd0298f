//! The per-request HTML rewrite driver.
//!
//! A driver owns the lexer, the filter chain and the queue of output pieces
//! for one document. Bytes are parsed as they arrive; filters bind rewrites
//! to tags; a flush writes out the queue in order, waiting for each pending
//! rewrite until its deadline and keeping the original markup when the
//! deadline passes. Rewrites that miss their deadline keep running and
//! their outputs serve later requests.
//!
//! A document larger than `max_html_parse_bytes` is not rewritten past
//! that point: the driver injects a script that reloads the page with
//! rewriting off, passes the rest through unchanged and remembers the page
//! as too large so later requests skip parsing altogether.

use crate::context::RewriteOutcome;
use crate::filter::{FilterContext, HtmlFilter, Piece};
use crate::filters;
use crate::html::{Lexer, Token};
use crate::proxy_fetch::ResponseWriter;
use crate::server_context::ServerContext;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use swiftpage_cache::FallbackPropertyPage;
use swiftpage_core::RewriteErrorKind;
use swiftpage_http::RequestContextPtr;
use tokio::time::Instant;
use url::Url;

/// Cohort for facts about the document itself.
pub const DOM_COHORT: &str = "dom";
/// When the page was last requested.
pub const LAST_REQUEST_TIMESTAMP: &str = "last_request_timestamp";
/// Status code of the last response.
pub const STATUS_CODE_PROPERTY: &str = "status_code";
/// Set when the page exceeded the parse limit.
pub const PARSE_SIZE_LIMIT_EXCEEDED: &str = "parse_size_limit_exceeded";
/// Query parameter that turns rewriting off.
pub const PAGESPEED_OFF: &str = "PageSpeed=off";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Parsing,
    /// The document passed the parse limit during this request.
    Bailed,
    /// The page was remembered as too large; nothing is parsed.
    Skipped,
}

struct Slot {
    piece: Piece,
    created: Instant,
}

#[derive(Clone, Copy)]
enum Stage {
    Process,
    Flush,
    End,
}

/// Drives the rewriting of one HTML document.
pub struct RewriteDriver {
    server: Arc<ServerContext>,
    request: RequestContextPtr,
    base_url: Url,
    page: FallbackPropertyPage,
    lexer: Lexer,
    filters: Vec<Box<dyn HtmlFilter>>,
    queue: VecDeque<Slot>,
    out: Vec<u8>,
    mode: Mode,
    started: bool,
    finished: bool,
    parsed_bytes: usize,
    unflushed_bytes: usize,
    status_code: u16,
}

impl RewriteDriver {
    /// Creates a driver for the document at `base_url`, with the page's
    /// property-cache record.
    pub fn new(
        server: Arc<ServerContext>,
        request: RequestContextPtr,
        base_url: Url,
        page: FallbackPropertyPage,
    ) -> Self {
        let filters = filters::build_chain(server.options());
        Self {
            server,
            request,
            base_url,
            page,
            lexer: Lexer::new(),
            filters,
            queue: VecDeque::new(),
            out: Vec::new(),
            mode: Mode::Parsing,
            started: false,
            finished: false,
            parsed_bytes: 0,
            unflushed_bytes: 0,
            status_code: 200,
        }
    }

    /// Records the status code of the response being rewritten.
    pub fn set_status_code(&mut self, status_code: u16) {
        self.status_code = status_code;
    }

    /// The page's property-cache record.
    pub fn property_page(&self) -> &FallbackPropertyPage {
        &self.page
    }

    /// The request.
    pub fn request(&self) -> &RequestContextPtr {
        &self.request
    }

    /// Whether the driver stopped parsing this document.
    pub fn is_passing_through(&self) -> bool {
        self.mode != Mode::Parsing
    }

    /// Whether enough output is buffered that the caller should flush.
    pub fn should_flush(&self) -> bool {
        self.unflushed_bytes >= self.server.options().flush_buffer_limit_bytes
    }

    fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        let remembered_too_large = self
            .page
            .get(DOM_COHORT, PARSE_SIZE_LIMIT_EXCEEDED)
            .is_some_and(|v| v.value() == "1");
        if remembered_too_large {
            tracing::debug!(url = %self.base_url, "page over parse limit, not parsing");
            self.mode = Mode::Skipped;
            self.request.log_record().parse_size_limit_exceeded = true;
            return;
        }
        let mut ctx = FilterContext {
            server: &self.server,
            request: &self.request,
            base_url: &self.base_url,
            page: &mut self.page,
        };
        for filter in &mut self.filters {
            filter.start_document(&mut ctx);
        }
    }

    /// Parses a chunk of the document.
    pub fn parse_chunk(&mut self, chunk: &[u8]) {
        self.start();
        self.parsed_bytes += chunk.len();
        self.unflushed_bytes += chunk.len();
        if self.mode != Mode::Parsing {
            self.push_raw(chunk.to_vec());
            return;
        }
        if self.server.options().exceeds_html_parse_limit(self.parsed_bytes) {
            self.bail_out(chunk);
            return;
        }
        for token in self.lexer.feed(chunk) {
            self.process_token(token);
        }
    }

    fn bail_out(&mut self, chunk: &[u8]) {
        tracing::info!(
            url = %self.base_url,
            parsed_bytes = self.parsed_bytes,
            "document exceeds parse limit, passing through"
        );
        let held = self.cascade(Vec::new(), Stage::Flush);
        self.enqueue(held);
        let script = redirect_script(self.request.url());
        self.push_raw(script.into_bytes());
        let mut rest = self.lexer.take_buffered();
        rest.extend_from_slice(chunk);
        self.push_raw(rest);

        let now_ms = self.server.timer().now_ms();
        self.page
            .update(DOM_COHORT, PARSE_SIZE_LIMIT_EXCEEDED, "1", now_ms);
        self.request.log_record().parse_size_limit_exceeded = true;
        self.mode = Mode::Bailed;
    }

    fn push_raw(&mut self, bytes: Vec<u8>) {
        if !bytes.is_empty() {
            self.queue.push_back(Slot {
                piece: Piece::Token(Token::Text(bytes)),
                created: Instant::now(),
            });
        }
    }

    fn process_token(&mut self, token: Token) {
        if let Token::StartTag(tag) = &token {
            if tag.name() == "base" {
                if let Some(base) = tag.attr("href").and_then(|h| self.base_url.join(h).ok()) {
                    self.base_url = base;
                }
            }
        }
        let pieces = self.cascade(vec![Piece::Token(token)], Stage::Process);
        self.enqueue(pieces);
    }

    fn enqueue(&mut self, pieces: Vec<Piece>) {
        let created = Instant::now();
        self.queue
            .extend(pieces.into_iter().map(|piece| Slot { piece, created }));
    }

    /// Runs pieces through the chain. At a flush or the end of the
    /// document each filter also releases what it holds, and those pieces
    /// go through the filters after it.
    fn cascade(&mut self, pieces: Vec<Piece>, stage: Stage) -> Vec<Piece> {
        let mut ctx = FilterContext {
            server: &self.server,
            request: &self.request,
            base_url: &self.base_url,
            page: &mut self.page,
        };
        let mut current = pieces;
        for filter in &mut self.filters {
            let mut next = Vec::with_capacity(current.len());
            for piece in current {
                filter.process(piece, &mut ctx, &mut next);
            }
            match stage {
                Stage::Process => {}
                Stage::Flush => filter.flush(&mut ctx, &mut next),
                Stage::End => filter.end_document(&mut ctx, &mut next),
            }
            current = next;
        }
        current
    }

    /// Writes out everything parsed so far, waiting for pending rewrites
    /// up to their deadlines.
    pub async fn flush(&mut self, writer: &mut dyn ResponseWriter) {
        self.start();
        if self.mode == Mode::Parsing {
            let held = self.cascade(Vec::new(), Stage::Flush);
            self.enqueue(held);
        }
        self.drain_queue().await;
        if !self.out.is_empty() {
            writer.write(&std::mem::take(&mut self.out));
        }
        writer.flush();
        self.unflushed_bytes = 0;
    }

    /// Ends the document: writes the rest, commits the property cache and
    /// emits the request's log record.
    pub async fn finish(&mut self, writer: &mut dyn ResponseWriter) {
        if self.finished {
            return;
        }
        self.start();
        if self.mode == Mode::Parsing {
            for token in self.lexer.finish() {
                self.process_token(token);
            }
            let trailing = self.cascade(Vec::new(), Stage::End);
            self.enqueue(trailing);
        }
        self.drain_queue().await;
        if !self.out.is_empty() {
            writer.write(&std::mem::take(&mut self.out));
        }
        writer.flush();
        self.finished = true;
        self.commit().await;
    }

    async fn drain_queue(&mut self) {
        let deadline = Duration::from_millis(self.server.options().rewrite_deadline_ms);
        while let Some(slot) = self.queue.pop_front() {
            let pending = match slot.piece {
                Piece::Token(token) => {
                    token.write_to(&mut self.out);
                    continue;
                }
                Piece::Pending(pending) => pending,
            };
            let outcome =
                tokio::time::timeout_at(slot.created + deadline, pending.handle.shared()).await;
            let error = match outcome {
                Ok(RewriteOutcome::Rewritten { url, .. }) => {
                    self.request
                        .log_record()
                        .log_applied(&pending.transformer_id, &pending.input_url);
                    let rendered = (pending.render)(&url);
                    self.out.extend_from_slice(&rendered);
                    continue;
                }
                Ok(RewriteOutcome::Failed(kind)) | Ok(RewriteOutcome::Canceled(kind)) => kind,
                Err(_) => {
                    tracing::debug!(
                        url = %pending.input_url,
                        transformer = %pending.transformer_id,
                        "rewrite missed deadline, keeping original"
                    );
                    RewriteErrorKind::DeadlineExceeded
                }
            };
            self.request.log_record().log_not_applied(
                &pending.transformer_id,
                &pending.input_url,
                Some(error),
            );
            self.out.extend_from_slice(&pending.original);
        }
    }

    async fn commit(&mut self) {
        let now_ms = self.server.timer().now_ms();
        self.page
            .update(DOM_COHORT, LAST_REQUEST_TIMESTAMP, &now_ms.to_string(), now_ms);
        self.page.update(
            DOM_COHORT,
            STATUS_CODE_PROPERTY,
            &self.status_code.to_string(),
            now_ms,
        );
        if self.mode == Mode::Skipped
            && !self.server.options().exceeds_html_parse_limit(self.parsed_bytes)
        {
            self.page.delete(DOM_COHORT, PARSE_SIZE_LIMIT_EXCEEDED);
        }

        let mut cohorts = vec![DOM_COHORT];
        for filter in &self.filters {
            for cohort in filter.cohorts() {
                if !cohorts.contains(cohort) {
                    cohorts.push(cohort);
                }
            }
        }
        if let Err(e) = self.server.property_cache().commit(&self.page, &cohorts).await {
            tracing::warn!(url = %self.base_url, error = %e, "property cache commit failed");
        }

        let mut record = self.request.log_record();
        record.status_code = Some(self.status_code);
        record.timing.total_ms = Some(now_ms - self.request.start_ms());
        record.emit();
    }
}

/// The script that reloads a page with rewriting turned off.
pub fn redirect_script(url: &str) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    let target = escape_js_string(&format!("{url}{separator}{PAGESPEED_OFF}"));
    format!(
        "<script type=\"text/javascript\">window.location.replace(\"{target}\")</script>"
    )
}

/// Escapes `s` for a double-quoted JavaScript string inside a `<script>`
/// element. The result never contains a quote, a markup delimiter or a line
/// break.
fn escape_js_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 16);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '/' => out.push_str("\\/"),
            '\'' | '<' | '>' | '&' | '\u{2028}' | '\u{2029}' => {
                out.push_str(&format!("\\u{:04x}", u32::from(c)));
            }
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", u32::from(c))),
            c => out.push(c),
        }
    }
    out
}

/// Whether a request asks for rewriting to be turned off.
pub fn is_rewriting_disabled(url: &str) -> bool {
    url.split_once('?').is_some_and(|(_, query)| {
        query
            .split('&')
            .any(|param| param.eq_ignore_ascii_case(PAGESPEED_OFF))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_script_appends_query_parameter() {
        assert_eq!(
            redirect_script("http://test.com/a.html"),
            r#"<script type="text/javascript">window.location.replace("http:\/\/test.com\/a.html?PageSpeed=off")</script>"#
        );
        assert!(redirect_script("http://test.com/a.html?x=1")
            .contains(r"a.html?x=1\u0026PageSpeed=off"));
    }

    #[test]
    fn redirect_script_cannot_be_broken_out_of() {
        let script =
            redirect_script("http://test.com/?q=\"</script><script>alert(1)</script>&n='\n\\");
        assert_eq!(script.matches("</script>").count(), 1);
        assert_eq!(script.matches("<script").count(), 1);
        assert!(script.ends_with("\")</script>"));
        let body = script
            .strip_prefix(r#"<script type="text/javascript">window.location.replace(""#)
            .and_then(|rest| rest.strip_suffix(r#"")</script>"#))
            .unwrap();
        assert!(!body.contains(['<', '>', '\'', '\n', '&']));
        assert!(!body.replace("\\\\", "").replace("\\\"", "").contains('"'));
        assert!(body.contains(r#"q=\"\u003c\/script\u003e"#));
        assert!(body.ends_with(r"\u0026PageSpeed=off"));
    }

    #[test]
    fn rewriting_disabled_by_query() {
        assert!(is_rewriting_disabled("http://test.com/?PageSpeed=off"));
        assert!(is_rewriting_disabled("http://test.com/?a=b&pagespeed=OFF"));
        assert!(!is_rewriting_disabled("http://test.com/PageSpeed=off"));
        assert!(!is_rewriting_disabled("http://test.com/?PageSpeed=on"));
    }
}
