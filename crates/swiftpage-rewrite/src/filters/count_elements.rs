//! Counts elements and remembers the count in the property cache.

use crate::driver::DOM_COHORT;
use crate::filter::{FilterContext, HtmlFilter, Piece};
use crate::html::Token;

/// Property holding the element count.
pub const NUM_ELEMENTS_PROPERTY: &str = "num_elements";

/// Counts start tags, records the count in the `dom` cohort and appends a
/// comment saying whether the count has been stable across requests.
#[derive(Debug, Default)]
pub struct CountElementsFilter {
    count: u64,
}

impl CountElementsFilter {
    /// Creates the filter.
    pub fn new() -> Self {
        Self::default()
    }
}

impl HtmlFilter for CountElementsFilter {
    fn name(&self) -> &'static str {
        "count_elements"
    }

    fn cohorts(&self) -> &'static [&'static str] {
        &[DOM_COHORT]
    }

    fn start_document(&mut self, _ctx: &mut FilterContext<'_>) {
        self.count = 0;
    }

    fn process(&mut self, piece: Piece, _ctx: &mut FilterContext<'_>, out: &mut Vec<Piece>) {
        if let Piece::Token(Token::StartTag(_)) = &piece {
            self.count += 1;
        }
        out.push(piece);
    }

    fn end_document(&mut self, ctx: &mut FilterContext<'_>, out: &mut Vec<Piece>) {
        let now_ms = ctx.now_ms();
        let count = self.count.to_string();
        ctx.page()
            .update(DOM_COHORT, NUM_ELEMENTS_PROPERTY, &count, now_ms);
        let stability = if ctx.is_stable(DOM_COHORT, NUM_ELEMENTS_PROPERTY) {
            "stable"
        } else {
            "unstable"
        };
        let comment = format!("<!--{count} elements {stability}-->");
        out.push(Piece::Token(Token::Comment(comment.into_bytes())));
    }
}
