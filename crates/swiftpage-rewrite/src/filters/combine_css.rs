//! Combines adjacent stylesheet links into one.

use super::resource_tag::is_stylesheet;
use crate::filter::{relativize, FilterContext, HtmlFilter, PendingRewrite, Piece};
use crate::html::{Tag, Token};
use swiftpage_core::is_rewritten_url;

const COMBINER_ID: &str = "cc";

struct HeldLink {
    tag: Tag,
    reference: String,
    input: String,
}

/// Holds back runs of `<link rel=stylesheet>` tags separated only by
/// whitespace, and replaces each run of two or more with a single link to
/// the combined stylesheet.
#[derive(Default)]
pub struct CombineCssFilter {
    links: Vec<HeldLink>,
    held: Vec<Piece>,
}

impl CombineCssFilter {
    /// Creates the filter.
    pub fn new() -> Self {
        Self::default()
    }

    fn combinable(tag: &Tag, ctx: &FilterContext<'_>) -> Option<(String, String)> {
        if tag.name() != "link" || !is_stylesheet(tag) || tag.has_attr("media") {
            return None;
        }
        let reference = tag.attr("href")?;
        if is_rewritten_url(reference) {
            return None;
        }
        let input = ctx.resolve_input(COMBINER_ID, reference)?;
        if input.scheme() == "data" {
            return None;
        }
        Some((reference.to_string(), input.to_string()))
    }

    fn release(&mut self, ctx: &FilterContext<'_>, out: &mut Vec<Piece>) {
        // Whitespace after the last link is not part of the run.
        let mut trailing = Vec::new();
        while matches!(self.held.last(), Some(Piece::Token(Token::Text(_)))) {
            if let Some(piece) = self.held.pop() {
                trailing.push(piece);
            }
        }
        trailing.reverse();

        let links = std::mem::take(&mut self.links);
        let held = std::mem::take(&mut self.held);
        if links.len() < 2 {
            out.extend(held);
            out.extend(trailing);
            return;
        }

        let mut original = Vec::new();
        for piece in &held {
            piece.write_original(&mut original);
        }
        let inputs: Vec<String> = links.iter().map(|l| l.input.clone()).collect();
        let first_input = inputs[0].clone();
        let handle = ctx.start_rewrite(COMBINER_ID, inputs);
        tracing::debug!(links = links.len(), "combining stylesheets");
        let Some(first) = links.into_iter().next() else {
            return;
        };
        let render = Box::new(move |rewritten: &str| {
            let mut tag = first.tag;
            tag.set_attr("href", &relativize(&first.reference, &first.input, rewritten));
            Token::StartTag(tag).to_bytes()
        });
        out.push(Piece::Pending(PendingRewrite::new(
            COMBINER_ID,
            first_input,
            original,
            handle,
            render,
        )));
        out.extend(trailing);
    }
}

impl HtmlFilter for CombineCssFilter {
    fn name(&self) -> &'static str {
        "combine_css"
    }

    fn process(&mut self, piece: Piece, ctx: &mut FilterContext<'_>, out: &mut Vec<Piece>) {
        match piece {
            Piece::Token(Token::StartTag(tag)) => match Self::combinable(&tag, ctx) {
                Some((reference, input)) => {
                    self.held.push(Piece::Token(Token::StartTag(tag.clone())));
                    self.links.push(HeldLink {
                        tag,
                        reference,
                        input,
                    });
                }
                None => {
                    self.release(ctx, out);
                    out.push(Piece::Token(Token::StartTag(tag)));
                }
            },
            Piece::Token(Token::Text(text))
                if !self.links.is_empty() && text.iter().all(u8::is_ascii_whitespace) =>
            {
                self.held.push(Piece::Token(Token::Text(text)));
            }
            other => {
                self.release(ctx, out);
                out.push(other);
            }
        }
    }

    fn flush(&mut self, ctx: &mut FilterContext<'_>, out: &mut Vec<Piece>) {
        self.release(ctx, out);
    }
}
