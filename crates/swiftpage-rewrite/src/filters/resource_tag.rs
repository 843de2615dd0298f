//! Rewrites the URL attributes of stylesheet, script and image tags.

use crate::filter::{relativize, FilterContext, HtmlFilter, PendingRewrite, Piece};
use crate::html::{Tag, Token};
use swiftpage_core::is_rewritten_url;
use swiftpage_core::options::{FILTER_EXTEND_CACHE, FILTER_REWRITE_CSS, FILTER_REWRITE_JAVASCRIPT};
use swiftpage_core::RewriteOptions;

/// Transformer ids used for each kind of reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Choice {
    attr: &'static str,
    transformer_id: &'static str,
}

/// Binds `<link rel=stylesheet href>`, `<script src>` and `<img src>` to
/// rewrites: minification when enabled, cache extension otherwise.
#[derive(Debug, Default)]
pub struct ResourceTagFilter;

impl ResourceTagFilter {
    /// Creates the filter.
    pub fn new() -> Self {
        Self
    }

    /// Whether any of the filter's rewrites is enabled.
    pub fn is_enabled(options: &RewriteOptions) -> bool {
        [FILTER_REWRITE_CSS, FILTER_REWRITE_JAVASCRIPT, FILTER_EXTEND_CACHE]
            .iter()
            .any(|f| options.is_filter_enabled(f))
    }

    fn choose(tag: &Tag, options: &RewriteOptions) -> Option<Choice> {
        let extend = options.is_filter_enabled(FILTER_EXTEND_CACHE);
        let (attr, minify_filter, minifier) = match tag.name() {
            "link" if is_stylesheet(tag) => ("href", FILTER_REWRITE_CSS, "cf"),
            "script" => ("src", FILTER_REWRITE_JAVASCRIPT, "jm"),
            "img" => ("src", "", ""),
            _ => return None,
        };
        tag.attr(attr)?;
        let transformer_id = if !minify_filter.is_empty() && options.is_filter_enabled(minify_filter) {
            minifier
        } else if extend {
            "ce"
        } else {
            return None;
        };
        Some(Choice {
            attr,
            transformer_id,
        })
    }
}

pub(crate) fn is_stylesheet(tag: &Tag) -> bool {
    tag.attr("rel").is_some_and(|rel| {
        rel.split_ascii_whitespace()
            .any(|token| token.eq_ignore_ascii_case("stylesheet"))
    })
}

impl HtmlFilter for ResourceTagFilter {
    fn name(&self) -> &'static str {
        "resource_tag"
    }

    fn process(&mut self, piece: Piece, ctx: &mut FilterContext<'_>, out: &mut Vec<Piece>) {
        let Piece::Token(Token::StartTag(tag)) = piece else {
            out.push(piece);
            return;
        };
        let Some(choice) = Self::choose(&tag, ctx.options()) else {
            out.push(Piece::Token(Token::StartTag(tag)));
            return;
        };
        let reference = tag.attr(choice.attr).unwrap_or_default().to_string();
        if is_rewritten_url(&reference) {
            out.push(Piece::Token(Token::StartTag(tag)));
            return;
        }
        let Some(input) = ctx.resolve_input(choice.transformer_id, &reference) else {
            out.push(Piece::Token(Token::StartTag(tag)));
            return;
        };
        if input.scheme() == "data" && choice.transformer_id == "ce" {
            out.push(Piece::Token(Token::StartTag(tag)));
            return;
        }

        let input = input.to_string();
        let handle = ctx.start_rewrite(choice.transformer_id, vec![input.clone()]);
        tracing::debug!(
            transformer = choice.transformer_id,
            url = %input,
            attached = handle.is_attached(),
            "bound rewrite to tag"
        );
        let original = tag.raw().to_vec();
        let render_input = input.clone();
        let render = Box::new(move |rewritten: &str| {
            let mut tag = tag;
            tag.set_attr(choice.attr, &relativize(&reference, &render_input, rewritten));
            Token::StartTag(tag).to_bytes()
        });
        out.push(Piece::Pending(PendingRewrite::new(
            choice.transformer_id,
            input,
            original,
            handle,
            render,
        )));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::html::Lexer;

    fn tag(html: &str) -> Tag {
        match Lexer::new().feed(html.as_bytes()).remove(0) {
            Token::StartTag(tag) => tag,
            other => panic!("expected start tag, got {other:?}"),
        }
    }

    fn options(filters: &[&str]) -> RewriteOptions {
        RewriteOptions {
            enabled_filters: filters.iter().map(|f| f.to_string()).collect(),
            ..RewriteOptions::default()
        }
    }

    #[test]
    fn minifiers_win_over_cache_extension() {
        let all = options(&[FILTER_REWRITE_CSS, FILTER_REWRITE_JAVASCRIPT, FILTER_EXTEND_CACHE]);
        let css = ResourceTagFilter::choose(&tag(r#"<link rel="stylesheet" href="a.css">"#), &all);
        assert_eq!(css.map(|c| c.transformer_id), Some("cf"));
        let js = ResourceTagFilter::choose(&tag(r#"<script src="a.js">"#), &all);
        assert_eq!(js.map(|c| c.transformer_id), Some("jm"));
        let img = ResourceTagFilter::choose(&tag(r#"<img src="a.png">"#), &all);
        assert_eq!(img.map(|c| (c.attr, c.transformer_id)), Some(("src", "ce")));
    }

    #[test]
    fn cache_extension_alone() {
        let extend = options(&[FILTER_EXTEND_CACHE]);
        let css = ResourceTagFilter::choose(&tag(r#"<link rel="Alternate StyleSheet" href="a.css">"#), &extend);
        assert_eq!(css.map(|c| c.transformer_id), Some("ce"));
        assert!(ResourceTagFilter::choose(&tag(r#"<link rel="icon" href="a.ico">"#), &extend).is_none());
        assert!(ResourceTagFilter::choose(&tag("<script>"), &extend).is_none());
        assert!(ResourceTagFilter::choose(&tag(r#"<img src="a.png">"#), &options(&[])).is_none());
    }
}
