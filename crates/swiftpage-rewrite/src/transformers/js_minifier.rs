//! JavaScript minification.
//!
//! Removes comments and redundant whitespace. Line breaks are kept (one
//! per run of blank lines) so automatic semicolon insertion behaves as in
//! the original. String, template and regular expression literals are
//! copied verbatim.

use crate::transformer::{TransformInput, TransformOutput, TransformResult, Transformer, TransformerKind};
use bytes::Bytes;
use swiftpage_core::{ContentKind, ContentType, RewriteOptions};

/// Minifies scripts.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsMinifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Gap {
    None,
    Space,
    Newline,
}

fn is_ident(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$' || !c.is_ascii()
}

fn needs_space(prev: char, next: char) -> bool {
    (is_ident(prev) && is_ident(next)) || (prev == next && matches!(prev, '+' | '-'))
}

/// A `/` starts a regular expression rather than a division after these.
fn regex_may_follow(prev: Option<char>) -> bool {
    match prev {
        None => true,
        Some(c) => "(,=:[!&|?{};+-*%<>~^\n".contains(c),
    }
}

fn close_gap(out: &mut String, gap: Gap, next: char) {
    let Some(prev) = out.chars().next_back() else {
        return;
    };
    match gap {
        Gap::None => {}
        Gap::Newline => out.push('\n'),
        Gap::Space => {
            if needs_space(prev, next) {
                out.push(' ');
            }
        }
    }
}

/// Minifies a script. Fails on unterminated comments and literals.
pub fn minify_js(input: &str) -> Result<String, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut out = String::with_capacity(input.len());
    let mut gap = Gap::None;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if c == '/' && next == Some('/') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }
        if c == '/' && next == Some('*') {
            let start = i + 2;
            let end = (start..chars.len().saturating_sub(1))
                .find(|&j| chars[j] == '*' && chars[j + 1] == '/')
                .ok_or_else(|| "unterminated comment".to_string())?;
            let spans_lines = chars[start..end].contains(&'\n');
            gap = gap.max(if spans_lines { Gap::Newline } else { Gap::Space });
            i = end + 2;
            continue;
        }
        if c.is_whitespace() {
            gap = gap.max(if c == '\n' || c == '\r' {
                Gap::Newline
            } else {
                Gap::Space
            });
            i += 1;
            continue;
        }

        close_gap(&mut out, std::mem::replace(&mut gap, Gap::None), c);

        if matches!(c, '"' | '\'' | '`') {
            i = copy_literal(&chars, i, &mut out, c, c == '`')?;
        } else if c == '/' && regex_may_follow(out.chars().next_back()) {
            i = copy_regex(&chars, i, &mut out)?;
        } else {
            out.push(c);
            i += 1;
        }
    }
    Ok(out)
}

/// Copies a quoted literal starting at `start`; returns the index after
/// the closing quote.
fn copy_literal(
    chars: &[char],
    start: usize,
    out: &mut String,
    quote: char,
    multiline: bool,
) -> Result<usize, String> {
    out.push(quote);
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        out.push(c);
        if c == '\\' {
            if let Some(&escaped) = chars.get(i + 1) {
                out.push(escaped);
            }
            i += 2;
            continue;
        }
        if c == quote {
            return Ok(i + 1);
        }
        if c == '\n' && !multiline {
            break;
        }
        i += 1;
    }
    Err("unterminated string".to_string())
}

/// Copies a regular expression literal starting at `start`.
fn copy_regex(chars: &[char], start: usize, out: &mut String) -> Result<usize, String> {
    out.push('/');
    let mut i = start + 1;
    let mut in_class = false;
    while i < chars.len() {
        let c = chars[i];
        out.push(c);
        match c {
            '\\' => {
                if let Some(&escaped) = chars.get(i + 1) {
                    out.push(escaped);
                }
                i += 2;
                continue;
            }
            '[' => in_class = true,
            ']' => in_class = false,
            '/' if !in_class => return Ok(i + 1),
            '\n' => break,
            _ => {}
        }
        i += 1;
    }
    Err("unterminated regular expression".to_string())
}

impl Transformer for JsMinifier {
    fn id(&self) -> &'static str {
        "jm"
    }

    fn kind(&self) -> TransformerKind {
        TransformerKind::Cached
    }

    fn accepts(&self, content_type: &ContentType) -> bool {
        content_type.kind() == ContentKind::JavaScript
    }

    fn run(&self, inputs: &[TransformInput], _options: &RewriteOptions) -> TransformResult {
        let [input] = inputs else {
            return TransformResult::Error(format!("expected one input, got {}", inputs.len()));
        };
        let Ok(text) = std::str::from_utf8(&input.body) else {
            return TransformResult::Error("script is not utf-8".to_string());
        };
        match minify_js(text) {
            Ok(minified) if minified.len() < text.len() => TransformResult::Ok(TransformOutput {
                body: Bytes::from(minified),
                content_type: ContentType::javascript(),
            }),
            Ok(_) => TransformResult::Unoptimizable,
            Err(e) => TransformResult::Error(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn strips_comments_and_whitespace() {
        let js = "// leading\nvar a = 1;   /* inline */ var b = a + 2;\n\n\nfunction f ( x ) {\n  return x ;\n}\n";
        assert_eq!(
            minify_js(js).unwrap(),
            "var a=1;var b=a+2;\nfunction f(x){\nreturn x;\n}"
        );
    }

    #[test]
    fn keeps_required_spaces() {
        assert_eq!(minify_js("a + +b").unwrap(), "a+ +b");
        assert_eq!(minify_js("a - -b").unwrap(), "a- -b");
        assert_eq!(minify_js("typeof  x").unwrap(), "typeof x");
    }

    #[test]
    fn literals_are_verbatim() {
        assert_eq!(
            minify_js("var s = \"a  // not a comment\";").unwrap(),
            "var s=\"a  // not a comment\";"
        );
        assert_eq!(
            minify_js("var t = `line\n  two`;").unwrap(),
            "var t=`line\n  two`;"
        );
        assert_eq!(
            minify_js("var r = /a\\/\\/b [/]/g;").unwrap(),
            "var r=/a\\/\\/b [/]/g;"
        );
        assert_eq!(minify_js("x = a / b / c").unwrap(), "x=a/b/c");
    }

    #[test]
    fn unterminated_input_is_an_error() {
        assert!(minify_js("var s = 'open").is_err());
        assert!(minify_js("/* open").is_err());
        assert!(minify_js("var r = /open").is_err());
    }

    #[test]
    fn transformer_declines_minified_input() {
        let input = TransformInput {
            url: "http://test.com/a.js".to_string(),
            content_type: ContentType::javascript(),
            body: Bytes::from("var a=1;"),
        };
        assert_eq!(
            JsMinifier.run(&[input], &RewriteOptions::default()),
            TransformResult::Unoptimizable
        );
    }
}
