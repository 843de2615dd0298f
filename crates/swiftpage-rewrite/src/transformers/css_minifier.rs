//! CSS minification.
//!
//! Comments are removed and whitespace is collapsed. Whitespace next to
//! `{`, `}`, `;` and `,` and after `:` is dropped, as is the last `;` of
//! a block. Strings are copied verbatim. A space before `:` is kept since
//! it separates a descendant selector from a pseudo-class.

use crate::transformer::{TransformInput, TransformOutput, TransformResult, Transformer, TransformerKind};
use bytes::Bytes;
use swiftpage_core::{ContentKind, ContentType, RewriteOptions};

/// Minifies stylesheets.
#[derive(Debug, Clone, Copy, Default)]
pub struct CssMinifier;

fn drops_space_before(c: char) -> bool {
    matches!(c, '{' | '}' | ';' | ',')
}

fn drops_space_after(c: char) -> bool {
    matches!(c, '{' | '}' | ';' | ',' | ':')
}

fn push_token(out: &mut String, pending_space: &mut bool, c: char) {
    if std::mem::take(pending_space) {
        if let Some(last) = out.chars().next_back() {
            if !drops_space_before(c) && !drops_space_after(last) {
                out.push(' ');
            }
        }
    }
}

/// Minifies a stylesheet. Fails on unterminated comments or strings and
/// unbalanced braces.
pub fn minify_css(input: &str) -> Result<String, String> {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut depth: i64 = 0;
    let mut pending_space = false;

    while let Some(c) = chars.next() {
        match c {
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = '\0';
                let mut closed = false;
                for c in chars.by_ref() {
                    if prev == '*' && c == '/' {
                        closed = true;
                        break;
                    }
                    prev = c;
                }
                if !closed {
                    return Err("unterminated comment".to_string());
                }
                pending_space = true;
            }
            '"' | '\'' => {
                push_token(&mut out, &mut pending_space, c);
                out.push(c);
                let mut closed = false;
                while let Some(s) = chars.next() {
                    out.push(s);
                    if s == '\\' {
                        if let Some(escaped) = chars.next() {
                            out.push(escaped);
                        }
                    } else if s == c {
                        closed = true;
                        break;
                    } else if s == '\n' {
                        break;
                    }
                }
                if !closed {
                    return Err("unterminated string".to_string());
                }
            }
            c if c.is_whitespace() => pending_space = true,
            c => {
                push_token(&mut out, &mut pending_space, c);
                match c {
                    '{' => depth += 1,
                    '}' => {
                        depth -= 1;
                        if depth < 0 {
                            return Err("unbalanced braces".to_string());
                        }
                        if out.ends_with(';') {
                            out.pop();
                        }
                    }
                    _ => {}
                }
                out.push(c);
            }
        }
    }

    if depth != 0 {
        return Err("unbalanced braces".to_string());
    }
    Ok(out)
}

impl Transformer for CssMinifier {
    fn id(&self) -> &'static str {
        "cf"
    }

    fn kind(&self) -> TransformerKind {
        TransformerKind::Cached
    }

    fn accepts(&self, content_type: &ContentType) -> bool {
        content_type.kind() == ContentKind::Css
    }

    fn run(&self, inputs: &[TransformInput], _options: &RewriteOptions) -> TransformResult {
        let [input] = inputs else {
            return TransformResult::Error(format!("expected one input, got {}", inputs.len()));
        };
        let Ok(text) = std::str::from_utf8(&input.body) else {
            return TransformResult::Error("stylesheet is not utf-8".to_string());
        };
        match minify_css(text) {
            Ok(minified) if minified.len() < text.len() => TransformResult::Ok(TransformOutput {
                body: Bytes::from(minified),
                content_type: ContentType::css(),
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

    fn run(css: &str) -> TransformResult {
        let input = TransformInput {
            url: "http://test.com/a.css".to_string(),
            content_type: ContentType::css(),
            body: Bytes::from(css.to_string()),
        };
        CssMinifier.run(&[input], &RewriteOptions::default())
    }

    #[test]
    fn minifies_rules() {
        assert_eq!(minify_css("* { display: none; }").unwrap(), "*{display:none}");
        assert_eq!(
            minify_css("a , b  {\n  color : red ;\n  margin: 0 auto;\n}\n").unwrap(),
            "a,b{color :red;margin:0 auto}"
        );
        assert_eq!(
            minify_css("/* header */\n@media screen { a { b: c } }").unwrap(),
            "@media screen{a{b:c}}"
        );
    }

    #[test]
    fn keeps_meaningful_spaces() {
        assert_eq!(minify_css("a :hover{x:y}").unwrap(), "a :hover{x:y}");
        assert_eq!(
            minify_css("a{width: calc(1px + 2px)}").unwrap(),
            "a{width:calc(1px + 2px)}"
        );
    }

    #[test]
    fn strings_are_verbatim() {
        assert_eq!(
            minify_css("a { content: \"  ;  } \" ; }").unwrap(),
            "a{content:\"  ;  } \"}"
        );
        assert_eq!(
            minify_css("a{b:'it\\'s  '}").unwrap(),
            "a{b:'it\\'s  '}"
        );
    }

    #[test]
    fn malformed_input_is_an_error() {
        assert!(minify_css("a { b: c").is_err());
        assert!(minify_css("a } b").is_err());
        assert!(minify_css("a { b: c } /* open").is_err());
        assert!(minify_css("a { content: \"open }").is_err());
        assert!(matches!(run("a { b: c"), TransformResult::Error(_)));
    }

    #[test]
    fn already_minified_is_unoptimizable() {
        assert_eq!(run("a{b:c}"), TransformResult::Unoptimizable);
        assert!(matches!(run("a { b: c; }"), TransformResult::Ok(_)));
    }
}
