//! Streaming HTML tokenizer.
//!
//! The lexer accepts arbitrary chunks and emits every token it can complete.
//! A construct split across chunks (a tag, a comment, the end of a script)
//! stays buffered until the rest arrives. Unmodified tokens serialize to
//! exactly the bytes they were parsed from, so a document nobody rewrites
//! passes through byte for byte.

use std::fmt;

/// Elements whose content is not markup.
const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style", "textarea", "title", "xmp"];

/// One attribute of a start tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// Lowercased name.
    pub name: String,
    /// Value as written, without quotes. `None` for a bare attribute.
    pub value: Option<String>,
    /// The quote character used, if any.
    pub quote: Option<u8>,
}

/// A start tag.
#[derive(Clone, PartialEq, Eq)]
pub struct Tag {
    name: String,
    attrs: Vec<Attribute>,
    self_closing: bool,
    raw: Vec<u8>,
    modified: bool,
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tag")
            .field("name", &self.name)
            .field("attrs", &self.attrs)
            .field("self_closing", &self.self_closing)
            .field("modified", &self.modified)
            .finish()
    }
}

impl Tag {
    /// Lowercased element name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attributes in source order.
    pub fn attrs(&self) -> &[Attribute] {
        &self.attrs
    }

    /// Whether the tag ended with `/>`.
    pub fn is_self_closing(&self) -> bool {
        self.self_closing
    }

    /// Value of the first attribute called `name`.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
            .and_then(|a| a.value.as_deref())
    }

    /// Whether an attribute called `name` is present.
    pub fn has_attr(&self, name: &str) -> bool {
        self.attrs.iter().any(|a| a.name.eq_ignore_ascii_case(name))
    }

    /// Sets an attribute, replacing the first one with the same name.
    pub fn set_attr(&mut self, name: &str, value: &str) {
        self.modified = true;
        match self
            .attrs
            .iter_mut()
            .find(|a| a.name.eq_ignore_ascii_case(name))
        {
            Some(attr) => attr.value = Some(value.to_string()),
            None => self.attrs.push(Attribute {
                name: name.to_ascii_lowercase(),
                value: Some(value.to_string()),
                quote: Some(b'"'),
            }),
        }
    }

    /// Whether an attribute was changed since parsing.
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// The bytes the tag was parsed from.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Appends the tag's serialization to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        if !self.modified {
            out.extend_from_slice(&self.raw);
            return;
        }
        out.push(b'<');
        out.extend_from_slice(self.name.as_bytes());
        for attr in &self.attrs {
            out.push(b' ');
            out.extend_from_slice(attr.name.as_bytes());
            let Some(value) = &attr.value else {
                continue;
            };
            out.push(b'=');
            let needs_quotes = value.is_empty()
                || value
                    .bytes()
                    .any(|b| b.is_ascii_whitespace() || matches!(b, b'"' | b'\'' | b'>' | b'='));
            match attr.quote.or(needs_quotes.then_some(b'"')) {
                Some(quote) => {
                    out.push(quote);
                    for b in value.bytes() {
                        if b == quote {
                            out.extend_from_slice(if quote == b'"' { b"&quot;" } else { b"&#39;" });
                        } else {
                            out.push(b);
                        }
                    }
                    out.push(quote);
                }
                None => out.extend_from_slice(value.as_bytes()),
            }
        }
        if self.self_closing {
            out.extend_from_slice(b"/>");
        } else {
            out.push(b'>');
        }
    }
}

/// A lexical unit of HTML.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Character data between tags.
    Text(Vec<u8>),
    /// `<name ...>`.
    StartTag(Tag),
    /// `</name>`.
    EndTag {
        /// Lowercased element name.
        name: String,
        /// Source bytes.
        raw: Vec<u8>,
    },
    /// `<!-- ... -->`, delimiters included.
    Comment(Vec<u8>),
    /// `<!DOCTYPE ...>`, `<?...>` and other declarations.
    Directive(Vec<u8>),
    /// Content of a script, style or similar element.
    RawText(Vec<u8>),
}

impl Token {
    /// Appends the token's serialization to `out`.
    pub fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            Token::StartTag(tag) => tag.write_to(out),
            Token::EndTag { raw, .. } => out.extend_from_slice(raw),
            Token::Text(bytes)
            | Token::Comment(bytes)
            | Token::Directive(bytes)
            | Token::RawText(bytes) => out.extend_from_slice(bytes),
        }
    }

    /// The token's serialization.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_to(&mut out);
        out
    }
}

/// An incremental tokenizer.
#[derive(Debug, Default)]
pub struct Lexer {
    buffer: Vec<u8>,
    raw_text_end: Option<String>,
}

impl Lexer {
    /// Creates a lexer at the start of a document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes received but not yet tokenized.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Takes the buffered bytes, leaving the lexer empty.
    pub fn take_buffered(&mut self) -> Vec<u8> {
        self.raw_text_end = None;
        std::mem::take(&mut self.buffer)
    }

    /// Tokenizes as much of `chunk` (after anything buffered) as possible.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Token> {
        self.buffer.extend_from_slice(chunk);
        let mut tokens = Vec::new();
        let consumed = self.scan(&mut tokens);
        self.buffer.drain(..consumed);
        tokens
    }

    /// Ends the document. Incomplete constructs are returned as text.
    pub fn finish(&mut self) -> Vec<Token> {
        let rest = std::mem::take(&mut self.buffer);
        let in_raw_text = self.raw_text_end.take().is_some();
        if rest.is_empty() {
            Vec::new()
        } else if in_raw_text {
            vec![Token::RawText(rest)]
        } else {
            vec![Token::Text(rest)]
        }
    }

    fn scan(&mut self, tokens: &mut Vec<Token>) -> usize {
        let buf = &self.buffer;
        let mut pos = 0;
        while pos < buf.len() {
            if let Some(end_name) = &self.raw_text_end {
                match find_end_tag(buf, pos, end_name) {
                    Some(at) => {
                        if at > pos {
                            tokens.push(Token::RawText(buf[pos..at].to_vec()));
                        }
                        self.raw_text_end = None;
                        pos = at;
                    }
                    None => {
                        // Keep enough to recognize a closing tag split across chunks.
                        let keep = end_name.len() + 2;
                        let safe = buf.len().saturating_sub(keep);
                        if safe > pos {
                            tokens.push(Token::RawText(buf[pos..safe].to_vec()));
                            pos = safe;
                        }
                        return pos;
                    }
                }
                continue;
            }

            let Some(lt) = memchr(b'<', &buf[pos..]).map(|i| pos + i) else {
                tokens.push(Token::Text(buf[pos..].to_vec()));
                return buf.len();
            };
            if lt > pos {
                tokens.push(Token::Text(buf[pos..lt].to_vec()));
                pos = lt;
            }

            match lex_markup(buf, pos) {
                Markup::Incomplete => return pos,
                Markup::NotMarkup => {
                    tokens.push(Token::Text(vec![b'<']));
                    pos += 1;
                }
                Markup::Token(token, end) => {
                    if let Token::StartTag(tag) = &token {
                        if !tag.self_closing && RAW_TEXT_ELEMENTS.contains(&tag.name.as_str()) {
                            self.raw_text_end = Some(tag.name.clone());
                        }
                    }
                    tokens.push(token);
                    pos = end;
                }
            }
        }
        pos
    }
}

enum Markup {
    Token(Token, usize),
    NotMarkup,
    Incomplete,
}

fn memchr(needle: u8, haystack: &[u8]) -> Option<usize> {
    haystack.iter().position(|&b| b == needle)
}

fn find(haystack: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| from + i)
}

/// Finds `</name` followed by a delimiter, case-insensitively.
fn find_end_tag(buf: &[u8], from: usize, name: &str) -> Option<usize> {
    let name = name.as_bytes();
    let mut at = from;
    while let Some(lt) = find(buf, at, b"</") {
        let start = lt + 2;
        let end = start + name.len();
        if end >= buf.len() {
            return None;
        }
        if buf[start..end].eq_ignore_ascii_case(name)
            && (buf[end].is_ascii_whitespace() || matches!(buf[end], b'>' | b'/'))
        {
            return Some(lt);
        }
        at = lt + 1;
    }
    None
}

fn lex_markup(buf: &[u8], lt: usize) -> Markup {
    let Some(&next) = buf.get(lt + 1) else {
        return Markup::Incomplete;
    };
    match next {
        b'!' => {
            let rest = &buf[lt..];
            if rest.len() < 4 && b"<!--".starts_with(rest) {
                return Markup::Incomplete;
            }
            if rest.starts_with(b"<!--") {
                return match find(buf, lt + 4, b"-->") {
                    Some(end) => Markup::Token(Token::Comment(buf[lt..end + 3].to_vec()), end + 3),
                    None => Markup::Incomplete,
                };
            }
            directive(buf, lt)
        }
        b'?' => directive(buf, lt),
        b'/' => match buf.get(lt + 2) {
            None => Markup::Incomplete,
            Some(b) if b.is_ascii_alphabetic() => match memchr(b'>', &buf[lt..]) {
                Some(i) => {
                    let end = lt + i + 1;
                    let inner = &buf[lt + 2..end - 1];
                    let name_len = inner
                        .iter()
                        .position(|b| b.is_ascii_whitespace() || *b == b'/')
                        .unwrap_or(inner.len());
                    let name = String::from_utf8_lossy(&inner[..name_len]).to_ascii_lowercase();
                    Markup::Token(
                        Token::EndTag {
                            name,
                            raw: buf[lt..end].to_vec(),
                        },
                        end,
                    )
                }
                None => Markup::Incomplete,
            },
            Some(_) => Markup::NotMarkup,
        },
        b if b.is_ascii_alphabetic() => match lex_start_tag(buf, lt) {
            Some((tag, end)) => Markup::Token(Token::StartTag(tag), end),
            None => Markup::Incomplete,
        },
        _ => Markup::NotMarkup,
    }
}

fn directive(buf: &[u8], lt: usize) -> Markup {
    match memchr(b'>', &buf[lt..]) {
        Some(i) => {
            let end = lt + i + 1;
            Markup::Token(Token::Directive(buf[lt..end].to_vec()), end)
        }
        None => Markup::Incomplete,
    }
}

fn skip_whitespace(buf: &[u8], mut i: usize) -> usize {
    while i < buf.len() && buf[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

/// Parses `<name attr=value ...>` starting at `lt`. Returns `None` if the
/// tag is not complete yet.
fn lex_start_tag(buf: &[u8], lt: usize) -> Option<(Tag, usize)> {
    let mut i = lt + 1;
    let name_start = i;
    while i < buf.len() && !buf[i].is_ascii_whitespace() && !matches!(buf[i], b'/' | b'>') {
        i += 1;
    }
    let name = String::from_utf8_lossy(&buf[name_start..i]).to_ascii_lowercase();
    let mut attrs = Vec::new();
    let mut self_closing = false;

    let end = loop {
        i = skip_whitespace(buf, i);
        match buf.get(i)? {
            b'>' => break i + 1,
            b'/' => {
                if *buf.get(i + 1)? == b'>' {
                    self_closing = true;
                    break i + 2;
                }
                i += 1;
                continue;
            }
            _ => {}
        }

        let attr_start = i;
        while i < buf.len()
            && !buf[i].is_ascii_whitespace()
            && !matches!(buf[i], b'=' | b'>' | b'/')
        {
            i += 1;
        }
        if i == attr_start {
            // A stray '=' with no name.
            i += 1;
            continue;
        }
        let attr_name = String::from_utf8_lossy(&buf[attr_start..i]).to_ascii_lowercase();
        i = skip_whitespace(buf, i);
        if *buf.get(i)? != b'=' {
            attrs.push(Attribute {
                name: attr_name,
                value: None,
                quote: None,
            });
            continue;
        }
        i = skip_whitespace(buf, i + 1);
        let (value, quote) = match *buf.get(i)? {
            q @ (b'"' | b'\'') => {
                let close = memchr(q, &buf[i + 1..])? + i + 1;
                let value = String::from_utf8_lossy(&buf[i + 1..close]).into_owned();
                i = close + 1;
                (value, Some(q))
            }
            _ => {
                let start = i;
                while i < buf.len() && !buf[i].is_ascii_whitespace() && buf[i] != b'>' {
                    i += 1;
                }
                if i >= buf.len() {
                    return None;
                }
                (String::from_utf8_lossy(&buf[start..i]).into_owned(), None)
            }
        };
        attrs.push(Attribute {
            name: attr_name,
            value: Some(value),
            quote,
        });
    };

    Some((
        Tag {
            name,
            attrs,
            self_closing,
            raw: buf[lt..end].to_vec(),
            modified: false,
        },
        end,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn lex_all(chunks: &[&str]) -> Vec<Token> {
        let mut lexer = Lexer::new();
        let mut tokens = Vec::new();
        for chunk in chunks {
            tokens.extend(lexer.feed(chunk.as_bytes()));
        }
        tokens.extend(lexer.finish());
        tokens
    }

    fn serialize(tokens: &[Token]) -> String {
        let mut out = Vec::new();
        for token in tokens {
            token.write_to(&mut out);
        }
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn tokenizes_basic_document() {
        let tokens = lex_all(&["<!DOCTYPE html><html><!-- c --><p class=x>hi</p></html>"]);
        assert!(matches!(&tokens[0], Token::Directive(_)));
        assert!(matches!(&tokens[1], Token::StartTag(t) if t.name() == "html"));
        assert_eq!(tokens[2], Token::Comment(b"<!-- c -->".to_vec()));
        let Token::StartTag(p) = &tokens[3] else {
            panic!("expected start tag");
        };
        assert_eq!(p.attr("class"), Some("x"));
        assert_eq!(tokens[4], Token::Text(b"hi".to_vec()));
        assert!(matches!(&tokens[5], Token::EndTag { name, .. } if name == "p"));
    }

    #[test]
    fn attributes_keep_their_quoting() {
        let tokens = lex_all(&[r#"<LINK REL=stylesheet href='a.css' disabled>"#]);
        let Token::StartTag(tag) = &tokens[0] else {
            panic!("expected start tag");
        };
        assert_eq!(tag.name(), "link");
        assert_eq!(
            tag.attrs(),
            &[
                Attribute {
                    name: "rel".into(),
                    value: Some("stylesheet".into()),
                    quote: None
                },
                Attribute {
                    name: "href".into(),
                    value: Some("a.css".into()),
                    quote: Some(b'\'')
                },
                Attribute {
                    name: "disabled".into(),
                    value: None,
                    quote: None
                },
            ]
        );
    }

    #[test]
    fn modified_tag_is_rebuilt() {
        let tokens = lex_all(&[r#"<img  src='a.png'   alt=x />"#]);
        let Token::StartTag(mut tag) = tokens[0].clone() else {
            panic!("expected start tag");
        };
        assert_eq!(serialize(&tokens), r#"<img  src='a.png'   alt=x />"#);
        tag.set_attr("src", "a.png.pagespeed.ce.0.png");
        assert_eq!(
            String::from_utf8(Token::StartTag(tag).to_bytes()).unwrap(),
            r#"<img src='a.png.pagespeed.ce.0.png' alt=x/>"#
        );
    }

    #[test]
    fn constructs_split_across_chunks() {
        let tokens = lex_all(&["<scr", "ipt src=\"a", ".js\"></scr", "ipt><!-", "- x --", ">"]);
        let Token::StartTag(script) = &tokens[0] else {
            panic!("expected start tag");
        };
        assert_eq!(script.attr("src"), Some("a.js"));
        assert!(matches!(&tokens[1], Token::EndTag { name, .. } if name == "script"));
        assert_eq!(tokens[2], Token::Comment(b"<!-- x -->".to_vec()));
    }

    #[test]
    fn script_content_is_raw_text() {
        let html = "<script>if (a<b) { x = '<p>'; }</script><p>";
        let tokens = lex_all(&[html]);
        assert_eq!(
            tokens[1],
            Token::RawText(b"if (a<b) { x = '<p>'; }".to_vec())
        );
        assert!(matches!(&tokens[2], Token::EndTag { name, .. } if name == "script"));
        assert_eq!(serialize(&tokens), html);
    }

    #[test]
    fn stray_angle_brackets_are_text() {
        let html = "a < b <3 </ c";
        assert_eq!(serialize(&lex_all(&[html])), html);
    }

    #[test]
    fn unterminated_tag_is_flushed_as_text_at_end() {
        let mut lexer = Lexer::new();
        assert!(lexer.feed(b"<p>ok<a href=\"x").len() == 2);
        assert_eq!(lexer.buffered(), b"<a href=\"x");
        assert_eq!(lexer.finish(), vec![Token::Text(b"<a href=\"x".to_vec())]);
    }

    proptest! {
        #[test]
        fn unmodified_documents_round_trip(
            html in "[<>a-z =\"'/!-]{0,64}",
            split in 0usize..64,
        ) {
            let split = split.min(html.len());
            let (a, b) = html.split_at(split);
            prop_assert_eq!(serialize(&lex_all(&[a, b])), html);
        }
    }
}
