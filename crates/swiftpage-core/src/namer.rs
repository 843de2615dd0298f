//! Encoding and decoding of rewritten resource names.
//!
//! A rewritten resource lives next to its inputs under a leaf of the form
//!
//! ```text
//! <original>[+<original>...].pagespeed.<filter_id>.<hash>.<ext>
//! ```
//!
//! Originals are paths relative to the shared directory of all inputs.
//! Characters that would change the meaning of the leaf are escaped with a
//! comma:
//!
//! | Char | Escape |
//! |------|--------|
//! | `,`  | `,,`   |
//! | `/`  | `,_`   |
//! | `?`  | `,q`   |
//! | `&`  | `,a`   |
//! | `+`  | `,P`   |
//! | `#`  | `,h`   |
//! | other unsafe bytes | `,xHH` |
//!
//! Decoding accepts `,xHH` for any byte, so several encodings may decode
//! to the same name.

use crate::error::{Error, Result};
use crate::hasher::is_web64;
use std::fmt;

/// Marker segment separating the original name from the rewrite fields.
pub const PAGESPEED_MARKER: &str = "pagespeed";

const SAFE_PUNCTUATION: &[u8] = b"-._~!$'()*;=:@%";

/// The decoded leaf of a rewritten URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceNamer {
    /// Id of the transformer that produced the resource.
    pub id: String,
    /// Content hash of the output.
    pub hash: String,
    /// Names of the inputs, relative to the leaf's directory.
    pub originals: Vec<String>,
    /// Output extension; authoritative for the served content type.
    pub ext: String,
}

impl ResourceNamer {
    /// Creates a namer.
    pub fn new(
        id: impl Into<String>,
        hash: impl Into<String>,
        originals: Vec<String>,
        ext: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            hash: hash.into(),
            originals,
            ext: ext.into(),
        }
    }

    /// Encodes the namer into a URL leaf.
    pub fn encode(&self) -> Result<String> {
        if !is_valid_id(&self.id) {
            return Err(Error::decode(format!("invalid filter id {:?}", self.id)));
        }
        if self.hash.is_empty() || !is_web64(&self.hash) {
            return Err(Error::decode(format!("invalid hash {:?}", self.hash)));
        }
        if !is_valid_ext(&self.ext) {
            return Err(Error::decode(format!("invalid extension {:?}", self.ext)));
        }
        if self.originals.is_empty() || self.originals.iter().any(String::is_empty) {
            return Err(Error::decode("empty original name"));
        }

        let name = self
            .originals
            .iter()
            .map(|o| escape(o))
            .collect::<Vec<_>>()
            .join("+");
        Ok(format!(
            "{name}.{PAGESPEED_MARKER}.{}.{}.{}",
            self.id, self.hash, self.ext
        ))
    }

    /// Decodes a URL leaf, accepting any well-formed filter id.
    pub fn decode(leaf: &str, max_hash_len: usize) -> Result<Self> {
        Self::decode_with(leaf, max_hash_len, |_| true)
    }

    /// Decodes a URL leaf, rejecting filter ids for which `is_known`
    /// returns false.
    pub fn decode_with(
        leaf: &str,
        max_hash_len: usize,
        is_known: impl Fn(&str) -> bool,
    ) -> Result<Self> {
        let mut parts = leaf.rsplitn(5, '.');
        let (Some(ext), Some(hash), Some(id), Some(marker), Some(name)) = (
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
            parts.next(),
        ) else {
            return Err(Error::decode(format!("{leaf:?} is not a rewritten name")));
        };

        if marker != PAGESPEED_MARKER {
            return Err(Error::decode(format!("{leaf:?} is not a rewritten name")));
        }
        if !is_valid_id(id) || !is_known(id) {
            return Err(Error::decode(format!("unknown filter id {id:?}")));
        }
        if hash.is_empty() || hash.len() > max_hash_len || !is_web64(hash) {
            return Err(Error::decode(format!("invalid hash {hash:?}")));
        }
        if !is_valid_ext(ext) {
            return Err(Error::decode(format!("invalid extension {ext:?}")));
        }
        if name.is_empty() {
            return Err(Error::decode("empty original name"));
        }

        let originals = name
            .split('+')
            .map(unescape)
            .collect::<Result<Vec<_>>>()?;
        if originals.iter().any(String::is_empty) {
            return Err(Error::decode("empty original name"));
        }

        Ok(Self {
            id: id.to_string(),
            hash: hash.to_string(),
            originals,
            ext: ext.to_string(),
        })
    }
}

/// A fully qualified rewritten URL: the inputs' directory plus a
/// [`ResourceNamer`] leaf.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RewrittenUrl {
    /// Directory prefix including the trailing `/`.
    pub base: String,
    /// The decoded leaf.
    pub namer: ResourceNamer,
}

impl RewrittenUrl {
    /// Builds the rewritten URL for `inputs`, which must share an origin.
    pub fn for_inputs(
        inputs: &[&str],
        id: &str,
        hash: &str,
        ext: &str,
    ) -> Result<Self> {
        let base = common_base(inputs)?;
        let originals = inputs
            .iter()
            .map(|url| url[base.len()..].to_string())
            .collect();
        Ok(Self {
            base,
            namer: ResourceNamer::new(id, hash, originals, ext),
        })
    }

    /// Parses a URL whose leaf is a rewritten name. Any query string on the
    /// request is ignored.
    pub fn parse(url: &str, max_hash_len: usize, is_known: impl Fn(&str) -> bool) -> Result<Self> {
        let without_query = url.split_once('?').map_or(url, |(path, _)| path);
        let slash = without_query
            .rfind('/')
            .ok_or_else(|| Error::InvalidUrl(url.to_string()))?;
        let (base, leaf) = without_query.split_at(slash + 1);
        let namer = ResourceNamer::decode_with(leaf, max_hash_len, is_known)?;
        Ok(Self {
            base: base.to_string(),
            namer,
        })
    }

    /// Returns the absolute URLs of the inputs.
    pub fn input_urls(&self) -> Vec<String> {
        self.namer
            .originals
            .iter()
            .map(|o| format!("{}{o}", self.base))
            .collect()
    }

    /// Renders the URL.
    pub fn to_url(&self) -> Result<String> {
        Ok(format!("{}{}", self.base, self.namer.encode()?))
    }

    /// Replaces the directory prefix, used when mapping outputs onto a
    /// rewrite domain.
    pub fn with_base(mut self, base: impl Into<String>) -> Self {
        self.base = base.into();
        self
    }
}

impl fmt::Display for RewrittenUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.namer.encode() {
            Ok(leaf) => write!(f, "{}{leaf}", self.base),
            Err(_) => write!(f, "{}<invalid>", self.base),
        }
    }
}

/// Returns true if the URL's leaf looks like a rewritten name.
pub fn is_rewritten_url(url: &str) -> bool {
    let path = url.split_once('?').map_or(url, |(path, _)| path);
    let leaf = path.rsplit('/').next().unwrap_or(path);
    ResourceNamer::decode(leaf, usize::MAX).is_ok()
}

/// Returns true if `id` is two or three ASCII alphanumerics.
pub fn is_valid_id(id: &str) -> bool {
    (2..=3).contains(&id.len()) && id.bytes().all(|b| b.is_ascii_alphanumeric())
}

fn is_valid_ext(ext: &str) -> bool {
    (1..=8).contains(&ext.len()) && ext.bytes().all(|b| b.is_ascii_alphanumeric())
}

fn common_base(inputs: &[&str]) -> Result<String> {
    let first = inputs
        .first()
        .ok_or_else(|| Error::decode("no inputs to name"))?;
    let origin_len = origin_prefix_len(first)?;

    let mut base = directory_of(first);
    for url in &inputs[1..] {
        if origin_prefix_len(url)? != origin_len || url[..origin_len] != first[..origin_len] {
            return Err(Error::InvalidUrl(format!(
                "{url} does not share an origin with {first}"
            )));
        }
        let dir = directory_of(url);
        let shared = base
            .bytes()
            .zip(dir.bytes())
            .take_while(|(a, b)| a == b)
            .count();
        base.truncate(shared);
        match base.rfind('/') {
            Some(slash) => base.truncate(slash + 1),
            None => base.clear(),
        }
    }

    if base.len() < origin_len {
        return Err(Error::InvalidUrl(first.to_string()));
    }
    Ok(base)
}

/// Length of `scheme://host[:port]/`.
fn origin_prefix_len(url: &str) -> Result<usize> {
    let scheme_end = url
        .find("://")
        .ok_or_else(|| Error::InvalidUrl(url.to_string()))?
        + 3;
    let path_start = url[scheme_end..]
        .find('/')
        .ok_or_else(|| Error::InvalidUrl(url.to_string()))?;
    Ok(scheme_end + path_start + 1)
}

fn directory_of(url: &str) -> String {
    let path = url.split_once('?').map_or(url, |(path, _)| path);
    match path.rfind('/') {
        Some(slash) => path[..=slash].to_string(),
        None => String::new(),
    }
}

fn escape(original: &str) -> String {
    let mut out = String::with_capacity(original.len());
    for b in original.bytes() {
        match b {
            b',' => out.push_str(",,"),
            b'/' => out.push_str(",_"),
            b'?' => out.push_str(",q"),
            b'&' => out.push_str(",a"),
            b'+' => out.push_str(",P"),
            b'#' => out.push_str(",h"),
            b if b.is_ascii_alphanumeric() || SAFE_PUNCTUATION.contains(&b) => out.push(b as char),
            b => out.push_str(&format!(",x{b:02X}")),
        }
    }
    out
}

fn unescape(encoded: &str) -> Result<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b',' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        let code = *bytes
            .get(i + 1)
            .ok_or_else(|| Error::decode("dangling escape"))?;
        match code {
            b',' => out.push(b','),
            b'_' => out.push(b'/'),
            b'q' => out.push(b'?'),
            b'a' => out.push(b'&'),
            b'P' => out.push(b'+'),
            b'h' => out.push(b'#'),
            b'x' => {
                let hex = encoded
                    .get(i + 2..i + 4)
                    .ok_or_else(|| Error::decode("truncated hex escape"))?;
                let value = u8::from_str_radix(hex, 16)
                    .map_err(|_| Error::decode(format!("bad hex escape {hex:?}")))?;
                out.push(value);
                i += 2;
            }
            other => {
                return Err(Error::decode(format!(
                    "unknown escape ,{}",
                    char::from(other)
                )))
            }
        }
        i += 2;
    }
    String::from_utf8(out).map_err(|_| Error::decode("original is not valid UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn namer(originals: &[&str]) -> ResourceNamer {
        ResourceNamer::new(
            "cf",
            "0Ab_",
            originals.iter().map(|s| s.to_string()).collect(),
            "css",
        )
    }

    #[test]
    fn encode_simple() {
        assert_eq!(
            namer(&["a.css"]).encode().unwrap(),
            "a.css.pagespeed.cf.0Ab_.css"
        );
    }

    #[test]
    fn encode_combined_and_path_crossing() {
        assert_eq!(
            namer(&["a.css", "sub/b.css"]).encode().unwrap(),
            "a.css+sub,_b.css.pagespeed.cf.0Ab_.css"
        );
    }

    #[test]
    fn encode_leading_query() {
        let leaf = namer(&["?x=1&y=2"]).encode().unwrap();
        assert_eq!(leaf, ",qx=1,ay=2.pagespeed.cf.0Ab_.css");
        assert_eq!(ResourceNamer::decode(&leaf, 32).unwrap(), namer(&["?x=1&y=2"]));
    }

    #[test]
    fn decode_roundtrip_with_dots_in_name() {
        let n = namer(&["jquery.min.1.2.js"]);
        let leaf = n.encode().unwrap();
        assert_eq!(ResourceNamer::decode(&leaf, 32).unwrap(), n);
    }

    #[test]
    fn alternate_encoding_decodes_to_same_name() {
        let a = ResourceNamer::decode("sub,_a.css.pagespeed.cf.0Ab_.css", 32).unwrap();
        let b = ResourceNamer::decode("sub,x2Fa.css.pagespeed.cf.0Ab_.css", 32).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn decode_rejects_unknown_id() {
        let result =
            ResourceNamer::decode_with("a.css.pagespeed.zz.0Ab_.css", 32, |id| id == "cf");
        assert!(result.is_err());
    }

    #[test]
    fn decode_rejects_long_hash() {
        assert!(ResourceNamer::decode("a.css.pagespeed.cf.0123456789.css", 4).is_err());
        assert!(ResourceNamer::decode("a.css.pagespeed.cf.0123.css", 4).is_ok());
    }

    #[test]
    fn decode_rejects_malformed() {
        for leaf in [
            "a.css",
            "a.css.notspeed.cf.0Ab_.css",
            ".pagespeed.cf.0Ab_.css",
            "a,.css.pagespeed.cf.0Ab_.css",
            "a,x.css.pagespeed.cf.0Ab_.css",
            "a,xFF.pagespeed.cf.0Ab_.css",
            "a.css.pagespeed.toolong.0Ab_.css",
            "a.css.pagespeed.cf.0A.b.css",
            "a+.pagespeed.cf.0Ab_.css",
        ] {
            assert!(ResourceNamer::decode(leaf, 32).is_err(), "{leaf} decoded");
        }
    }

    #[test]
    fn encode_rejects_empty_original() {
        assert!(namer(&[]).encode().is_err());
        assert!(namer(&[""]).encode().is_err());
    }

    #[test]
    fn rewritten_url_for_single_input() {
        let url =
            RewrittenUrl::for_inputs(&["http://test.com/dir/a.css?v=1"], "cf", "HASH", "css")
                .unwrap();
        assert_eq!(url.base, "http://test.com/dir/");
        assert_eq!(
            url.to_url().unwrap(),
            "http://test.com/dir/a.css,qv=1.pagespeed.cf.HASH.css"
        );
        assert_eq!(url.input_urls(), vec!["http://test.com/dir/a.css?v=1"]);
    }

    #[test]
    fn rewritten_url_for_combined_inputs() {
        let url = RewrittenUrl::for_inputs(
            &["http://test.com/dir/a.css", "http://test.com/dir/sub/b.css"],
            "cc",
            "HASH",
            "css",
        )
        .unwrap();
        assert_eq!(url.base, "http://test.com/dir/");
        assert_eq!(url.namer.originals, vec!["a.css", "sub/b.css"]);
    }

    #[test]
    fn rewritten_url_rejects_cross_origin() {
        let result = RewrittenUrl::for_inputs(
            &["http://a.com/a.css", "http://b.com/b.css"],
            "cc",
            "HASH",
            "css",
        );
        assert!(result.is_err());
    }

    #[test]
    fn parse_ignores_request_query() {
        let url = RewrittenUrl::parse(
            "http://test.com/a.css.pagespeed.cf.HASH.css?cb=1",
            32,
            |_| true,
        )
        .unwrap();
        assert_eq!(url.input_urls(), vec!["http://test.com/a.css"]);
    }

    #[test]
    fn detects_rewritten_urls() {
        assert!(is_rewritten_url("http://test.com/a.css.pagespeed.ce.0.css"));
        assert!(!is_rewritten_url("http://test.com/a.css"));
    }
}
