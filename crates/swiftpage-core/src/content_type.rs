//! Content types recognized by the rewriter.
//!
//! Extensions are authoritative: a rewritten `.css` resource is served as
//! `text/css` regardless of the content type its input declared.

use serde::{Deserialize, Serialize};

/// Broad classification of a content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    /// HTML or XHTML documents.
    Html,
    /// Stylesheets.
    Css,
    /// Scripts.
    JavaScript,
    /// Raster or vector images.
    Image,
    /// Anything else.
    Other,
}

/// A MIME type together with its canonical extension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentType {
    mime: String,
    ext: String,
    kind: ContentKind,
}

const KNOWN: &[(&str, &str, ContentKind)] = &[
    ("text/html", "html", ContentKind::Html),
    ("application/xhtml+xml", "xhtml", ContentKind::Html),
    ("text/css", "css", ContentKind::Css),
    ("text/javascript", "js", ContentKind::JavaScript),
    ("application/javascript", "js", ContentKind::JavaScript),
    ("application/x-javascript", "js", ContentKind::JavaScript),
    ("image/png", "png", ContentKind::Image),
    ("image/jpeg", "jpg", ContentKind::Image),
    ("image/gif", "gif", ContentKind::Image),
    ("image/webp", "webp", ContentKind::Image),
    ("image/svg+xml", "svg", ContentKind::Image),
    ("image/x-icon", "ico", ContentKind::Image),
    ("text/plain", "txt", ContentKind::Other),
    ("application/json", "json", ContentKind::Other),
];

impl ContentType {
    fn known(mime: &str, ext: &str, kind: ContentKind) -> Self {
        Self {
            mime: mime.to_string(),
            ext: ext.to_string(),
            kind,
        }
    }

    /// `text/html`
    pub fn html() -> Self {
        Self::known("text/html", "html", ContentKind::Html)
    }

    /// `text/css`
    pub fn css() -> Self {
        Self::known("text/css", "css", ContentKind::Css)
    }

    /// `text/javascript`
    pub fn javascript() -> Self {
        Self::known("text/javascript", "js", ContentKind::JavaScript)
    }

    /// `image/png`
    pub fn png() -> Self {
        Self::known("image/png", "png", ContentKind::Image)
    }

    /// Looks up a content type by extension (without the dot).
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.to_ascii_lowercase();
        if let Some((mime, canonical, kind)) = KNOWN.iter().find(|(_, e, _)| *e == ext) {
            return Some(Self::known(mime, canonical, *kind));
        }
        if ext == "jpeg" {
            return Some(Self::known("image/jpeg", "jpg", ContentKind::Image));
        }
        mime_guess::from_ext(&ext)
            .first()
            .map(|mime| Self::from_mime_with_ext(mime.essence_str(), &ext))
    }

    /// Looks up a content type from a `Content-Type` header value.
    /// Parameters such as `charset` are ignored.
    pub fn from_mime(value: &str) -> Option<Self> {
        let essence = value.split(';').next()?.trim().to_ascii_lowercase();
        if essence.is_empty() {
            return None;
        }
        if let Some((mime, ext, kind)) = KNOWN.iter().find(|(m, _, _)| *m == essence) {
            return Some(Self::known(mime, ext, *kind));
        }
        let ext = mime_guess::get_mime_extensions_str(&essence)
            .and_then(|exts| exts.first())
            .copied()
            .unwrap_or("bin");
        Some(Self::from_mime_with_ext(&essence, ext))
    }

    /// Guesses the content type of a URL from its path extension.
    pub fn from_url(url: &str) -> Option<Self> {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        let leaf = path.rsplit('/').next().unwrap_or(path);
        let (_, ext) = leaf.rsplit_once('.')?;
        Self::from_extension(ext)
    }

    fn from_mime_with_ext(mime: &str, ext: &str) -> Self {
        let kind = if mime.starts_with("image/") {
            ContentKind::Image
        } else {
            ContentKind::Other
        };
        Self::known(mime, ext, kind)
    }

    /// The MIME type.
    pub fn mime(&self) -> &str {
        &self.mime
    }

    /// The canonical extension, without a dot.
    pub fn ext(&self) -> &str {
        &self.ext
    }

    /// The broad classification.
    pub fn kind(&self) -> ContentKind {
        self.kind
    }

    /// Whether this is an HTML document type.
    pub fn is_html(&self) -> bool {
        self.kind == ContentKind::Html
    }

    /// The `Content-Type` header value to emit for this type.
    pub fn header_value(&self) -> String {
        match self.kind {
            ContentKind::Html | ContentKind::Css | ContentKind::JavaScript => {
                format!("{}; charset=utf-8", self.mime)
            }
            _ => self.mime.clone(),
        }
    }
}
