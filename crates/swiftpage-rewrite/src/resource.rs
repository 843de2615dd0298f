//! Input resources.
//!
//! A [`Resource`] names an input: either a URL fetched through the HTTP
//! cache or a `data:` URL carrying its bytes inline. Loading a resource
//! yields a [`LoadedResource`] with headers, body and caching properties.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use once_cell::sync::OnceCell;
use swiftpage_core::{ContentType, Hasher, RewriteErrorKind, TimestampMs};
use swiftpage_http::{compute_caching, names, CachingInfo, HttpValue, ResponseHeaders};

/// An input to a rewrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    /// Fetched from its URL.
    Url(String),
    /// Carried inline in a `data:` URL.
    Data {
        /// The full `data:` URL.
        url: String,
        /// The declared media type.
        content_type: ContentType,
        /// The decoded payload.
        body: Bytes,
    },
}

impl Resource {
    /// Creates a resource for an absolute URL, decoding `data:` URLs.
    pub fn new(url: &str) -> Result<Self, RewriteErrorKind> {
        if url.starts_with("data:") {
            return parse_data_url(url).ok_or(RewriteErrorKind::DecodeInvalid);
        }
        Ok(Self::Url(url.to_string()))
    }

    /// The resource's URL.
    pub fn url(&self) -> &str {
        match self {
            Self::Url(url) | Self::Data { url, .. } => url,
        }
    }

    /// Whether the payload is inline.
    pub fn is_inline(&self) -> bool {
        matches!(self, Self::Data { .. })
    }
}

fn parse_data_url(url: &str) -> Option<Resource> {
    let rest = url.strip_prefix("data:")?;
    let (meta, payload) = rest.split_once(',')?;
    let (mime, base64) = match meta.strip_suffix(";base64") {
        Some(mime) => (mime, true),
        None => (meta, false),
    };
    let mime = if mime.is_empty() { "text/plain" } else { mime };
    let content_type = ContentType::from_mime(mime)?;
    let body = if base64 {
        STANDARD.decode(payload).ok()?
    } else {
        percent_decode(payload)?
    };
    Some(Resource::Data {
        url: url.to_string(),
        content_type,
        body: Bytes::from(body),
    })
}

fn percent_decode(s: &str) -> Option<Vec<u8>> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = s.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Some(out)
}

/// A resource whose response is available.
#[derive(Debug, Clone)]
pub struct LoadedResource {
    url: String,
    value: HttpValue,
    content_type: Option<ContentType>,
    caching: CachingInfo,
    fingerprint: OnceCell<String>,
}

impl LoadedResource {
    /// Wraps a fetched or cached response.
    pub fn new(url: impl Into<String>, value: HttpValue, implicit_ttl_ms: i64, now_ms: TimestampMs) -> Self {
        let url = url.into();
        let caching = compute_caching(&value.headers, implicit_ttl_ms, now_ms);
        let content_type = value
            .headers
            .content_type()
            .and_then(ContentType::from_mime)
            .or_else(|| ContentType::from_url(&url));
        Self {
            url,
            value,
            content_type,
            caching,
            fingerprint: OnceCell::new(),
        }
    }

    /// Materializes an inline resource. Inline payloads never expire.
    pub fn inline(resource: &Resource, now_ms: TimestampMs) -> Option<Self> {
        let Resource::Data {
            url,
            content_type,
            body,
        } = resource
        else {
            return None;
        };
        let mut headers = ResponseHeaders::ok(&content_type.header_value());
        headers.set(names::CACHE_CONTROL, format!("max-age={}", i64::MAX / 1000 / 2));
        let value = HttpValue::new(headers, body.clone());
        let mut loaded = Self::new(url.clone(), value, 0, now_ms);
        loaded.content_type = Some(content_type.clone());
        Some(loaded)
    }

    /// The resource URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Response headers.
    pub fn headers(&self) -> &ResponseHeaders {
        &self.value.headers
    }

    /// Response body.
    pub fn body(&self) -> &Bytes {
        &self.value.body
    }

    /// The full response.
    pub fn value(&self) -> &HttpValue {
        &self.value
    }

    /// Content type from the response, or from the URL's extension.
    pub fn content_type(&self) -> Option<&ContentType> {
        self.content_type.as_ref()
    }

    /// Whether the response status is `200`. Other responses never feed
    /// a transformer.
    pub fn is_ok(&self) -> bool {
        self.value.headers.status_code() == 200
    }

    /// Freshness of the response.
    pub fn caching(&self) -> &CachingInfo {
        &self.caching
    }

    /// When the response expires.
    pub fn expiration_ms(&self) -> TimestampMs {
        self.caching.expiration_ms()
    }

    /// Marks a response the HTTP cache refused to keep.
    pub(crate) fn not_cacheable(mut self) -> Self {
        self.caching.ttl_ms = 0;
        self
    }

    /// Whether a shared cache may keep the response for at least
    /// `min_ttl_ms`.
    pub fn is_cacheable_for(&self, min_ttl_ms: i64) -> bool {
        self.caching.is_cacheable() && self.caching.ttl_ms >= min_ttl_ms
    }

    /// Whether the response is `Cache-Control: private`.
    pub fn is_private(&self) -> bool {
        self.caching.cache_control.private
    }

    /// The `Etag` header.
    pub fn etag(&self) -> Option<&str> {
        self.value.headers.get(names::ETAG)
    }

    /// The `Last-Modified` header.
    pub fn last_modified(&self) -> Option<&str> {
        self.value.headers.get(names::LAST_MODIFIED)
    }

    /// Content hash of the body, computed on first use.
    pub fn fingerprint(&self, hasher: &dyn Hasher) -> &str {
        self.fingerprint.get_or_init(|| hasher.hash(&self.value.body))
    }
}
