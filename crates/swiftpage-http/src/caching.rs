//! Cache lifetime computation and `Cache-Control` handling.

use crate::headers::{names, ResponseHeaders};
use chrono::{DateTime, NaiveDateTime};
use swiftpage_core::{ContentKind, ContentType, TimestampMs};

/// Format of HTTP dates.
pub const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Parses an HTTP date into milliseconds since the epoch.
pub fn parse_http_date(value: &str) -> Option<TimestampMs> {
    let value = value.trim();
    if let Ok(date) = DateTime::parse_from_rfc2822(value) {
        return Some(date.timestamp_millis());
    }
    NaiveDateTime::parse_from_str(value, HTTP_DATE_FORMAT)
        .ok()
        .map(|date| date.and_utc().timestamp_millis())
}

/// Formats milliseconds since the epoch as an HTTP date.
pub fn format_http_date(ms: TimestampMs) -> String {
    DateTime::from_timestamp_millis(ms)
        .unwrap_or_default()
        .format(HTTP_DATE_FORMAT)
        .to_string()
}

/// Parsed `Cache-Control` directives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    /// `max-age` in seconds.
    pub max_age: Option<i64>,
    /// `public`
    pub public: bool,
    /// `private`
    pub private: bool,
    /// `no-cache`
    pub no_cache: bool,
    /// `no-store`
    pub no_store: bool,
    /// `must-revalidate`
    pub must_revalidate: bool,
}

impl CacheControl {
    /// Parses every `Cache-Control` value of `headers`.
    pub fn from_headers(headers: &ResponseHeaders) -> Self {
        Self::parse(&headers.tokens(names::CACHE_CONTROL))
    }

    /// Parses lowercased directive tokens. Malformed `max-age` values are
    /// ignored; the smallest valid one wins.
    pub fn parse(tokens: &[String]) -> Self {
        let mut cc = Self::default();
        for token in tokens {
            let (name, value) = match token.split_once('=') {
                Some((name, value)) => (name.trim(), Some(value.trim().trim_matches('"'))),
                None => (token.as_str(), None),
            };
            match name {
                "max-age" => {
                    if let Some(age) = value.and_then(|v| v.parse::<i64>().ok()) {
                        cc.max_age = Some(cc.max_age.map_or(age, |prev| prev.min(age)));
                    }
                }
                "public" => cc.public = true,
                "private" => cc.private = true,
                "no-cache" => cc.no_cache = true,
                "no-store" => cc.no_store = true,
                "must-revalidate" => cc.must_revalidate = true,
                _ => {}
            }
        }
        cc
    }

    /// Renders the directives in the order
    /// `max-age, private|public, no-cache, no-store`.
    pub fn to_header_value(&self) -> String {
        let mut parts = Vec::with_capacity(4);
        if let Some(age) = self.max_age {
            parts.push(format!("max-age={age}"));
        }
        if self.private {
            parts.push("private".to_string());
        } else if self.public {
            parts.push("public".to_string());
        }
        if self.no_cache {
            parts.push("no-cache".to_string());
        }
        if self.no_store {
            parts.push("no-store".to_string());
        }
        parts.join(", ")
    }

    /// Whether a shared cache may store the response.
    pub fn allows_shared_caching(&self) -> bool {
        !(self.private || self.no_store || self.no_cache)
    }
}

/// Caching properties computed from response headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachingInfo {
    /// The response date.
    pub date_ms: TimestampMs,
    /// How long the response stays fresh.
    pub ttl_ms: i64,
    /// Whether the TTL came from `max-age` or `Expires`.
    pub explicit_ttl: bool,
    /// Parsed `Cache-Control`.
    pub cache_control: CacheControl,
}

impl CachingInfo {
    /// When the response expires.
    pub fn expiration_ms(&self) -> TimestampMs {
        self.date_ms.saturating_add(self.ttl_ms)
    }

    /// Whether the response is still fresh at `now_ms`.
    pub fn is_fresh(&self, now_ms: TimestampMs) -> bool {
        now_ms < self.expiration_ms()
    }

    /// Whether a shared cache may store the response at all.
    pub fn is_cacheable(&self) -> bool {
        self.cache_control.allows_shared_caching() && self.ttl_ms > 0
    }

    /// Whether the response is explicitly marked public.
    pub fn is_public(&self) -> bool {
        self.cache_control.public && !self.cache_control.private
    }
}

/// Status codes whose responses may be cached.
pub fn is_cacheable_status(status: u16) -> bool {
    matches!(status, 200 | 203 | 300 | 301 | 410)
}

/// Computes freshness from `headers`.
///
/// `max-age` beats `Expires`. Without either, CSS, JavaScript and images
/// get `implicit_ttl_ms`; everything else is uncacheable.
pub fn compute_caching(
    headers: &ResponseHeaders,
    implicit_ttl_ms: i64,
    now_ms: TimestampMs,
) -> CachingInfo {
    let date_ms = headers
        .get(names::DATE)
        .and_then(parse_http_date)
        .unwrap_or(now_ms);
    let cache_control = CacheControl::from_headers(headers);

    let (ttl_ms, explicit_ttl) = if let Some(age) = cache_control.max_age {
        (age.saturating_mul(1000).max(0), true)
    } else if let Some(expires) = headers.get(names::EXPIRES) {
        // An unparseable Expires, such as "0", means already expired.
        let ttl = parse_http_date(expires).map_or(0, |e| (e - date_ms).max(0));
        (ttl, true)
    } else if is_implicitly_cacheable(headers) {
        (implicit_ttl_ms, false)
    } else {
        (0, false)
    };

    CachingInfo {
        date_ms,
        ttl_ms,
        explicit_ttl,
        cache_control,
    }
}

fn is_implicitly_cacheable(headers: &ResponseHeaders) -> bool {
    if !is_cacheable_status(headers.status_code()) {
        return false;
    }
    headers
        .content_type()
        .and_then(ContentType::from_mime)
        .is_some_and(|ct| {
            matches!(
                ct.kind(),
                ContentKind::Css | ContentKind::JavaScript | ContentKind::Image
            )
        })
}

/// Sets `Date`, `Expires` and `Cache-Control` for a response that stays
/// fresh for `ttl_ms`, keeping a `no-store` directive already present.
pub fn set_cache_lifetime(
    headers: &mut ResponseHeaders,
    now_ms: TimestampMs,
    ttl_ms: i64,
    private: bool,
) {
    let previous = CacheControl::from_headers(headers);
    let cc = CacheControl {
        max_age: Some(ttl_ms.max(0) / 1000),
        public: !private && ttl_ms > 0,
        private,
        no_cache: ttl_ms <= 0,
        no_store: previous.no_store,
        must_revalidate: false,
    };
    headers.set(names::DATE, format_http_date(now_ms));
    headers.set(names::EXPIRES, format_http_date(now_ms + ttl_ms.max(0)));
    headers.set(names::CACHE_CONTROL, cc.to_header_value());
}
