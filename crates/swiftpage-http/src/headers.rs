//! Request and response headers.
//!
//! Headers keep their original order and case; lookups are
//! case-insensitive.

use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};

/// Well-known header names.
pub mod names {
    #![allow(missing_docs)]
    pub const ACCEPT_ENCODING: &str = "Accept-Encoding";
    pub const AUTHORIZATION: &str = "Authorization";
    pub const CACHE_CONTROL: &str = "Cache-Control";
    pub const CONTENT_LENGTH: &str = "Content-Length";
    pub const CONTENT_TYPE: &str = "Content-Type";
    pub const COOKIE: &str = "Cookie";
    pub const DATE: &str = "Date";
    pub const ETAG: &str = "Etag";
    pub const EXPIRES: &str = "Expires";
    pub const IF_MODIFIED_SINCE: &str = "If-Modified-Since";
    pub const IF_NONE_MATCH: &str = "If-None-Match";
    pub const LAST_MODIFIED: &str = "Last-Modified";
    pub const LOCATION: &str = "Location";
    pub const SET_COOKIE: &str = "Set-Cookie";
    pub const SET_COOKIE2: &str = "Set-Cookie2";
    pub const USER_AGENT: &str = "User-Agent";
    pub const VARY: &str = "Vary";
    pub const X_FORWARDED_FOR: &str = "X-Forwarded-For";
}

/// An ordered multimap of header names to values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers {
    entries: Vec<(String, String)>,
}

impl Headers {
    /// Creates an empty header set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a header.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Replaces every value of `name` with `value`.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.remove(name);
        self.add(name, value);
    }

    /// Removes every value of `name`. Returns whether any was present.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        before != self.entries.len()
    }

    /// The first value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value of `name`, in order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Whether `name` is present.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Comma-separated tokens across every value of `name`, lowercased.
    pub fn tokens(&self, name: &str) -> Vec<String> {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .map(|t| t.trim().to_ascii_lowercase())
            .filter(|t| !t.is_empty())
            .collect()
    }

    /// Iterates over `(name, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Number of header lines.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether there are no headers.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self {
            entries: iter
                .into_iter()
                .map(|(n, v)| (n.into(), v.into()))
                .collect(),
        }
    }
}

/// Headers of an incoming request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHeaders {
    headers: Headers,
}

impl RequestHeaders {
    /// Creates empty request headers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the request carries credentials.
    pub fn has_authorization(&self) -> bool {
        self.contains(names::AUTHORIZATION)
    }

    /// The `User-Agent`, if any.
    pub fn user_agent(&self) -> Option<&str> {
        self.get(names::USER_AGENT)
    }

    /// Whether a cached response matches the request's validators, so a
    /// `304 Not Modified` may be sent instead of the body.
    pub fn is_not_modified(&self, response: &ResponseHeaders) -> bool {
        if let Some(wanted) = self.get(names::IF_NONE_MATCH) {
            let Some(etag) = response.get(names::ETAG) else {
                return false;
            };
            return wanted
                .split(',')
                .map(str::trim)
                .any(|tag| tag == "*" || tag == etag);
        }
        match (
            self.get(names::IF_MODIFIED_SINCE),
            response.get(names::LAST_MODIFIED),
        ) {
            (Some(since), Some(modified)) => {
                since == modified
                    || matches!(
                        (crate::caching::parse_http_date(since), crate::caching::parse_http_date(modified)),
                        (Some(since), Some(modified)) if modified <= since
                    )
            }
            _ => false,
        }
    }
}

impl Deref for RequestHeaders {
    type Target = Headers;

    fn deref(&self) -> &Headers {
        &self.headers
    }
}

impl DerefMut for RequestHeaders {
    fn deref_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for RequestHeaders {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self {
            headers: iter.into_iter().collect(),
        }
    }
}

/// Status line and headers of a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseHeaders {
    status_code: u16,
    headers: Headers,
}

impl Default for ResponseHeaders {
    fn default() -> Self {
        Self::new(200)
    }
}

impl ResponseHeaders {
    /// Creates headers with the given status.
    pub fn new(status_code: u16) -> Self {
        Self {
            status_code,
            headers: Headers::new(),
        }
    }

    /// Creates `200 OK` headers with a content type.
    pub fn ok(content_type: &str) -> Self {
        let mut headers = Self::new(200);
        headers.add(names::CONTENT_TYPE, content_type);
        headers
    }

    /// The status code.
    pub fn status_code(&self) -> u16 {
        self.status_code
    }

    /// Changes the status code.
    pub fn set_status_code(&mut self, status_code: u16) {
        self.status_code = status_code;
    }

    /// The `Content-Type` value, if any.
    pub fn content_type(&self) -> Option<&str> {
        self.get(names::CONTENT_TYPE)
    }

    /// Whether the content type is HTML.
    pub fn is_html(&self) -> bool {
        self.content_type()
            .and_then(swiftpage_core::ContentType::from_mime)
            .is_some_and(|ct| ct.is_html())
    }

    /// Declared `Content-Length`, if any and well-formed.
    pub fn content_length(&self) -> Option<u64> {
        self.get(names::CONTENT_LENGTH)
            .and_then(|v| v.trim().parse().ok())
    }

    /// Whether the response sets cookies.
    pub fn has_cookies(&self) -> bool {
        self.contains(names::SET_COOKIE) || self.contains(names::SET_COOKIE2)
    }

    /// Removes `Set-Cookie` and `Set-Cookie2`. Returns whether any was
    /// present.
    pub fn strip_cookies(&mut self) -> bool {
        let a = self.remove(names::SET_COOKIE);
        let b = self.remove(names::SET_COOKIE2);
        a || b
    }
}

impl Deref for ResponseHeaders {
    type Target = Headers;

    fn deref(&self) -> &Headers {
        &self.headers
    }
}

impl DerefMut for ResponseHeaders {
    fn deref_mut(&mut self) -> &mut Headers {
        &mut self.headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn lookup_is_case_insensitive_and_ordered() {
        let mut headers = Headers::new();
        headers.add("Vary", "Accept-Encoding");
        headers.add("vary", "User-Agent");
        assert_eq!(headers.get("VARY"), Some("Accept-Encoding"));
        assert_eq!(
            headers.get_all("Vary").collect::<Vec<_>>(),
            vec!["Accept-Encoding", "User-Agent"]
        );
        assert_eq!(headers.tokens("vary"), vec!["accept-encoding", "user-agent"]);
    }

    #[test]
    fn set_replaces_all_values() {
        let mut headers: Headers = [("A", "1"), ("a", "2"), ("B", "3")].into_iter().collect();
        headers.set("A", "4");
        assert_eq!(headers.len(), 2);
        assert_eq!(headers.get("a"), Some("4"));
        assert!(headers.remove("b"));
        assert!(!headers.remove("b"));
    }

    #[test]
    fn strip_cookies_removes_both_kinds() {
        let mut response = ResponseHeaders::ok("text/css");
        response.add("Set-Cookie", "a=b");
        response.add("Set-Cookie2", "c=d");
        assert!(response.has_cookies());
        assert!(response.strip_cookies());
        assert!(!response.has_cookies());
    }

    #[test]
    fn etag_validator() {
        let mut response = ResponseHeaders::ok("text/css");
        response.add(names::ETAG, "W/\"PSA-abc\"");
        let request: RequestHeaders = [(names::IF_NONE_MATCH, "W/\"PSA-abc\"")]
            .into_iter()
            .collect();
        assert!(request.is_not_modified(&response));

        let stale: RequestHeaders = [(names::IF_NONE_MATCH, "W/\"PSA-old\"")]
            .into_iter()
            .collect();
        assert!(!stale.is_not_modified(&response));
    }

    #[test]
    fn last_modified_validator() {
        let mut response = ResponseHeaders::ok("text/css");
        response.add(names::LAST_MODIFIED, "Mon, 05 Apr 2010 18:51:26 GMT");
        let echoed: RequestHeaders = [(names::IF_MODIFIED_SINCE, "Mon, 05 Apr 2010 18:51:26 GMT")]
            .into_iter()
            .collect();
        assert!(echoed.is_not_modified(&response));

        let older: RequestHeaders = [(names::IF_MODIFIED_SINCE, "Sun, 04 Apr 2010 18:51:26 GMT")]
            .into_iter()
            .collect();
        assert!(!older.is_not_modified(&response));
        assert!(!RequestHeaders::new().is_not_modified(&response));
    }

    #[test]
    fn html_detection() {
        assert!(ResponseHeaders::ok("text/html; charset=utf-8").is_html());
        assert!(!ResponseHeaders::ok("text/css").is_html());
        assert!(!ResponseHeaders::new(200).is_html());
    }
}
