//! Origin fetcher backed by `reqwest`.

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use swiftpage_http::{names, FetchSink, RequestHeaders, ResponseHeaders, UrlAsyncFetcher};

/// Request headers that describe the client connection rather than the
/// resource, plus `Accept-Encoding` since bodies are rewritten as
/// identity-encoded text.
const SKIPPED_REQUEST_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "host",
    "accept-encoding",
];

/// Fetches from live origins, streaming each body chunk into the sink as
/// it arrives.
#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    client: Client,
}

impl ReqwestFetcher {
    /// Creates a fetcher whose requests give up after `timeout`.
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("swiftpage/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("building HTTP client")?;
        Ok(Self { client })
    }
}

fn forwarded(name: &str) -> bool {
    !SKIPPED_REQUEST_HEADERS
        .iter()
        .any(|skipped| skipped.eq_ignore_ascii_case(name))
}

fn response_headers(response: &reqwest::Response) -> ResponseHeaders {
    let mut headers = ResponseHeaders::new(response.status().as_u16());
    for (name, value) in response.headers() {
        match value.to_str() {
            Ok(value) => headers.add(name.as_str(), value),
            Err(_) => tracing::debug!(header = %name, "dropping non-ascii response header"),
        }
    }
    headers
}

#[async_trait]
impl UrlAsyncFetcher for ReqwestFetcher {
    async fn fetch(&self, url: &str, request: &RequestHeaders, sink: &mut dyn FetchSink) -> bool {
        let mut builder = self.client.get(url);
        for (name, value) in request.iter().filter(|(name, _)| forwarded(name)) {
            builder = builder.header(name, value);
        }

        let mut response = match builder.send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(url, error = %e, "origin fetch failed");
                sink.on_done(false);
                return false;
            }
        };

        let headers = response_headers(&response);
        tracing::debug!(
            url,
            status = headers.status_code(),
            content_type = headers.get(names::CONTENT_TYPE).unwrap_or(""),
            "origin responded"
        );
        sink.on_headers(&headers);

        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => sink.on_body_chunk(&chunk),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(url, error = %e, "origin body interrupted");
                    sink.on_done(false);
                    return false;
                }
            }
        }
        sink.on_done(true);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_headers_are_not_forwarded() {
        assert!(!forwarded("Connection"));
        assert!(!forwarded("Accept-Encoding"));
        assert!(!forwarded("host"));
        assert!(forwarded("User-Agent"));
        assert!(forwarded("If-Modified-Since"));
    }

    #[test]
    fn client_builds() {
        assert!(ReqwestFetcher::new(Duration::from_secs(5)).is_ok());
    }
}
