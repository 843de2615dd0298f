//! CLI command implementations.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::sync::Arc;
use swiftpage_core::{RewriteOptions, RewrittenUrl};
use swiftpage_http::{RequestHeaders, UrlAsyncFetcher};
use swiftpage_rewrite::{CollectingWriter, ProxyInterface, ResponseWriter, ServerContext};

/// Option overrides given on the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// Replaces the enabled filter list.
    pub filters: Option<Vec<String>>,
    /// Replaces the rewrite deadline.
    pub deadline_ms: Option<u64>,
}

/// Loads options from `config` (or defaults) and applies `overrides`.
pub fn load_options(config: Option<&Path>, overrides: &Overrides) -> Result<RewriteOptions> {
    let mut options = match config {
        Some(path) => RewriteOptions::load(path)
            .with_context(|| format!("loading options from {}", path.display()))?,
        None => RewriteOptions::default(),
    };
    if let Some(filters) = &overrides.filters {
        options.enabled_filters.clone_from(filters);
    }
    if let Some(deadline_ms) = overrides.deadline_ms {
        options.rewrite_deadline_ms = deadline_ms;
    }
    Ok(options)
}

/// Builds a proxy over `fetcher`.
pub fn build_proxy(options: RewriteOptions, fetcher: Arc<dyn UrlAsyncFetcher>) -> Result<ProxyInterface> {
    let server = ServerContext::builder(options)
        .fetcher(fetcher)
        .build()
        .context("building server context")?;
    Ok(ProxyInterface::new(server))
}

/// Parses `Name: value`.
pub fn parse_header(raw: &str) -> std::result::Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected 'Name: value', got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in '{raw}'"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

/// Collects `headers` into request headers.
pub fn request_headers(headers: &[(String, String)], user_agent: Option<&str>) -> RequestHeaders {
    let mut request = RequestHeaders::new();
    for (name, value) in headers {
        request.add(name.as_str(), value.as_str());
    }
    if let Some(user_agent) = user_agent {
        request.set("User-Agent", user_agent);
    }
    request
}

/// Fetches `url` through the proxy `passes` times, waiting for background
/// rewrites between passes. Only the last response reaches `out`.
pub async fn rewrite(
    proxy: &ProxyInterface,
    url: &str,
    headers: &RequestHeaders,
    passes: u32,
    out: &mut dyn ResponseWriter,
) -> Result<()> {
    if passes == 0 {
        bail!("at least one pass is required");
    }
    for pass in 1..passes {
        let discard = CollectingWriter::new();
        proxy.fetch(url, headers.clone(), &mut discard.clone()).await;
        tracing::info!(
            url,
            pass,
            status = discard.response().status_code(),
            "warm-up pass finished"
        );
        proxy.server().quiesce().await;
    }

    if !proxy.fetch(url, headers.clone(), out).await {
        bail!("response for {url} did not complete");
    }
    proxy.server().quiesce().await;
    tracing::info!(stats = ?proxy.server().stats(), "server stats");
    Ok(())
}

/// Serves a rewritten resource URL, reconstructing it if necessary.
pub async fn serve(
    proxy: &ProxyInterface,
    url: &str,
    headers: &RequestHeaders,
    out: &mut dyn ResponseWriter,
) -> Result<()> {
    let server = proxy.server();
    let registry = server.registry();
    RewrittenUrl::parse(url, server.hasher().hash_size_in_chars(), |id| {
        registry.contains(id)
    })
    .with_context(|| format!("{url} is not a rewritten resource URL"))?;

    if !proxy.fetch(url, headers.clone(), out).await {
        bail!("{url} could not be served");
    }
    Ok(())
}

/// Serialization used by the `options` command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OptionsFormat {
    /// Loadable back through `--config`.
    #[default]
    Yaml,
    /// Pretty-printed JSON.
    Json,
}

/// Renders the effective options.
pub fn render_options(options: &RewriteOptions, format: OptionsFormat) -> Result<String> {
    Ok(match format {
        OptionsFormat::Yaml => serde_yaml::to_string(options)?,
        OptionsFormat::Json => serde_json::to_string_pretty(options)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::StreamWriter;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use swiftpage_http::MockFetcher;

    fn proxy(fetcher: Arc<MockFetcher>) -> ProxyInterface {
        let options = RewriteOptions {
            rewrite_deadline_ms: 5_000,
            ..RewriteOptions::default()
        };
        build_proxy(options, fetcher).unwrap()
    }

    #[test]
    fn headers_parse() {
        assert_eq!(
            parse_header("Accept: text/html").unwrap(),
            ("Accept".to_string(), "text/html".to_string())
        );
        assert_eq!(
            parse_header("X-Empty:").unwrap(),
            ("X-Empty".to_string(), String::new())
        );
        assert!(parse_header("no separator").is_err());
        assert!(parse_header(": value").is_err());
    }

    #[test]
    fn user_agent_overrides_header() {
        let headers = request_headers(
            &[("User-Agent".to_string(), "curl".to_string())],
            Some("Mozilla/5.0 (iPhone)"),
        );
        assert_eq!(headers.user_agent(), Some("Mozilla/5.0 (iPhone)"));
    }

    #[test]
    fn overrides_apply_on_top_of_config_file() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"rewrite_deadline_ms": 25}}"#).unwrap();

        let loaded = load_options(Some(file.path()), &Overrides::default()).unwrap();
        assert_eq!(loaded.rewrite_deadline_ms, 25);

        let overrides = Overrides {
            filters: Some(vec!["extend_cache".to_string()]),
            deadline_ms: Some(40),
        };
        let options = load_options(Some(file.path()), &overrides).unwrap();
        assert_eq!(options.rewrite_deadline_ms, 40);
        assert_eq!(options.enabled_filters, vec!["extend_cache".to_string()]);
    }

    #[test]
    fn rendered_yaml_loads_back() {
        let options = RewriteOptions {
            rewrite_deadline_ms: 77,
            ..RewriteOptions::default()
        };
        let yaml = render_options(&options, OptionsFormat::Yaml).unwrap();
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let loaded = load_options(Some(file.path()), &Overrides::default()).unwrap();
        assert_eq!(loaded, options);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.json");
        assert!(load_options(Some(&path), &Overrides::default()).is_err());
    }

    #[tokio::test]
    async fn rewrite_writes_optimized_page() {
        let fetcher = Arc::new(MockFetcher::new());
        fetcher.set_text("http://test.com/a.css", "text/css", 300, "a {  color: red; }");
        fetcher.set_text(
            "http://test.com/",
            "text/html",
            0,
            "<html><head><link rel=\"stylesheet\" href=\"a.css\"></head></html>",
        );
        let proxy = proxy(fetcher);

        let mut out = StreamWriter::new(Vec::new(), false);
        rewrite(&proxy, "http://test.com/", &RequestHeaders::new(), 2, &mut out)
            .await
            .unwrap();
        assert_eq!(out.status_code(), Some(200));
        let page = String::from_utf8(out.finish().unwrap()).unwrap();
        assert!(page.contains("a.css.pagespeed.cf."), "{page}");
    }

    #[tokio::test]
    async fn zero_passes_is_rejected() {
        let proxy = proxy(Arc::new(MockFetcher::new()));
        let mut out = StreamWriter::new(Vec::new(), false);
        let result = rewrite(&proxy, "http://test.com/", &RequestHeaders::new(), 0, &mut out).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn serve_rejects_plain_urls() {
        let proxy = proxy(Arc::new(MockFetcher::new()));
        let mut out = StreamWriter::new(Vec::new(), false);
        let result = serve(&proxy, "http://test.com/a.css", &RequestHeaders::new(), &mut out).await;
        assert!(result.is_err());
    }
}
