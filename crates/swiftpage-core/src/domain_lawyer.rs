//! Decides which domains may be rewritten and how URLs move between
//! domains.
//!
//! Three kinds of rules are supported:
//!
//! - **Allowed domains**: resources on these hosts may be rewritten even
//!   when referenced from a page on another origin.
//! - **Rewrite domains**: outputs whose inputs live on `from` are emitted
//!   under `to`, e.g. to serve optimized resources from a CDN.
//! - **Proxy domains**: requests for `proxy` are fetched from `origin`.
//!   Responses fetched this way cross an origin boundary and lose their
//!   cookies.

use crate::error::{Error, Result};
use crate::wildcard::Wildcard;
use serde::{Deserialize, Serialize};
use url::Url;

/// Maps outputs from one domain prefix onto another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainMapping {
    /// Prefix of input URLs, e.g. `http://static.example.com/`.
    pub from: String,
    /// Prefix the outputs are emitted under.
    pub to: String,
}

/// Maps a proxy prefix onto an origin prefix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyMapping {
    /// Prefix clients request, e.g. `http://proxy.com/test.com/`.
    pub proxy: String,
    /// Prefix fetched from, e.g. `http://test.com/`.
    pub origin: String,
}

/// Serializable domain rules, part of the rewrite options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainLawyerConfig {
    /// Host wildcards (`*.example.com`) or origin wildcards
    /// (`http://cdn.example.com`) whose resources may be rewritten.
    pub allowed_domains: Vec<String>,
    /// Output domain mappings.
    pub rewrite_domains: Vec<DomainMapping>,
    /// Proxy domain mappings.
    pub proxy_domains: Vec<ProxyMapping>,
}

/// Compiled domain rules.
#[derive(Debug, Clone, Default)]
pub struct DomainLawyer {
    allowed: Vec<Wildcard>,
    rewrite: Vec<(String, String)>,
    proxy: Vec<(String, String)>,
}

impl DomainLawyer {
    /// Compiles the rules in `config`.
    pub fn new(config: &DomainLawyerConfig) -> Result<Self> {
        let allowed = config
            .allowed_domains
            .iter()
            .map(|spec| Wildcard::new(spec.trim_end_matches('/')))
            .collect::<Result<Vec<_>>>()?;
        let rewrite = config
            .rewrite_domains
            .iter()
            .map(|m| Ok((normalize_prefix(&m.from)?, normalize_prefix(&m.to)?)))
            .collect::<Result<Vec<_>>>()?;
        let proxy = config
            .proxy_domains
            .iter()
            .map(|m| Ok((normalize_prefix(&m.proxy)?, normalize_prefix(&m.origin)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            allowed,
            rewrite,
            proxy,
        })
    }

    /// Whether a resource at `resource_url` referenced from a page at
    /// `base_url` may be rewritten.
    pub fn is_domain_authorized(&self, base_url: &Url, resource_url: &Url) -> bool {
        if !matches!(resource_url.scheme(), "http" | "https") {
            return false;
        }
        if base_url.origin() == resource_url.origin() {
            return true;
        }
        let origin = resource_url.origin().ascii_serialization();
        let host = resource_url.host_str().unwrap_or_default();
        if self
            .allowed
            .iter()
            .any(|w| w.matches(host) || w.matches(&origin))
        {
            return true;
        }
        let prefix = format!("{origin}/");
        self.rewrite.iter().any(|(from, _)| *from == prefix)
            || self.proxy.iter().any(|(_, o)| *o == prefix)
    }

    /// If `url` is under a proxy prefix, returns the origin URL to fetch.
    pub fn map_request_to_origin(&self, url: &str) -> Option<String> {
        self.proxy.iter().find_map(|(proxy, origin)| {
            url.strip_prefix(proxy.as_str())
                .map(|rest| format!("{origin}{rest}"))
        })
    }

    /// Whether fetching `url` crosses a proxy mapping.
    pub fn is_proxy_mapped(&self, url: &str) -> bool {
        self.map_request_to_origin(url).is_some()
    }

    /// Maps a directory prefix onto its rewrite domain, if one is
    /// configured.
    pub fn map_rewrite_domain(&self, url: &str) -> Option<String> {
        self.rewrite.iter().find_map(|(from, to)| {
            url.strip_prefix(from.as_str())
                .map(|rest| format!("{to}{rest}"))
        })
    }

    /// Inverse of [`DomainLawyer::map_rewrite_domain`]: maps an output on
    /// the rewrite domain back onto the input domain.
    pub fn map_rewrite_domain_to_origin(&self, url: &str) -> Option<String> {
        self.rewrite.iter().find_map(|(from, to)| {
            url.strip_prefix(to.as_str())
                .map(|rest| format!("{from}{rest}"))
        })
    }
}

/// Parses a prefix and renders it with a trailing slash.
fn normalize_prefix(prefix: &str) -> Result<String> {
    let with_scheme = if prefix.contains("://") {
        prefix.to_string()
    } else {
        format!("http://{prefix}")
    };
    let url = Url::parse(&with_scheme).map_err(|e| Error::InvalidUrl(format!("{prefix}: {e}")))?;
    let mut rendered = url.to_string();
    if !rendered.ends_with('/') {
        rendered.push('/');
    }
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn lawyer() -> DomainLawyer {
        DomainLawyer::new(&DomainLawyerConfig {
            allowed_domains: vec!["*.cdn.com".into(), "http://static.com".into()],
            rewrite_domains: vec![DomainMapping {
                from: "http://test.com/".into(),
                to: "http://cdn.test.com/".into(),
            }],
            proxy_domains: vec![ProxyMapping {
                proxy: "proxyhost.com/test.com".into(),
                origin: "test.com".into(),
            }],
        })
        .unwrap()
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn same_origin_is_authorized() {
        let lawyer = DomainLawyer::default();
        assert!(lawyer.is_domain_authorized(&url("http://a.com/"), &url("http://a.com/x.css")));
        assert!(!lawyer.is_domain_authorized(&url("http://a.com/"), &url("http://b.com/x.css")));
        assert!(!lawyer.is_domain_authorized(&url("http://a.com/"), &url("https://a.com/x.css")));
    }

    #[test]
    fn allowed_wildcards_authorize() {
        let lawyer = lawyer();
        let base = url("http://a.com/");
        assert!(lawyer.is_domain_authorized(&base, &url("http://img.cdn.com/x.png")));
        assert!(lawyer.is_domain_authorized(&base, &url("http://static.com/x.png")));
        assert!(!lawyer.is_domain_authorized(&base, &url("http://evil.com/x.png")));
        assert!(!lawyer.is_domain_authorized(&base, &url("data:text/css,x")));
    }

    #[test]
    fn proxy_mapping() {
        let lawyer = lawyer();
        assert_eq!(
            lawyer.map_request_to_origin("http://proxyhost.com/test.com/a.css"),
            Some("http://test.com/a.css".to_string())
        );
        assert!(!lawyer.is_proxy_mapped("http://test.com/a.css"));
    }

    #[test]
    fn rewrite_mapping_roundtrip() {
        let lawyer = lawyer();
        let mapped = lawyer.map_rewrite_domain("http://test.com/dir/").unwrap();
        assert_eq!(mapped, "http://cdn.test.com/dir/");
        assert_eq!(
            lawyer.map_rewrite_domain_to_origin(&mapped),
            Some("http://test.com/dir/".to_string())
        );
    }

    #[test]
    fn bad_prefix_is_rejected() {
        let config = DomainLawyerConfig {
            proxy_domains: vec![ProxyMapping {
                proxy: "http://[bad".into(),
                origin: "test.com".into(),
            }],
            ..Default::default()
        };
        assert!(DomainLawyer::new(&config).is_err());
    }
}
