//! Rewrite options.
//!
//! Options are loaded from a configuration file (TOML, YAML or JSON) with
//! environment overrides prefixed `SWIFTPAGE__`, e.g.
//! `SWIFTPAGE__WORKER_THREADS=8`.

use crate::domain_lawyer::DomainLawyerConfig;
use crate::error::{Error, Result};
use crate::hasher::Hasher;
use crate::wildcard::WildcardGroup;
use serde::{Deserialize, Serialize};
use std::path::Path;
use validator::{ValidationError, ValidationErrors};

/// Rewrites HTML references to stylesheets through the CSS minifier.
pub const FILTER_REWRITE_CSS: &str = "rewrite_css";
/// Rewrites HTML references to scripts through the JS minifier.
pub const FILTER_REWRITE_JAVASCRIPT: &str = "rewrite_javascript";
/// Cache-extends images.
pub const FILTER_EXTEND_CACHE: &str = "extend_cache";
/// Combines adjacent stylesheets.
pub const FILTER_COMBINE_CSS: &str = "combine_css";
/// Counts elements and records the count in the property cache.
pub const FILTER_COUNT_ELEMENTS: &str = "count_elements";

/// Every filter name accepted in `enabled_filters`.
pub const KNOWN_FILTERS: &[&str] = &[
    FILTER_REWRITE_CSS,
    FILTER_REWRITE_JAVASCRIPT,
    FILTER_EXTEND_CACHE,
    FILTER_COMBINE_CSS,
    FILTER_COUNT_ELEMENTS,
];

/// Per-server rewrite configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewriteOptions {
    /// Filters applied to HTML, by name.
    pub enabled_filters: Vec<String>,
    /// Rewrite resources requested at their original URL.
    pub in_place_rewriting_enabled: bool,
    /// Cache responses carrying `Vary` (other than `Accept-Encoding`).
    pub respect_vary: bool,
    /// Largest body the caches accept; `-1` means unlimited.
    pub max_cacheable_response_content_length: i64,
    /// Upper bound on the TTL of rewritten HTML.
    pub max_html_cache_time_ms: i64,
    /// TTL for responses without explicit caching headers.
    pub implicit_cache_ttl_ms: i64,
    /// Inputs cacheable for less than this are not rewritten.
    pub min_resource_cache_time_to_rewrite_ms: i64,
    /// Flush downstream after this long without output.
    pub idle_flush_time_ms: u64,
    /// Flush the parser once this many bytes are buffered.
    pub flush_buffer_limit_bytes: usize,
    /// Documents larger than this are passed through with a redirect
    /// script; `-1` means unlimited.
    pub max_html_parse_bytes: i64,
    /// Read property-cache values from the query-stripped page when the
    /// page itself has none.
    pub use_fallback_property_cache_values: bool,
    /// Answer blacklisted URLs with an error status.
    pub reject_blacklisted: bool,
    /// Status code for rejected blacklisted URLs.
    pub reject_blacklisted_status_code: u16,
    /// Domain rules.
    pub domain_lawyer: DomainLawyerConfig,
    /// How long a request waits for a rewrite before keeping the original
    /// reference.
    pub rewrite_deadline_ms: u64,
    /// Hard limit for a rewrite continuing in the background.
    pub background_rewrite_deadline_ms: u64,
    /// How long transformer failures are remembered.
    pub metadata_failure_ttl_ms: i64,
    /// How long fetch failures are remembered.
    pub fetch_failure_ttl_ms: i64,
    /// How long uncacheable responses are remembered.
    pub uncacheable_memo_ttl_ms: i64,
    /// Entries this close to expiry are refreshed in the background.
    pub freshen_threshold_ms: i64,
    /// TTL given to rewritten resources.
    pub cache_extend_ttl_ms: i64,
    /// Characters in output hashes.
    pub hash_length: usize,
    /// Never cache HTML fetched over https.
    pub disable_html_caching_on_https: bool,
    /// Serve an expired entry when the origin fails.
    pub serve_stale_on_fetch_failure: bool,
    /// Identical consecutive writes before a property is stable.
    pub property_cache_stability_threshold: u32,
    /// Threads in the rewrite worker pool.
    pub worker_threads: usize,
    /// Threads in the background worker pool.
    pub low_priority_threads: usize,
    /// Queued background jobs before the oldest is shed.
    pub low_priority_queue_limit: usize,
    /// URL wildcards never rewritten.
    pub blacklist: Vec<String>,
    /// Read and write the property cache.
    pub property_cache_enabled: bool,
}

impl Default for RewriteOptions {
    fn default() -> Self {
        Self {
            enabled_filters: vec![
                FILTER_REWRITE_CSS.to_string(),
                FILTER_REWRITE_JAVASCRIPT.to_string(),
                FILTER_EXTEND_CACHE.to_string(),
            ],
            in_place_rewriting_enabled: false,
            respect_vary: false,
            max_cacheable_response_content_length: 16 * 1024 * 1024,
            max_html_cache_time_ms: 0,
            implicit_cache_ttl_ms: 5 * 60 * 1000,
            min_resource_cache_time_to_rewrite_ms: 0,
            idle_flush_time_ms: 10_000,
            flush_buffer_limit_bytes: 100 * 1000,
            max_html_parse_bytes: 50 * 1024 * 1024,
            use_fallback_property_cache_values: false,
            reject_blacklisted: false,
            reject_blacklisted_status_code: 403,
            domain_lawyer: DomainLawyerConfig::default(),
            rewrite_deadline_ms: 10,
            background_rewrite_deadline_ms: 30_000,
            metadata_failure_ttl_ms: 5 * 60 * 1000,
            fetch_failure_ttl_ms: 5 * 60 * 1000,
            uncacheable_memo_ttl_ms: 5 * 60 * 1000,
            freshen_threshold_ms: 60 * 1000,
            cache_extend_ttl_ms: 365 * 24 * 60 * 60 * 1000,
            hash_length: 10,
            disable_html_caching_on_https: false,
            serve_stale_on_fetch_failure: false,
            property_cache_stability_threshold: 3,
            worker_threads: 4,
            low_priority_threads: 1,
            low_priority_queue_limit: 500,
            blacklist: Vec::new(),
            property_cache_enabled: true,
        }
    }
}

/// The subset of options that changes rewrite outputs.
#[derive(Serialize)]
struct Signature<'a> {
    filters: Vec<&'a str>,
    cache_extend_ttl_ms: i64,
    hash_length: usize,
    domain_lawyer: &'a DomainLawyerConfig,
    max_cacheable_response_content_length: i64,
}

impl RewriteOptions {
    /// Loads options from `path`, applies `SWIFTPAGE__*` environment
    /// overrides and validates the result.
    pub fn load(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix("SWIFTPAGE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let options: Self = settings.try_deserialize()?;
        options
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(options)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> std::result::Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.worker_threads == 0 {
            errors.add("worker_threads", range_error("must be at least 1"));
        }
        if self.low_priority_threads == 0 {
            errors.add("low_priority_threads", range_error("must be at least 1"));
        }
        if !(1..=32).contains(&self.hash_length) {
            errors.add(
                "hash_length",
                range_error(&format!("{} is outside 1..=32", self.hash_length)),
            );
        }
        if !(400..=599).contains(&self.reject_blacklisted_status_code) {
            errors.add(
                "reject_blacklisted_status_code",
                range_error("must be an error status"),
            );
        }
        if let Some(unknown) = self
            .enabled_filters
            .iter()
            .find(|f| !KNOWN_FILTERS.contains(&f.as_str()))
        {
            let mut err = ValidationError::new("unknown_filter");
            err.message = Some(format!("unknown filter {unknown:?}").into());
            errors.add("enabled_filters", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Hash of the options that affect rewrite outputs. Participates in
    /// metadata partition keys and property-cache keys.
    pub fn signature(&self, hasher: &dyn Hasher) -> String {
        let mut filters: Vec<&str> = self.enabled_filters.iter().map(String::as_str).collect();
        filters.sort_unstable();
        filters.dedup();
        let signature = Signature {
            filters,
            cache_extend_ttl_ms: self.cache_extend_ttl_ms,
            hash_length: self.hash_length,
            domain_lawyer: &self.domain_lawyer,
            max_cacheable_response_content_length: self.max_cacheable_response_content_length,
        };
        hasher.hash_str(&serde_json::to_string(&signature).unwrap_or_default())
    }

    /// Whether the named filter is enabled.
    pub fn is_filter_enabled(&self, name: &str) -> bool {
        self.enabled_filters.iter().any(|f| f == name)
    }

    /// Whether a body of `len` bytes may be cached.
    pub fn is_cacheable_body_size(&self, len: usize) -> bool {
        self.max_cacheable_response_content_length < 0
            || i64::try_from(len).map_or(false, |len| len <= self.max_cacheable_response_content_length)
    }

    /// Whether an HTML document of `len` bytes exceeds the parse limit.
    pub fn exceeds_html_parse_limit(&self, len: usize) -> bool {
        self.max_html_parse_bytes >= 0
            && i64::try_from(len).map_or(true, |len| len > self.max_html_parse_bytes)
    }

    /// Compiles the blacklist.
    pub fn blacklist_group(&self) -> Result<WildcardGroup> {
        let mut group = WildcardGroup::new();
        for spec in &self.blacklist {
            group.allow(spec)?;
        }
        Ok(group)
    }
}

fn range_error(message: &str) -> ValidationError {
    let mut err = ValidationError::new("range");
    err.message = Some(message.to_string().into());
    err
}
