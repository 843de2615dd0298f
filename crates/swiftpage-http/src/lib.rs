//! # SwiftPage HTTP
//!
//! HTTP plumbing for the rewrite engine:
//!
//! - [`RequestHeaders`] and [`ResponseHeaders`]
//! - freshness computation and `Cache-Control` rendering ([`caching`])
//! - the [`HttpCache`] of fetched and generated responses
//! - the [`UrlAsyncFetcher`] interface, sinks, and test fetchers
//! - the per-request [`RequestContext`]

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod caching;
pub mod error;
pub mod fetcher;
pub mod headers;
pub mod mock;
pub mod request_context;
pub mod value;

pub use cache::{FailureMemo, FindResult, HttpCache, HttpCacheConfig, HttpCacheStats, NotCacheable};
pub use caching::{compute_caching, format_http_date, parse_http_date, CacheControl, CachingInfo};
pub use error::{HttpError, Result};
pub use fetcher::{
    fetch_recorded, fetch_value, BufferSink, ChannelSink, FetchEvent, FetchSink, UrlAsyncFetcher,
};
pub use headers::{names, Headers, RequestHeaders, ResponseHeaders};
pub use mock::{CountingFetcher, MockFetcher, WaitFetcher};
pub use request_context::{RequestContext, RequestContextPtr};
pub use value::HttpValue;
