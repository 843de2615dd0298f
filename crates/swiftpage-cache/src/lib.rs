//! # SwiftPage Cache
//!
//! Key/value cache backends and the property cache.
//!
//! ## Backends
//!
//! - [`CacheBackend`]: async key/value interface every cache layer is
//!   built on
//! - [`LruCacheBackend`]: bounded in-memory LRU cache
//! - [`DelayCache`]: wrapper that holds lookups for chosen keys until the
//!   test releases them
//!
//! ## Property cache
//!
//! The [`PropertyCache`] stores facts learned about a page between
//! requests, grouped into cohorts that are read together at request start
//! and written back at request end.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod delay;
pub mod error;
pub mod lru_backend;
pub mod property;

pub use backend::CacheBackend;
pub use delay::DelayCache;
pub use error::{CacheError, Result};
pub use lru_backend::{LruCacheBackend, LruLimits, LruStats};
pub use property::{
    CohortStats, FallbackPropertyPage, PropertyCache, PropertyPage, PropertyValue,
};
