//! Error types for HTTP operations.

use thiserror::Error;

/// Errors that can occur in HTTP handling.
#[derive(Debug, Error)]
pub enum HttpError {
    /// A cached value could not be decoded.
    #[error("corrupt cached value: {0}")]
    Decode(String),

    /// A fetch failed.
    #[error("fetch of {url} failed: {reason}")]
    Fetch {
        /// The URL that was fetched.
        url: String,
        /// Why the fetch failed.
        reason: String,
    },

    /// Headers could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The cache backend failed.
    #[error(transparent)]
    Cache(#[from] swiftpage_cache::CacheError),
}

impl HttpError {
    /// Creates a fetch error.
    #[must_use]
    pub fn fetch(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Fetch {
            url: url.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for HTTP operations.
pub type Result<T> = std::result::Result<T, HttpError>;
