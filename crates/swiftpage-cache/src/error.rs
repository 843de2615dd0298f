//! Error types for cache operations.

use thiserror::Error;

/// Errors that can occur in cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The backing store failed.
    #[error("cache backend error: {0}")]
    Backend(String),

    /// A cohort was used without being registered.
    #[error("unknown cohort: {0}")]
    UnknownCohort(String),

    /// A stored value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A core error occurred.
    #[error(transparent)]
    Core(#[from] swiftpage_core::Error),
}

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
