//! Error types for the rewrite pipeline.

use swiftpage_core::RewriteErrorKind;
use thiserror::Error;

/// Errors raised while setting up or driving rewrites.
///
/// Per-resource rewrite failures are not errors at this level: they are
/// reported as a [`RewriteErrorKind`] on the outcome of the rewrite and the
/// original reference is kept.
#[derive(Debug, Error)]
pub enum RewriteError {
    /// Invalid options or domain rules.
    #[error("core error: {0}")]
    Core(#[from] swiftpage_core::Error),

    /// A cache backend failed.
    #[error("cache error: {0}")]
    Cache(#[from] swiftpage_cache::CacheError),

    /// An HTTP-layer failure.
    #[error("http error: {0}")]
    Http(#[from] swiftpage_http::HttpError),

    /// A transformer with this id is already registered.
    #[error("duplicate transformer id: {0}")]
    DuplicateTransformer(String),

    /// A transformer id is not two or three alphanumerics.
    #[error("invalid transformer id: {0}")]
    InvalidTransformerId(String),

    /// A rewrite of one resource failed.
    #[error("rewrite failed: {0}")]
    Rewrite(RewriteErrorKind),

    /// The options failed validation.
    #[error("invalid options: {0}")]
    InvalidOptions(String),

    /// A worker pool has shut down.
    #[error("worker pool shut down")]
    PoolShutDown,

    /// A worker thread could not be started.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for rewrite operations.
pub type Result<T> = std::result::Result<T, RewriteError>;

impl From<RewriteErrorKind> for RewriteError {
    fn from(kind: RewriteErrorKind) -> Self {
        Self::Rewrite(kind)
    }
}
