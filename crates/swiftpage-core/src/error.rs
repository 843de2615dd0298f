//! Error types for SwiftPage core operations.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The main error type for core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration could not be loaded or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// A configuration value failed validation.
    #[error("invalid option: {field} - {message}")]
    InvalidOption {
        /// The option that was invalid.
        field: &'static str,
        /// A description of why the value was rejected.
        message: String,
    },

    /// A rewritten resource name could not be decoded.
    #[error("invalid encoded name: {0}")]
    Decode(String),

    /// A URL could not be parsed or resolved.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// A wildcard pattern could not be compiled.
    #[error("invalid wildcard pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A serialization error occurred.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A specialized Result type for core operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new decode error.
    #[must_use]
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    /// Creates a new invalid option error.
    #[must_use]
    pub fn invalid_option(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidOption {
            field,
            message: message.into(),
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::InvalidUrl(err.to_string())
    }
}

/// The ways a single rewrite can fail to produce an output.
///
/// The kind decides whether the failure is remembered in the metadata
/// cache, retried on the next request, or treated as a permanent
/// configuration decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewriteErrorKind {
    /// An input could not be fetched.
    FetchFailed,
    /// An input lives on a domain the domain lawyer does not authorize.
    InputUnauthorized,
    /// An input is not cacheable long enough to be rewritten.
    InputUncacheable,
    /// The transformer declined to optimize the inputs.
    TransformerDeclined,
    /// The transformer failed.
    TransformerErrored,
    /// The rewrite did not finish before its deadline.
    DeadlineExceeded,
    /// Queued work was dropped because the worker queue was full.
    LoadShed,
    /// An encoded resource name could not be decoded.
    DecodeInvalid,
    /// Writing a rewrite result to cache failed.
    CacheWriteFailed,
}

impl RewriteErrorKind {
    /// All kinds, in declaration order.
    pub const ALL: [RewriteErrorKind; 9] = [
        Self::FetchFailed,
        Self::InputUnauthorized,
        Self::InputUncacheable,
        Self::TransformerDeclined,
        Self::TransformerErrored,
        Self::DeadlineExceeded,
        Self::LoadShed,
        Self::DecodeInvalid,
        Self::CacheWriteFailed,
    ];

    /// Returns the stable code used in logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::FetchFailed => "fetch_failed",
            Self::InputUnauthorized => "input_unauthorized",
            Self::InputUncacheable => "input_uncacheable",
            Self::TransformerDeclined => "transformer_declined",
            Self::TransformerErrored => "transformer_errored",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::LoadShed => "load_shed",
            Self::DecodeInvalid => "decode_invalid",
            Self::CacheWriteFailed => "cache_write_failed",
        }
    }

    /// Whether a failure of this kind is remembered in the metadata cache.
    #[must_use]
    pub const fn is_memoizable(&self) -> bool {
        matches!(
            self,
            Self::FetchFailed
                | Self::InputUncacheable
                | Self::TransformerDeclined
                | Self::TransformerErrored
        )
    }

    /// Whether the next request may succeed without any change.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::DeadlineExceeded | Self::LoadShed)
    }

    /// Whether the failure is a configuration decision that never changes.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::InputUnauthorized | Self::DecodeInvalid)
    }
}

impl fmt::Display for RewriteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
