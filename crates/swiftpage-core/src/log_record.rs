//! Per-request structured log record.
//!
//! One record is kept per request. Rewrite contexts append the outcome of
//! every rewriter they run, fetchers record latency, and the driver emits
//! the record once as a single `info` event when the request completes.

use crate::error::RewriteErrorKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Target of the request-completion event.
pub const REQUEST_LOG_TARGET: &str = "swiftpage::request";

/// Outcome of one rewriter on one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewriterStatus {
    /// The reference was replaced with a rewritten URL.
    Applied,
    /// The rewrite finished too late or in the background; the original
    /// reference was kept.
    NotApplied,
    /// The rewrite failed.
    Failed,
}

/// One entry in [`LogRecord::rewriters`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriterInfo {
    /// Transformer id.
    pub id: String,
    /// Outcome.
    pub status: RewriterStatus,
    /// Failure kind, when `status` is not `applied`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RewriteErrorKind>,
    /// The input URL.
    pub url: String,
}

/// Latencies measured during the request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingInfo {
    /// Request start, in milliseconds since the epoch.
    pub request_start_ms: i64,
    /// Time until the origin response headers arrived.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header_fetch_ms: Option<i64>,
    /// Time until the origin response completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch_ms: Option<i64>,
    /// Time until the property-cache lookup completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub property_cache_ms: Option<i64>,
    /// Total time until the request completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_ms: Option<i64>,
}

/// The per-request record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Unique id of the request.
    pub request_id: Uuid,
    /// URL of the request.
    pub url: String,
    /// Status code sent downstream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Device class used for property-cache keys.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<String>,
    /// Whether any origin fetch for this request ran in the background.
    pub was_background_fetch: bool,
    /// Whether the HTML parse limit was exceeded.
    pub parse_size_limit_exceeded: bool,
    /// Rewriter outcomes in the order they were recorded.
    pub rewriters: Vec<RewriterInfo>,
    /// Failure counts by kind.
    pub errors: BTreeMap<String, u32>,
    /// Latencies.
    pub timing: TimingInfo,
}

impl LogRecord {
    /// Creates a record for a new request.
    pub fn new(url: impl Into<String>, request_start_ms: i64) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            url: url.into(),
            timing: TimingInfo {
                request_start_ms,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Records a successful rewrite.
    pub fn log_applied(&mut self, id: &str, url: &str) {
        self.rewriters.push(RewriterInfo {
            id: id.to_string(),
            status: RewriterStatus::Applied,
            error: None,
            url: url.to_string(),
        });
    }

    /// Records a rewrite that did not change the page.
    pub fn log_not_applied(&mut self, id: &str, url: &str, error: Option<RewriteErrorKind>) {
        let status = match error {
            Some(kind) if !kind.is_transient() => RewriterStatus::Failed,
            _ => RewriterStatus::NotApplied,
        };
        if let Some(kind) = error {
            self.log_error(kind);
        }
        self.rewriters.push(RewriterInfo {
            id: id.to_string(),
            status,
            error,
            url: url.to_string(),
        });
    }

    /// Counts a failure.
    pub fn log_error(&mut self, kind: RewriteErrorKind) {
        *self.errors.entry(kind.as_str().to_string()).or_default() += 1;
    }

    /// Number of rewriters with the given status.
    pub fn count(&self, status: RewriterStatus) -> usize {
        self.rewriters.iter().filter(|r| r.status == status).count()
    }

    /// Renders the record as JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Emits the record as one `info` event.
    pub fn emit(&self) {
        tracing::info!(
            target: REQUEST_LOG_TARGET,
            request_id = %self.request_id,
            url = %self.url,
            applied = self.count(RewriterStatus::Applied),
            record = %self.to_json(),
            "request complete"
        );
    }
}
