//! State shared by everything one request spawns.

use crate::headers::RequestHeaders;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use swiftpage_core::{DeviceClass, LogRecord, TimestampMs};

/// Shared handle to a [`RequestContext`].
pub type RequestContextPtr = Arc<RequestContext>;

/// Per-request headers, device class, log record and cancellation flag.
#[derive(Debug)]
pub struct RequestContext {
    url: String,
    request_headers: RequestHeaders,
    device_class: DeviceClass,
    start_ms: TimestampMs,
    log_record: Mutex<LogRecord>,
    canceled: AtomicBool,
}

impl RequestContext {
    /// Creates a context for a request to `url`.
    pub fn new(
        url: impl Into<String>,
        request_headers: RequestHeaders,
        device_class: DeviceClass,
        start_ms: TimestampMs,
    ) -> RequestContextPtr {
        let url = url.into();
        let mut record = LogRecord::new(url.clone(), start_ms);
        record.device_class = Some(device_class.to_string());
        Arc::new(Self {
            url,
            request_headers,
            device_class,
            start_ms,
            log_record: Mutex::new(record),
            canceled: AtomicBool::new(false),
        })
    }

    /// A context for work not tied to a client request.
    pub fn background(url: impl Into<String>, start_ms: TimestampMs) -> RequestContextPtr {
        let ctx = Self::new(url, RequestHeaders::new(), DeviceClass::Desktop, start_ms);
        ctx.log_record().was_background_fetch = true;
        ctx
    }

    /// The request URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The request headers.
    pub fn request_headers(&self) -> &RequestHeaders {
        &self.request_headers
    }

    /// The device class.
    pub fn device_class(&self) -> DeviceClass {
        self.device_class
    }

    /// When the request started.
    pub fn start_ms(&self) -> TimestampMs {
        self.start_ms
    }

    /// Locks the log record.
    pub fn log_record(&self) -> MutexGuard<'_, LogRecord> {
        self.log_record.lock()
    }

    /// Marks the request canceled; outstanding work stops at its next
    /// suspension point.
    pub fn cancel(&self) {
        if !self.canceled.swap(true, Ordering::AcqRel) {
            tracing::debug!(url = %self.url, "request canceled");
        }
    }

    /// Whether the request was canceled.
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }
}
