//! Writes proxied responses to a byte stream.

use std::io::Write;
use swiftpage_http::ResponseHeaders;
use swiftpage_rewrite::ResponseWriter;

/// Streams a response body into `W`, optionally preceded by the status
/// line and headers.
#[derive(Debug)]
pub struct StreamWriter<W: Write + Send> {
    out: W,
    include_headers: bool,
    status_code: Option<u16>,
    success: Option<bool>,
    error: Option<std::io::Error>,
}

impl<W: Write + Send> StreamWriter<W> {
    /// Creates a writer over `out`.
    pub fn new(out: W, include_headers: bool) -> Self {
        Self {
            out,
            include_headers,
            status_code: None,
            success: None,
            error: None,
        }
    }

    /// The status the response was sent with.
    pub fn status_code(&self) -> Option<u16> {
        self.status_code
    }

    /// The value passed to `done`, or `None` if the response never ended.
    pub fn success(&self) -> Option<bool> {
        self.success
    }

    /// Returns the underlying stream, or the first write error.
    pub fn finish(mut self) -> std::io::Result<W> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        self.out.flush()?;
        Ok(self.out)
    }

    fn record(&mut self, result: std::io::Result<()>) {
        if let Err(e) = result {
            if self.error.is_none() {
                tracing::warn!(error = %e, "writing response failed");
                self.error = Some(e);
            }
        }
    }
}

fn write_head(out: &mut impl Write, headers: &ResponseHeaders) -> std::io::Result<()> {
    writeln!(out, "HTTP/1.1 {}", headers.status_code())?;
    for (name, value) in headers.iter() {
        writeln!(out, "{name}: {value}")?;
    }
    writeln!(out)
}

impl<W: Write + Send> ResponseWriter for StreamWriter<W> {
    fn headers_complete(&mut self, headers: &ResponseHeaders) {
        self.status_code = Some(headers.status_code());
        if self.include_headers {
            let result = write_head(&mut self.out, headers);
            self.record(result);
        }
    }

    fn write(&mut self, bytes: &[u8]) {
        if self.error.is_none() {
            let result = self.out.write_all(bytes);
            self.record(result);
        }
    }

    fn flush(&mut self) {
        if self.error.is_none() {
            let result = self.out.flush();
            self.record(result);
        }
    }

    fn done(&mut self, success: bool) {
        self.success = Some(success);
    }
}
