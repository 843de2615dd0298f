//! Serialized form of a response stored in a cache.
//!
//! ```text
//! +-----------+----------------------+-----------+
//! | u32 BE n  | n bytes header JSON  | body      |
//! +-----------+----------------------+-----------+
//! ```

use crate::error::{HttpError, Result};
use crate::headers::ResponseHeaders;
use bytes::{BufMut, Bytes, BytesMut};

/// A response (headers and body) as stored in the HTTP cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpValue {
    /// Status and headers.
    pub headers: ResponseHeaders,
    /// Body bytes.
    pub body: Bytes,
}

impl HttpValue {
    /// Creates a value.
    pub fn new(headers: ResponseHeaders, body: impl Into<Bytes>) -> Self {
        Self {
            headers,
            body: body.into(),
        }
    }

    /// Encodes the value for storage.
    pub fn encode(&self) -> Result<Bytes> {
        let header_json = serde_json::to_vec(&self.headers)?;
        let header_len = u32::try_from(header_json.len())
            .map_err(|_| HttpError::Decode("headers too large".to_string()))?;
        let mut out = BytesMut::with_capacity(4 + header_json.len() + self.body.len());
        out.put_u32(header_len);
        out.put_slice(&header_json);
        out.put_slice(&self.body);
        Ok(out.freeze())
    }

    /// Decodes a stored value.
    pub fn decode(data: &Bytes) -> Result<Self> {
        let len_bytes: [u8; 4] = data
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| HttpError::Decode("truncated length prefix".to_string()))?;
        let header_len = u32::from_be_bytes(len_bytes) as usize;
        let header_end = 4usize
            .checked_add(header_len)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| HttpError::Decode("truncated headers".to_string()))?;
        let headers: ResponseHeaders = serde_json::from_slice(&data[4..header_end])
            .map_err(|e| HttpError::Decode(e.to_string()))?;
        Ok(Self {
            headers,
            body: data.slice(header_end..),
        })
    }
}
