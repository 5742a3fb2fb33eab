//! Core data models for the tile proxy engine

use crate::error::{ProxyError, Result};
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents a closed byte range for HTTP Range requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    /// Starting byte position (inclusive)
    pub start: u64,
    /// Ending byte position (inclusive)
    pub end: u64,
}

impl ByteRange {
    /// Create a new ByteRange
    ///
    /// # Returns
    /// * `Ok(ByteRange)` if the range is valid
    /// * `Err(ProxyError)` if start > end
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start > end {
            return Err(ProxyError::ParseError(format!(
                "start ({}) must be <= end ({})",
                start, end
            )));
        }
        Ok(ByteRange { start, end })
    }

    /// Get the size of this byte range in bytes
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Convert this ByteRange to an HTTP Range header value ("bytes=start-end")
    pub fn to_header(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// A client's requested byte window; `end` is `None` for open ranges like `bytes=100-`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RangeRequest {
    pub start: u64,
    pub end: Option<u64>,
}

impl RangeRequest {
    /// Window used when the client's Range header cannot be understood
    pub const DEFAULT: RangeRequest = RangeRequest { start: 0, end: None };

    /// Parse a single `bytes=start-` or `bytes=start-end` range
    ///
    /// Suffix ranges (`bytes=-N`) and multi-range lists are rejected, since they
    /// cannot be mapped onto one tile without knowing the total size.
    pub fn from_header(header: &str) -> Result<Self> {
        let header = header.trim();

        let range_part = header.strip_prefix("bytes=").ok_or_else(|| {
            ProxyError::ParseError(format!(
                "Range header must start with 'bytes=', got: {}",
                header
            ))
        })?;

        if range_part.contains(',') {
            return Err(ProxyError::ParseError(format!(
                "Multiple ranges are not supported: {}",
                range_part
            )));
        }

        let (start, end) = range_part.split_once('-').ok_or_else(|| {
            ProxyError::ParseError(format!(
                "Invalid range format, expected 'start-end', got: {}",
                range_part
            ))
        })?;

        let start = start
            .trim()
            .parse::<u64>()
            .map_err(|e| ProxyError::ParseError(format!("Invalid start value: {}", e)))?;

        let end = match end.trim() {
            "" => None,
            value => Some(
                value
                    .parse::<u64>()
                    .map_err(|e| ProxyError::ParseError(format!("Invalid end value: {}", e)))?,
            ),
        };

        if let Some(end) = end {
            if end < start {
                return Err(ProxyError::ParseError(format!(
                    "Range end {} precedes start {}",
                    end, start
                )));
            }
        }

        Ok(RangeRequest { start, end })
    }

    /// Parse a Range header, falling back to [`RangeRequest::DEFAULT`] when malformed
    pub fn from_header_or_default(header: &str) -> Self {
        match Self::from_header(header) {
            Ok(range) => range,
            Err(e) => {
                tracing::debug!("Malformed Range header '{}', using default window: {}", header, e);
                Self::DEFAULT
            }
        }
    }
}

/// Identifier of a remote large object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(String);

impl ObjectId {
    /// Create an ObjectId, rejecting empty identifiers and path separators
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() || id.contains('/') {
            return Err(ProxyError::ParseError(format!("Invalid object id: {:?}", id)));
        }
        Ok(ObjectId(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Total size of a remote object as it appears in a Content-Range header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TotalSize(pub Option<u64>);

impl fmt::Display for TotalSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(total) => write!(f, "{}", total),
            None => f.write_str("*"),
        }
    }
}

/// A parsed `Content-Range` response header
///
/// Accepts `bytes start-end/total`, `bytes start-end/*` and the unsatisfied
/// form `bytes */total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub range: Option<ByteRange>,
    pub total: Option<u64>,
}

impl ContentRange {
    pub fn parse(header: &str) -> Result<Self> {
        let header = header.trim();

        let range_part = header.strip_prefix("bytes ").ok_or_else(|| {
            ProxyError::ParseError(format!(
                "Content-Range must start with 'bytes ', got: {}",
                header
            ))
        })?;

        let (range_str, total_str) = range_part.split_once('/').ok_or_else(|| {
            ProxyError::ParseError(format!(
                "Invalid Content-Range format, expected 'start-end/total', got: {}",
                range_part
            ))
        })?;

        let total = match total_str.trim() {
            "*" => None,
            value => Some(
                value
                    .parse::<u64>()
                    .map_err(|e| ProxyError::ParseError(format!("Invalid total value: {}", e)))?,
            ),
        };

        let range = match range_str.trim() {
            "*" => None,
            value => {
                let (start, end) = value.split_once('-').ok_or_else(|| {
                    ProxyError::ParseError(format!(
                        "Invalid range format in Content-Range: {}",
                        value
                    ))
                })?;
                let start = start
                    .trim()
                    .parse::<u64>()
                    .map_err(|e| ProxyError::ParseError(format!("Invalid start value: {}", e)))?;
                let end = end
                    .trim()
                    .parse::<u64>()
                    .map_err(|e| ProxyError::ParseError(format!("Invalid end value: {}", e)))?;
                Some(ByteRange::new(start, end)?)
            }
        };

        if range.is_none() && total.is_none() {
            return Err(ProxyError::ParseError(format!(
                "Content-Range carries neither range nor total: {}",
                header
            )));
        }

        Ok(ContentRange { range, total })
    }
}

/// One fixed-size tile of a remote object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileSpec {
    pub index: u64,
    /// Absolute byte bounds of the tile (inclusive)
    pub range: ByteRange,
}

/// A response as held by the versioned cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Bytes,
}

impl CachedResponse {
    /// Capture status, headers and a materialized body
    pub fn new(status: StatusCode, headers: &HeaderMap, body: Bytes) -> Self {
        let headers = headers
            .iter()
            .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
            .collect();
        CachedResponse {
            status: status.as_u16(),
            headers,
            body,
        }
    }

    /// Only plain 200 responses are worth keeping
    pub fn is_cacheable(&self) -> bool {
        self.status == StatusCode::OK.as_u16()
    }

    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value),
            ) {
                map.append(name, value);
            }
        }
        map
    }

    /// Rebuild an HTTP response from the stored entry
    pub fn to_response(&self) -> Response<Bytes> {
        let mut response = Response::new(self.body.clone());
        *response.status_mut() = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        *response.headers_mut() = self.header_map();
        response
    }
}
