//! Response assembly: body types, tile slicing and pass-through conversion

use crate::error::{ProxyError, Result};
use crate::models::{CachedResponse, TotalSize};
use crate::network::strip_hop_by_hop;
use bytes::Bytes;
use futures::TryStreamExt;
use http::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE};
use http::{HeaderValue, Response, StatusCode};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::Frame;
use tracing::debug;

/// Body of every response produced by the engine
pub type ProxyBody = UnsyncBoxBody<Bytes, ProxyError>;

pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Stream an upstream body without buffering it
pub fn stream_body(response: reqwest::Response) -> ProxyBody {
    let stream = response
        .bytes_stream()
        .map_ok(Frame::data)
        .map_err(ProxyError::from);
    StreamBody::new(stream).boxed_unsync()
}

/// Relay an upstream response as-is, minus hop-by-hop headers
pub fn passthrough_response(upstream: reqwest::Response) -> Response<ProxyBody> {
    let status = upstream.status();
    let headers = strip_hop_by_hop(upstream.headers());
    let mut response = Response::new(stream_body(upstream));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

/// Serve a stored cache entry
pub fn cached_response(entry: &CachedResponse) -> Response<ProxyBody> {
    entry.to_response().map(full_body)
}

/// Plain-text error response for failures that escape the strategies
pub fn error_response(error: &ProxyError) -> Response<ProxyBody> {
    let status =
        StatusCode::from_u16(error.to_http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = Response::new(full_body(error.to_string()));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Builds partial-content responses from tile bytes
#[derive(Debug, Clone)]
pub struct ResponseAssembler {
    content_type: HeaderValue,
}

impl ResponseAssembler {
    pub fn new(content_type: &str) -> Self {
        let content_type = HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
        ResponseAssembler { content_type }
    }

    /// Cut `[request_start, response_end]` out of a tile starting at `tile_start`
    ///
    /// The body is exactly `response_end - request_start + 1` bytes, taken
    /// from offset `request_start - tile_start` of the tile.
    pub fn slice_and_respond(
        &self,
        bytes: &Bytes,
        request_start: u64,
        tile_start: u64,
        response_end: u64,
        total_size: Option<u64>,
    ) -> Result<Response<Bytes>> {
        if request_start < tile_start || response_end < request_start {
            return Err(ProxyError::InternalError(format!(
                "Window {}-{} does not fit tile starting at {}",
                request_start, response_end, tile_start
            )));
        }

        let offset = (request_start - tile_start) as usize;
        let length = (response_end - request_start + 1) as usize;
        if offset + length > bytes.len() {
            return Err(ProxyError::InternalError(format!(
                "Window {}-{} exceeds tile of {} bytes at {}",
                request_start,
                response_end,
                bytes.len(),
                tile_start
            )));
        }

        let body = bytes.slice(offset..offset + length);
        let content_range = format!(
            "bytes {}-{}/{}",
            request_start,
            response_end,
            TotalSize(total_size)
        );
        debug!("Serving {} ({} bytes)", content_range, length);

        let mut response = Response::new(body);
        *response.status_mut() = StatusCode::PARTIAL_CONTENT;
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, self.content_type.clone());
        headers.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(length as u64));
        headers.insert(
            CONTENT_RANGE,
            HeaderValue::from_str(&content_range)
                .map_err(|e| ProxyError::InternalError(format!("Invalid header value: {}", e)))?,
        );
        Ok(response)
    }

    /// 416 for a start at or past the end of the object
    pub fn unsatisfiable(&self, total_size: Option<u64>) -> Response<Bytes> {
        let mut response = Response::new(Bytes::new());
        *response.status_mut() = StatusCode::RANGE_NOT_SATISFIABLE;
        let content_range = format!("bytes */{}", TotalSize(total_size));
        if let Ok(value) = HeaderValue::from_str(&content_range) {
            response.headers_mut().insert(CONTENT_RANGE, value);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tile(len: usize) -> Bytes {
        Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
    }

    #[test]
    fn test_slice_whole_tile() {
        let assembler = ResponseAssembler::new("application/pdf");
        let data = tile(1024);
        let response = assembler
            .slice_and_respond(&data, 0, 0, 1023, Some(4096))
            .unwrap();

        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(response.headers()[CONTENT_RANGE], "bytes 0-1023/4096");
        assert_eq!(response.headers()[CONTENT_LENGTH], "1024");
        assert_eq!(response.headers()[CONTENT_TYPE], "application/pdf");
        assert_eq!(response.headers()[ACCEPT_RANGES], "bytes");
        assert_eq!(response.body(), &data);
    }

    #[test]
    fn test_slice_mid_tile_offset() {
        let assembler = ResponseAssembler::new("application/octet-stream");
        let data = tile(1024);
        let response = assembler
            .slice_and_respond(&data, 2048 + 100, 2048, 2048 + 199, None)
            .unwrap();

        assert_eq!(response.headers()[CONTENT_RANGE], "bytes 2148-2247/*");
        assert_eq!(response.body().len(), 100);
        assert_eq!(response.body().as_ref(), &data[100..200]);
    }

    #[test]
    fn test_slice_past_tile_rejected() {
        let assembler = ResponseAssembler::new("application/octet-stream");
        let data = tile(10);
        assert!(assembler.slice_and_respond(&data, 5, 0, 20, None).is_err());
        assert!(assembler.slice_and_respond(&data, 0, 5, 8, None).is_err());
    }

    #[test]
    fn test_unsatisfiable() {
        let assembler = ResponseAssembler::new("application/octet-stream");
        let response = assembler.unsatisfiable(Some(500));
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()[CONTENT_RANGE], "bytes */500");
    }

    #[test]
    fn test_error_response_status() {
        let response = error_response(&ProxyError::Offline("/page".to_string()));
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
