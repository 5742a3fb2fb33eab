//! Inbound request model shared by the analyzer, the strategies and the host server

use crate::error::{ProxyError, Result};
use bytes::Bytes;
use http::header::{ACCEPT, HOST, RANGE};
use http::{HeaderMap, Method};
use reqwest::Url;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::task::JoinHandle;

/// A backend fetch for a navigation, started before the request was routed
///
/// Dropping the preload aborts the fetch, so an abandoned request does not
/// leave its fetch running.
pub struct Preload {
    task: JoinHandle<Result<reqwest::Response>>,
}

impl Preload {
    pub fn spawn<F>(fetch: F) -> Self
    where
        F: Future<Output = Result<reqwest::Response>> + Send + 'static,
    {
        Preload {
            task: tokio::spawn(fetch),
        }
    }
}

impl Future for Preload {
    type Output = Result<reqwest::Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.task).poll(cx).map(|joined| {
            joined
                .map_err(|e| ProxyError::InternalError(format!("Preload task failed: {}", e)))
                .and_then(|result| result)
        })
    }
}

impl Drop for Preload {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A request entering the engine, with an absolute URL
pub struct InboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
    preload: Option<Preload>,
}

impl InboundRequest {
    /// Create a GET-style request with no headers and no body
    pub fn new(method: Method, url: Url) -> Self {
        InboundRequest {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            preload: None,
        }
    }

    /// Build from an `http::Request`, reconstructing the absolute URL
    ///
    /// Absolute-form targets are used as-is. Origin-form targets are resolved
    /// against the `Host` header, using `X-Forwarded-Proto` when present and
    /// `default_scheme` otherwise.
    pub fn from_http(request: http::Request<Bytes>, default_scheme: &str) -> Result<Self> {
        let (parts, body) = request.into_parts();

        let url = if parts.uri.scheme().is_some() {
            Url::parse(&parts.uri.to_string())
                .map_err(|e| ProxyError::ParseError(format!("Invalid request URI: {}", e)))?
        } else {
            let host = parts
                .headers
                .get(HOST)
                .and_then(|h| h.to_str().ok())
                .or_else(|| parts.uri.authority().map(|a| a.as_str()))
                .ok_or_else(|| ProxyError::ParseError("Missing Host header".to_string()))?;
            let scheme = parts
                .headers
                .get("x-forwarded-proto")
                .and_then(|h| h.to_str().ok())
                .unwrap_or(default_scheme);
            let path_and_query = parts
                .uri
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/");
            Url::parse(&format!("{}://{}{}", scheme, host, path_and_query))
                .map_err(|e| ProxyError::ParseError(format!("Invalid request URL: {}", e)))?
        };

        Ok(InboundRequest {
            method: parts.method,
            url,
            headers: parts.headers,
            body,
            preload: None,
        })
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Attach a navigation preload that is already in flight
    pub fn set_preload(&mut self, preload: Preload) {
        self.preload = Some(preload);
    }

    pub fn take_preload(&mut self) -> Option<Preload> {
        self.preload.take()
    }

    pub fn has_preload(&self) -> bool {
        self.preload.is_some()
    }

    /// Header value as a string, if present and valid UTF-8
    pub fn header(&self, name: impl http::header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn range_header(&self) -> Option<&str> {
        self.header(RANGE)
    }

    pub fn has_range(&self) -> bool {
        self.headers.contains_key(RANGE)
    }

    /// Whether this is a top-level document navigation
    pub fn is_navigation(&self) -> bool {
        if self.header("sec-fetch-mode") == Some("navigate") {
            return true;
        }
        if self.header("sec-fetch-dest") == Some("document") {
            return true;
        }
        self.header(ACCEPT)
            .map(|accept| {
                accept
                    .split(',')
                    .any(|part| part.trim().starts_with("text/html"))
            })
            .unwrap_or(false)
    }
}

impl fmt::Debug for InboundRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundRequest")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .field("body_len", &self.body.len())
            .field("preload", &self.preload.is_some())
            .finish()
    }
}
