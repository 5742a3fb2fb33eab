//! Network access for the engine
//!
//! Same-origin requests are addressed to the engine's public origin but served
//! by the backend, so their URLs are rewritten before leaving the process.
//! Everything else goes out exactly as received.

use crate::config::TileProxyConfig;
use crate::error::{ProxyError, Result};
use crate::models::CachedResponse;
use crate::request::InboundRequest;
use http::header::{self, HeaderMap, HeaderName};
use reqwest::{redirect, Client, Url};
use std::time::Duration;
use tracing::debug;

/// Connection-scoped headers that must not be forwarded in either direction
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::HOST,
];

/// Copy a header map without hop-by-hop headers
pub fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    for name in HOP_BY_HOP.iter() {
        out.remove(name);
    }
    out.remove("keep-alive");
    out
}

/// Read a response fully into a cacheable entry
pub async fn materialize(response: reqwest::Response) -> Result<CachedResponse> {
    let status = response.status();
    let headers = strip_hop_by_hop(response.headers());
    let body = response.bytes().await?;
    Ok(CachedResponse::new(status, &headers, body))
}

/// Build the shared HTTP client
///
/// Redirects are followed a single hop.
pub fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .pool_max_idle_per_host(10)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_nodelay(true)
        .redirect(redirect::Policy::limited(1))
        .build()
        .map_err(|e| ProxyError::ConfigError(format!("Failed to create HTTP client: {}", e)))
}

/// HTTP client that knows the engine's origin and its backend
#[derive(Debug, Clone)]
pub struct OriginClient {
    client: Client,
    origin: Url,
    backend: Url,
}

impl OriginClient {
    pub fn new(client: Client, origin: Url, backend: Url) -> Self {
        OriginClient {
            client,
            origin,
            backend,
        }
    }

    pub fn from_config(config: &TileProxyConfig) -> Result<Self> {
        let client = build_client(Duration::from_secs(config.upstream_timeout_secs))?;
        Ok(Self::new(client, config.origin_url()?, config.backend_url()?))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// Scheme, host and port all match the engine's origin
    pub fn is_same_origin(&self, url: &Url) -> bool {
        url.origin() == self.origin.origin()
    }

    /// The URL actually contacted for `url`
    pub fn network_url(&self, url: &Url) -> Url {
        if !self.is_same_origin(url) {
            return url.clone();
        }
        let mut target = self.backend.clone();
        let base = self.backend.path().trim_end_matches('/');
        target.set_path(&format!("{}{}", base, url.path()));
        target.set_query(url.query());
        target
    }

    /// GET `url` with the client's end-to-end headers
    ///
    /// `Accept-Encoding` is dropped so that stored bodies are identity-encoded.
    pub async fn fetch_get(&self, url: &Url, headers: &HeaderMap) -> Result<reqwest::Response> {
        let target = self.network_url(url);
        debug!("GET {} via {}", url, target);
        let mut headers = strip_hop_by_hop(headers);
        headers.remove(header::ACCEPT_ENCODING);
        let response = self
            .client
            .get(target)
            .headers(headers)
            .send()
            .await?;
        Ok(response)
    }

    /// Forward a request verbatim: method, headers and body
    pub async fn forward(&self, request: &InboundRequest) -> Result<reqwest::Response> {
        let target = self.network_url(&request.url);
        debug!("{} {} forwarded to {}", request.method, request.url, target);

        let mut headers = strip_hop_by_hop(&request.headers);
        headers.remove(header::CONTENT_LENGTH);

        let mut builder = self
            .client
            .request(request.method.clone(), target)
            .headers(headers);
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }
        Ok(builder.send().await?)
    }
}
