//! Request classification
//!
//! Decides, per request, which handling path applies. The checks run in a
//! fixed order and the first match wins.

use crate::config::TileProxyConfig;
use crate::error::Result;
use crate::models::ObjectId;
use crate::request::InboundRequest;
use http::Method;
use percent_encoding::percent_decode_str;
use reqwest::Url;
use tracing::debug;

/// Why a request is relayed without interception
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassReason {
    ExcludedScheme,
    NonGet,
    CrossOrigin,
    InsecureScheme,
}

/// Handling path for one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Relay untouched
    Passthrough(PassReason),
    /// Tiled large-object proxy
    LargeObject(ObjectId),
    /// A same-origin request carrying its own Range; relayed untouched
    RangePassthrough,
    /// Network-first document navigation
    Navigation,
    /// Stale-while-revalidate asset
    Asset,
}

impl Route {
    /// Label used in logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            Route::Passthrough(_) => "passthrough",
            Route::LargeObject(_) => "large_object",
            Route::RangePassthrough => "range_passthrough",
            Route::Navigation => "navigation",
            Route::Asset => "asset",
        }
    }
}

/// Classifies requests against the engine's origin and path layout
#[derive(Debug, Clone)]
pub struct RequestAnalyzer {
    origin: Url,
    dev_hosts: Vec<String>,
    excluded_schemes: Vec<String>,
    proxy_prefix: String,
}

impl RequestAnalyzer {
    pub fn new(config: &TileProxyConfig) -> Result<Self> {
        Ok(RequestAnalyzer {
            origin: config.origin_url()?,
            dev_hosts: config.dev_hosts.clone(),
            excluded_schemes: config.excluded_schemes.clone(),
            proxy_prefix: config.proxy_prefix.clone(),
        })
    }

    /// Plain http is only intercepted for local development hosts
    fn is_secure(&self, url: &Url) -> bool {
        match url.scheme() {
            "https" => true,
            "http" => url
                .host_str()
                .map(|host| self.dev_hosts.iter().any(|dev| dev == host))
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Object id when `path` is `<proxy prefix><id>` with a single segment id
    ///
    /// `path` is percent-encoded as it appears in the URL; the id is decoded.
    pub fn object_id(&self, path: &str) -> Option<ObjectId> {
        let id = path.strip_prefix(&self.proxy_prefix)?;
        let id = percent_decode_str(id).decode_utf8().ok()?;
        ObjectId::new(id).ok()
    }

    pub fn classify(&self, request: &InboundRequest) -> Route {
        let url = &request.url;

        let route = if self
            .excluded_schemes
            .iter()
            .any(|scheme| scheme == url.scheme())
        {
            Route::Passthrough(PassReason::ExcludedScheme)
        } else if request.method != Method::GET {
            Route::Passthrough(PassReason::NonGet)
        } else if url.origin() != self.origin.origin() {
            Route::Passthrough(PassReason::CrossOrigin)
        } else if !self.is_secure(url) {
            Route::Passthrough(PassReason::InsecureScheme)
        } else if let Some(object) = self.object_id(url.path()) {
            Route::LargeObject(object)
        } else if request.has_range() {
            Route::RangePassthrough
        } else if request.is_navigation() {
            Route::Navigation
        } else {
            Route::Asset
        };

        debug!("{} {} classified as {:?}", request.method, url, route);
        route
    }
}
