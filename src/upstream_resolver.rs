//! Upstream resolution for large objects
//!
//! An object can be reached through several endpoints. Readable (CORS-capable)
//! endpoints let the engine inspect and store tile bytes; opaque endpoints
//! can only be relayed. Resolution picks one endpoint per object and learns
//! the object's total size when it can.

use crate::config::UpstreamConfig;
use crate::error::{ProxyError, Result};
use crate::models::{ContentRange, ObjectId};
use http::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::{Client, Url};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// One way of fetching an object
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamCandidate {
    pub url: Url,
    /// Whether response bytes may be read (and stored) by the engine
    pub cors_capable: bool,
    /// Position in the endpoint list; lower is preferred
    pub priority: usize,
    /// Extra request headers, e.g. an access key
    pub headers: HeaderMap,
}

/// The chosen candidate and what is known about the object's size
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub candidate: UpstreamCandidate,
    pub total_size: Option<u64>,
}

/// Something that can address an object by id
pub trait UpstreamEndpoint: Send + Sync {
    fn cors_capable(&self) -> bool;

    /// URL and headers for `object`
    fn locate(&self, object: &ObjectId) -> Result<(Url, HeaderMap)>;
}

/// A readable API endpoint, optionally keyed
#[derive(Debug, Clone)]
pub struct ApiEndpoint {
    template: String,
    access_key: Option<String>,
    auth_header: Option<HeaderName>,
}

impl ApiEndpoint {
    pub fn new(template: impl Into<String>) -> Self {
        ApiEndpoint {
            template: template.into(),
            access_key: None,
            auth_header: None,
        }
    }

    pub fn with_access_key(mut self, key: impl Into<String>) -> Self {
        self.access_key = Some(key.into());
        self
    }

    pub fn with_auth_header(mut self, header: HeaderName) -> Self {
        self.auth_header = Some(header);
        self
    }
}

impl UpstreamEndpoint for ApiEndpoint {
    fn cors_capable(&self) -> bool {
        true
    }

    fn locate(&self, object: &ObjectId) -> Result<(Url, HeaderMap)> {
        let url = expand_template(&self.template, object, self.access_key.as_deref())?;
        let mut headers = HeaderMap::new();
        if let (Some(name), Some(key)) = (&self.auth_header, &self.access_key) {
            let value = HeaderValue::from_str(key)
                .map_err(|e| ProxyError::ConfigError(format!("Invalid access key: {}", e)))?;
            headers.insert(name.clone(), value);
        }
        Ok((url, headers))
    }
}

/// An endpoint whose responses cannot be read, only relayed
#[derive(Debug, Clone)]
pub struct OpaqueEndpoint {
    template: String,
}

impl OpaqueEndpoint {
    pub fn new(template: impl Into<String>) -> Self {
        OpaqueEndpoint {
            template: template.into(),
        }
    }
}

impl UpstreamEndpoint for OpaqueEndpoint {
    fn cors_capable(&self) -> bool {
        false
    }

    fn locate(&self, object: &ObjectId) -> Result<(Url, HeaderMap)> {
        Ok((expand_template(&self.template, object, None)?, HeaderMap::new()))
    }
}

/// Everything outside the RFC 3986 unreserved set is encoded
static COMPONENT_ENCODE_SET: AsciiSet = NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

fn encode_component(value: &str) -> String {
    utf8_percent_encode(value, &COMPONENT_ENCODE_SET).to_string()
}

fn expand_template(template: &str, object: &ObjectId, key: Option<&str>) -> Result<Url> {
    let mut expanded = template.replace("{id}", &encode_component(object.as_str()));
    if expanded.contains("{key}") {
        let key = key.ok_or_else(|| {
            ProxyError::ConfigError(format!("Template {} needs an access key", template))
        })?;
        expanded = expanded.replace("{key}", &encode_component(key));
    }
    Url::parse(&expanded)
        .map_err(|e| ProxyError::ConfigError(format!("Invalid upstream URL {}: {}", expanded, e)))
}

/// Chooses an upstream per object and memoizes known sizes
pub struct UpstreamResolver {
    client: Client,
    endpoints: Vec<Box<dyn UpstreamEndpoint>>,
    resolved: RwLock<HashMap<ObjectId, Resolution>>,
}

impl UpstreamResolver {
    pub fn new(client: Client) -> Self {
        UpstreamResolver {
            client,
            endpoints: Vec::new(),
            resolved: RwLock::new(HashMap::new()),
        }
    }

    /// Endpoints in configured priority order: API first, then fallbacks
    pub fn from_config(config: &UpstreamConfig, client: Client) -> Result<Self> {
        let mut resolver = Self::new(client);
        if let Some(api) = &config.api {
            let mut endpoint = ApiEndpoint::new(&api.url_template);
            if let Some(key) = &api.access_key {
                endpoint = endpoint.with_access_key(key);
            }
            if let Some(header) = &api.auth_header {
                let name = HeaderName::from_bytes(header.as_bytes()).map_err(|e| {
                    ProxyError::ConfigError(format!("Invalid auth header {}: {}", header, e))
                })?;
                endpoint = endpoint.with_auth_header(name);
            }
            resolver = resolver.with_endpoint(endpoint);
        }
        for fallback in &config.fallbacks {
            resolver = resolver.with_endpoint(OpaqueEndpoint::new(&fallback.url_template));
        }
        Ok(resolver)
    }

    pub fn with_endpoint(mut self, endpoint: impl UpstreamEndpoint + 'static) -> Self {
        self.endpoints.push(Box::new(endpoint));
        self
    }

    /// Every candidate for `object`, in priority order
    pub fn candidates(&self, object: &ObjectId) -> Vec<UpstreamCandidate> {
        self.endpoints
            .iter()
            .enumerate()
            .filter_map(|(priority, endpoint)| match endpoint.locate(object) {
                Ok((url, headers)) => Some(UpstreamCandidate {
                    url,
                    cors_capable: endpoint.cors_capable(),
                    priority,
                    headers,
                }),
                Err(e) => {
                    warn!("Skipping endpoint {} for object {}: {}", priority, object, e);
                    None
                }
            })
            .collect()
    }

    /// Learn the total size of the resource at `url`
    ///
    /// Tries a HEAD request first, then a one-byte ranged GET whose
    /// Content-Range carries the total. Returns `None` when neither works.
    pub async fn probe_size(&self, url: &Url, headers: &HeaderMap) -> Option<u64> {
        match self.client.head(url.clone()).headers(headers.clone()).send().await {
            Ok(response) if response.status().is_success() => {
                let size = response
                    .headers()
                    .get(CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .filter(|size| *size > 0);
                if size.is_some() {
                    debug!("HEAD {} reports size {:?}", url, size);
                    return size;
                }
            }
            Ok(response) => debug!("HEAD {} returned {}", url, response.status()),
            Err(e) => debug!("HEAD {} failed: {}", url, e),
        }

        let response = match self
            .client
            .get(url.clone())
            .headers(headers.clone())
            .header(RANGE, "bytes=0-0")
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                debug!("Range probe of {} failed: {}", url, e);
                return None;
            }
        };

        if response.status() != StatusCode::PARTIAL_CONTENT {
            debug!("Range probe of {} returned {}", url, response.status());
            return None;
        }

        response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| ContentRange::parse(v).ok())
            .and_then(|cr| cr.total)
    }

    /// Choose a candidate for `object`
    ///
    /// Readable candidates are probed in order and the first with a known
    /// size wins. Reaching an opaque candidate first selects it with an
    /// unknown size. When every probe fails and no opaque candidate exists,
    /// the first readable candidate is used with an unknown size. Only
    /// known-size resolutions are remembered.
    pub async fn resolve(&self, object: &ObjectId) -> Result<Resolution> {
        if let Some(resolution) = self.resolved.read().await.get(object) {
            return Ok(resolution.clone());
        }

        let candidates = self.candidates(object);
        let mut first_readable: Option<UpstreamCandidate> = None;

        for candidate in candidates {
            if !candidate.cors_capable {
                info!(
                    "Object {} resolved to opaque candidate {} (size unknown)",
                    object, candidate.url
                );
                return Ok(Resolution {
                    candidate,
                    total_size: None,
                });
            }

            if let Some(size) = self.probe_size(&candidate.url, &candidate.headers).await {
                info!(
                    "Object {} resolved to {} with size {}",
                    object, candidate.url, size
                );
                let resolution = Resolution {
                    candidate,
                    total_size: Some(size),
                };
                self.resolved
                    .write()
                    .await
                    .insert(object.clone(), resolution.clone());
                return Ok(resolution);
            }

            warn!("Size probe failed for {} via {}", object, candidate.url);
            if first_readable.is_none() {
                first_readable = Some(candidate);
            }
        }

        match first_readable {
            Some(candidate) => {
                info!(
                    "Object {} resolved to {} with unknown size",
                    object, candidate.url
                );
                Ok(Resolution {
                    candidate,
                    total_size: None,
                })
            }
            None => Err(ProxyError::NoUsableCandidate(object.to_string())),
        }
    }

    /// Forget a memoized resolution
    pub async fn forget(&self, object: &ObjectId) {
        self.resolved.write().await.remove(object);
    }

    pub async fn forget_all(&self) {
        self.resolved.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiEndpointConfig, FallbackEndpointConfig};

    fn object(id: &str) -> ObjectId {
        ObjectId::new(id).unwrap()
    }

    #[test]
    fn test_expand_template_encodes_id() {
        let url = expand_template(
            "https://api.example.com/files/{id}?alt=media&key={key}",
            &object("a b+c"),
            Some("k&1"),
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.example.com/files/a%20b%2Bc?alt=media&key=k%261"
        );
    }

    #[test]
    fn test_encode_component_non_ascii() {
        assert_eq!(encode_component("été~1.pdf"), "%C3%A9t%C3%A9~1.pdf");
        assert_eq!(encode_component("a/b"), "a%2Fb");
    }

    #[test]
    fn test_expand_template_missing_key() {
        assert!(expand_template("https://x/{id}?key={key}", &object("a"), None).is_err());
    }

    #[test]
    fn test_candidates_in_priority_order() {
        let config = UpstreamConfig {
            api: Some(ApiEndpointConfig {
                url_template: "https://api.example.com/{id}".to_string(),
                access_key: Some("secret".to_string()),
                auth_header: Some("x-api-key".to_string()),
            }),
            fallbacks: vec![FallbackEndpointConfig {
                url_template: "https://mirror.example.com/uc?id={id}".to_string(),
            }],
        };
        let resolver = UpstreamResolver::from_config(&config, Client::new()).unwrap();
        let candidates = resolver.candidates(&object("doc1"));

        assert_eq!(candidates.len(), 2);
        assert!(candidates[0].cors_capable);
        assert_eq!(candidates[0].priority, 0);
        assert_eq!(candidates[0].headers["x-api-key"], "secret");
        assert!(!candidates[1].cors_capable);
        assert_eq!(
            candidates[1].url.as_str(),
            "https://mirror.example.com/uc?id=doc1"
        );
    }

    #[tokio::test]
    async fn test_resolve_without_endpoints() {
        let resolver = UpstreamResolver::new(Client::new());
        assert!(matches!(
            resolver.resolve(&object("x")).await,
            Err(ProxyError::NoUsableCandidate(_))
        ));
    }

    #[tokio::test]
    async fn test_opaque_first_resolves_without_probing() {
        let resolver =
            UpstreamResolver::new(Client::new()).with_endpoint(OpaqueEndpoint::new("http://127.0.0.1:1/{id}"));
        let resolution = resolver.resolve(&object("x")).await.unwrap();
        assert!(!resolution.candidate.cors_capable);
        assert_eq!(resolution.total_size, None);
    }
}
