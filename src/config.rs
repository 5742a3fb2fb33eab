//! Configuration management for the tile proxy engine

use crate::error::{ProxyError, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Configuration for the proxy engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TileProxyConfig {
    /// Address the proxy listens on (default: 127.0.0.1:8080)
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// The engine's own public origin; only requests to this origin are cached
    #[serde(default = "default_origin")]
    pub origin: String,

    /// Where same-origin network fetches are sent
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Hosts allowed over plain http (local development exception)
    #[serde(default = "default_dev_hosts")]
    pub dev_hosts: Vec<String>,

    /// URL schemes that are never intercepted
    #[serde(default = "default_excluded_schemes")]
    pub excluded_schemes: Vec<String>,

    /// Cache namespace, combined with `cache_version` into the generation name
    #[serde(default = "default_cache_namespace")]
    pub cache_namespace: String,

    /// Cache version; bump it to retire every previously stored generation
    #[serde(default = "default_cache_version")]
    pub cache_version: String,

    /// Volatile query parameter stripped from cache keys
    #[serde(default = "default_cache_buster_param")]
    pub cache_buster_param: String,

    /// Asset paths fetched and stored at install time
    #[serde(default)]
    pub precache_assets: Vec<String>,

    /// Document served to navigations when offline and nothing is cached
    #[serde(default = "default_offline_shell")]
    pub offline_shell: String,

    /// Path prefix of the large-object proxy; followed by the object id
    #[serde(default = "default_proxy_prefix")]
    pub proxy_prefix: String,

    /// Content-Type of tiled large-object responses
    #[serde(default = "default_tile_content_type")]
    pub tile_content_type: String,

    /// Size of each tile in bytes (default: 4MB)
    /// Valid range: 64KB to 64MB
    #[serde(default = "default_tile_size")]
    pub tile_size: u64,

    /// Directory for the versioned cache (in-memory when unset)
    #[serde(default)]
    pub cache_dir: Option<String>,

    /// Tile persistence settings
    #[serde(default)]
    pub tile_store: TileStoreConfig,

    /// Upstream endpoints for large objects
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Timeout for upstream and backend requests in seconds
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,

    /// Maximum number of retries for a failed tile fetch (default: 2)
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Maximum number of concurrent asset fetches during install (default: 4)
    #[serde(default = "default_max_concurrent_installs")]
    pub max_concurrent_installs: usize,

    /// Activate a freshly installed cache generation without waiting (default: true)
    #[serde(default = "default_true")]
    pub activate_immediately: bool,

    /// Admin endpoint configuration (optional)
    #[serde(default)]
    pub admin_endpoint: Option<AdminEndpointConfig>,
}

/// Configuration for tile persistence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TileStoreConfig {
    /// Whether tiles are persisted at all (default: true)
    ///
    /// Without a tile store the large-object path streams straight from upstream.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Directory for tile files (in-memory when unset)
    #[serde(default)]
    pub dir: Option<String>,
}

impl Default for TileStoreConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            dir: None,
        }
    }
}

/// Upstream endpoints, in priority order: the API endpoint first, then fallbacks
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UpstreamConfig {
    /// Direct, CORS-capable API endpoint
    #[serde(default)]
    pub api: Option<ApiEndpointConfig>,

    /// Opaque endpoints that can only be passed through
    #[serde(default)]
    pub fallbacks: Vec<FallbackEndpointConfig>,
}

/// A readable API endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiEndpointConfig {
    /// URL template with `{id}` and optionally `{key}` placeholders
    pub url_template: String,

    /// Access key substituted for `{key}`
    #[serde(default)]
    pub access_key: Option<String>,

    /// Header carrying the access key, e.g. "x-api-key" (optional)
    #[serde(default)]
    pub auth_header: Option<String>,
}

/// An opaque fallback endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FallbackEndpointConfig {
    /// URL template with an `{id}` placeholder
    pub url_template: String,
}

/// Configuration for the admin HTTP endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdminEndpointConfig {
    /// Whether to enable the admin endpoint (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Address to bind the admin endpoint to (default: "127.0.0.1:9090")
    #[serde(default = "default_admin_address")]
    pub address: String,
}

impl Default for AdminEndpointConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_admin_address(),
        }
    }
}

// Default value functions for serde
fn default_listen_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_origin() -> String {
    "http://localhost:8080".to_string()
}

fn default_backend() -> String {
    "http://127.0.0.1:3000".to_string()
}

fn default_dev_hosts() -> Vec<String> {
    vec![
        "localhost".to_string(),
        "127.0.0.1".to_string(),
        "[::1]".to_string(),
    ]
}

fn default_excluded_schemes() -> Vec<String> {
    vec![
        "blob".to_string(),
        "data".to_string(),
        "chrome-extension".to_string(),
    ]
}

fn default_cache_namespace() -> String {
    "tile-proxy".to_string()
}

fn default_cache_version() -> String {
    "v1".to_string()
}

fn default_cache_buster_param() -> String {
    "v".to_string()
}

fn default_offline_shell() -> String {
    "/offline.html".to_string()
}

fn default_proxy_prefix() -> String {
    "/largefile/".to_string()
}

fn default_tile_content_type() -> String {
    "application/octet-stream".to_string()
}

fn default_tile_size() -> u64 {
    4 * 1024 * 1024 // 4MB
}

fn default_upstream_timeout() -> u64 {
    30
}

fn default_max_retries() -> usize {
    2
}

fn default_max_concurrent_installs() -> usize {
    4
}

fn default_true() -> bool {
    true
}

fn default_admin_address() -> String {
    "127.0.0.1:9090".to_string()
}

impl Default for TileProxyConfig {
    fn default() -> Self {
        TileProxyConfig {
            listen_address: default_listen_address(),
            origin: default_origin(),
            backend: default_backend(),
            dev_hosts: default_dev_hosts(),
            excluded_schemes: default_excluded_schemes(),
            cache_namespace: default_cache_namespace(),
            cache_version: default_cache_version(),
            cache_buster_param: default_cache_buster_param(),
            precache_assets: Vec::new(),
            offline_shell: default_offline_shell(),
            proxy_prefix: default_proxy_prefix(),
            tile_content_type: default_tile_content_type(),
            tile_size: default_tile_size(),
            cache_dir: None,
            tile_store: TileStoreConfig::default(),
            upstream: UpstreamConfig::default(),
            upstream_timeout_secs: default_upstream_timeout(),
            max_retries: default_max_retries(),
            max_concurrent_installs: default_max_concurrent_installs(),
            activate_immediately: default_true(),
            admin_endpoint: None,
        }
    }
}

impl TileProxyConfig {
    /// Load configuration from a YAML file
    ///
    /// # Returns
    /// * `Ok(TileProxyConfig)` if loading and validation succeed
    /// * `Err(ProxyError)` if file cannot be read or config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to read config file: {}", e))
        })?;

        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: TileProxyConfig = serde_yaml::from_str(content).map_err(|e| {
            ProxyError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - tile_size must be between 64KB and 64MB
    /// - origin and backend must be absolute http(s) URLs; origin must carry no path
    /// - proxy_prefix must start and end with '/'
    /// - cache namespace and version must not be empty
    /// - every upstream template must contain `{id}`
    /// - max_concurrent_installs must be > 0
    pub fn validate(&self) -> Result<()> {
        const MIN_TILE_SIZE: u64 = 64 * 1024; // 64KB
        const MAX_TILE_SIZE: u64 = 64 * 1024 * 1024; // 64MB

        if self.tile_size < MIN_TILE_SIZE || self.tile_size > MAX_TILE_SIZE {
            return Err(ProxyError::ConfigError(format!(
                "tile_size must be between {}KB and {}MB, got {} bytes",
                MIN_TILE_SIZE / 1024,
                MAX_TILE_SIZE / (1024 * 1024),
                self.tile_size
            )));
        }

        let origin = self.origin_url()?;
        if origin.path() != "/" || origin.query().is_some() {
            return Err(ProxyError::ConfigError(format!(
                "origin must not contain a path or query, got {}",
                self.origin
            )));
        }
        self.backend_url()?;

        if self.proxy_prefix.len() < 2
            || !self.proxy_prefix.starts_with('/')
            || !self.proxy_prefix.ends_with('/')
        {
            return Err(ProxyError::ConfigError(format!(
                "proxy_prefix must start and end with '/', got {:?}",
                self.proxy_prefix
            )));
        }

        if self.cache_namespace.is_empty() || self.cache_version.is_empty() {
            return Err(ProxyError::ConfigError(
                "cache_namespace and cache_version must not be empty".to_string(),
            ));
        }

        if self.cache_buster_param.is_empty() {
            return Err(ProxyError::ConfigError(
                "cache_buster_param must not be empty".to_string(),
            ));
        }

        if !self.offline_shell.starts_with('/') {
            return Err(ProxyError::ConfigError(format!(
                "offline_shell must be an absolute path, got {:?}",
                self.offline_shell
            )));
        }

        if let Some(api) = &self.upstream.api {
            if !api.url_template.contains("{id}") {
                return Err(ProxyError::ConfigError(format!(
                    "upstream api url_template must contain {{id}}, got {}",
                    api.url_template
                )));
            }
        }
        for fallback in &self.upstream.fallbacks {
            if !fallback.url_template.contains("{id}") {
                return Err(ProxyError::ConfigError(format!(
                    "upstream fallback url_template must contain {{id}}, got {}",
                    fallback.url_template
                )));
            }
        }

        if self.max_concurrent_installs == 0 {
            return Err(ProxyError::ConfigError(
                "max_concurrent_installs must be greater than 0".to_string(),
            ));
        }

        if self.upstream_timeout_secs == 0 {
            return Err(ProxyError::ConfigError(
                "upstream_timeout_secs must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// The engine's own origin as a parsed URL
    pub fn origin_url(&self) -> Result<Url> {
        parse_http_url("origin", &self.origin)
    }

    /// The backend base as a parsed URL
    pub fn backend_url(&self) -> Result<Url> {
        parse_http_url("backend", &self.backend)
    }

    /// Name of the current cache generation, e.g. "tile-proxy-v1"
    pub fn cache_version_name(&self) -> String {
        format!("{}-{}", self.cache_namespace, self.cache_version)
    }
}

fn parse_http_url(field: &str, value: &str) -> Result<Url> {
    let url = Url::parse(value)
        .map_err(|e| ProxyError::ConfigError(format!("{} is not a valid URL ({}): {}", field, value, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(ProxyError::ConfigError(format!(
            "{} must use http or https, got scheme {}",
            field, other
        ))),
    }
}
