//! Tile Proxy
//!
//! An intercepting HTTP proxy that serves large objects as fixed-size
//! tiles and keeps a versioned cache of the application's own pages and
//! assets.
//!
//! # Overview
//!
//! Every request entering the proxy is classified by the
//! [`RequestAnalyzer`] and handed to one of four paths:
//!
//! - **Pass-through**: excluded schemes, non-GET, cross-origin and insecure
//!   requests are relayed untouched, as are same-origin requests that carry
//!   their own `Range` header.
//! - **Large objects**: `GET <prefix><id>` is resolved against the configured
//!   upstream candidates, the requested range is mapped onto exactly one
//!   aligned tile, and that tile is served from the [`TileStore`] or fetched
//!   and persisted.
//! - **Navigations**: network first, with the cached copy and then an offline
//!   shell as fallbacks.
//! - **Assets**: stale-while-revalidate from the current cache generation.
//!
//! # Architecture
//!
//! - [`ProxyDispatcher`]: routes each request and records metrics
//! - [`KeyNormalizer`]: canonical cache keys for same-origin URLs
//! - [`VersionedCacheStore`]: named cache generations and their lifecycle
//! - [`UpstreamResolver`]: picks an upstream for an object and probes its size
//! - [`RangeTiler`]: maps a client range onto one tile
//! - [`TileFetcher`]: store-then-network tile retrieval with retries
//! - [`ResponseAssembler`]: builds the `206` for the requested window
//! - [`ProxyServer`] and [`AdminEndpoint`]: the HTTP surfaces
//!
//! # Configuration
//!
//! ```yaml
//! origin: "https://app.example.com"
//! backend: "http://127.0.0.1:3000"
//! cache_version: "v3"
//! tile_size: 4194304
//! tile_store:
//!   enabled: true
//!   dir: "/var/cache/tile-proxy/tiles"
//! upstream:
//!   api:
//!     url_template: "https://api.example.com/files/{id}?key={key}"
//!     access_key: "secret"
//!   fallbacks:
//!     - url_template: "https://mirror.example.com/{id}"
//! ```
//!
//! See [`TileProxyConfig`] for every option.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tile_proxy::{
//!     MemoryCacheStorage, ProxyDispatcher, ProxyMetrics, TileProxyConfig, VersionedCacheStore,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = TileProxyConfig::from_file("tile_proxy.yaml")?;
//! let cache = Arc::new(VersionedCacheStore::new(
//!     Arc::new(MemoryCacheStorage::new()),
//!     config.cache_version_name(),
//! ));
//! let metrics = Arc::new(ProxyMetrics::new()?);
//! let dispatcher = ProxyDispatcher::new(&config, cache, None, metrics)?;
//! # let _ = dispatcher;
//! # Ok(())
//! # }
//! ```

pub mod admin_endpoint;
pub mod asset_strategy;
pub mod cache_store;
pub mod config;
pub mod detached;
pub mod disk_format;
pub mod dispatcher;
pub mod error;
pub mod key_normalizer;
pub mod metrics;
pub mod models;
pub mod navigation_strategy;
pub mod network;
pub mod range_tiler;
pub mod request;
pub mod request_analyzer;
pub mod response_assembler;
pub mod server;
pub mod tile_fetcher;
pub mod tile_store;
pub mod upstream_resolver;

// Re-export commonly used types
pub use admin_endpoint::AdminEndpoint;
pub use asset_strategy::AssetStrategy;
pub use cache_store::{
    ActivationReport, CacheStorage, DiskCacheStorage, InstallReport, LifecycleState,
    MemoryCacheStorage, VersionedCacheStore,
};
pub use config::TileProxyConfig;
pub use dispatcher::ProxyDispatcher;
pub use error::{ProxyError, Result};
pub use key_normalizer::{CacheKey, KeyNormalizer};
pub use metrics::ProxyMetrics;
pub use models::{ByteRange, CachedResponse, ContentRange, ObjectId, RangeRequest, TileSpec, TotalSize};
pub use navigation_strategy::NavigationStrategy;
pub use network::OriginClient;
pub use range_tiler::{RangeTiler, TileWindow};
pub use request::{InboundRequest, Preload};
pub use request_analyzer::{PassReason, RequestAnalyzer, Route};
pub use response_assembler::{ProxyBody, ResponseAssembler};
pub use server::ProxyServer;
pub use tile_fetcher::{RetryPolicy, TileFetch, TileFetcher, TileSource};
pub use tile_store::{DiskTileStore, MemoryTileStore, TileStore};
pub use upstream_resolver::{
    ApiEndpoint, OpaqueEndpoint, Resolution, UpstreamCandidate, UpstreamEndpoint, UpstreamResolver,
};
