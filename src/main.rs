//! Tile proxy server
//!
//! Loads configuration, installs and activates the cache generation, and
//! serves proxied traffic plus the optional admin endpoint.

use anyhow::Context;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tile_proxy::{
    AdminEndpoint, CacheStorage, DiskCacheStorage, DiskTileStore, MemoryCacheStorage,
    MemoryTileStore, ProxyDispatcher, ProxyMetrics, ProxyServer, TileProxyConfig, TileStore,
    VersionedCacheStore,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// # Usage
/// ```bash
/// # Start with default config (tile_proxy.yaml)
/// cargo run
///
/// # Start with custom config
/// cargo run -- /path/to/config.yaml
/// ```
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting tile proxy");

    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "tile_proxy.yaml".to_string());
    info!("Loading configuration from: {}", config_path);

    let config = TileProxyConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;
    info!("Configuration loaded successfully");
    info!("  - Origin: {} (backend {})", config.origin, config.backend);
    info!("  - Cache generation: {}", config.cache_version_name());
    info!("  - Tile size: {} bytes ({} KB)", config.tile_size, config.tile_size / 1024);
    info!("  - Tile store enabled: {}", config.tile_store.enabled);
    info!("  - Precache assets: {}", config.precache_assets.len());

    let metrics = Arc::new(ProxyMetrics::new().context("Failed to create metrics")?);

    let storage: Arc<dyn CacheStorage> = match &config.cache_dir {
        Some(dir) => Arc::new(DiskCacheStorage::new(dir).await?),
        None => Arc::new(MemoryCacheStorage::new()),
    };
    let cache = Arc::new(VersionedCacheStore::new(storage, config.cache_version_name()));

    let tile_store: Option<Arc<dyn TileStore>> = if config.tile_store.enabled {
        Some(match &config.tile_store.dir {
            Some(dir) => Arc::new(DiskTileStore::new(dir).await?),
            None => Arc::new(MemoryTileStore::new()),
        })
    } else {
        None
    };

    let dispatcher = Arc::new(ProxyDispatcher::new(
        &config,
        cache.clone(),
        tile_store.clone(),
        metrics,
    )?);

    // Install in the background; requests are served meanwhile
    {
        let dispatcher = dispatcher.clone();
        let assets = config.precache_assets.clone();
        let max_concurrent = config.max_concurrent_installs;
        let activate_immediately = config.activate_immediately;
        tokio::spawn(async move {
            if activate_immediately {
                if let Err(e) = dispatcher.cache().skip_waiting().await {
                    warn!("Skip-waiting failed: {}", e);
                }
            }
            match dispatcher.install(&assets, max_concurrent).await {
                Ok(report) => {
                    info!(
                        "Install finished: {} cached, {} failed",
                        report.cached.len(),
                        report.failed.len()
                    );
                    if let Some(activation) = report.activation {
                        info!(
                            "Activated {}, deleted {:?}",
                            activation.current, activation.deleted
                        );
                    }
                }
                Err(e) => error!("Install failed: {}", e),
            }
        });
    }

    if let Some(admin) = config.admin_endpoint.as_ref().filter(|a| a.enabled) {
        let addr: SocketAddr = admin
            .address
            .parse()
            .with_context(|| format!("Invalid admin address {}", admin.address))?;
        let endpoint = AdminEndpoint::new(dispatcher.clone(), tile_store.clone(), addr);
        tokio::spawn(async move {
            if let Err(e) = endpoint.start().await {
                error!("Admin endpoint stopped: {}", e);
            }
        });
    }

    let addr: SocketAddr = config
        .listen_address
        .parse()
        .with_context(|| format!("Invalid listen address {}", config.listen_address))?;
    // Origin-form requests without X-Forwarded-Proto carry the origin's scheme
    let origin = config.origin_url()?;
    let server = ProxyServer::new(dispatcher).with_default_scheme(origin.scheme());

    tokio::select! {
        result = server.start(addr) => {
            result.context("Proxy server stopped")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    Ok(())
}
