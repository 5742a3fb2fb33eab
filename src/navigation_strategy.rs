//! Network-first handling of document navigations
//!
//! The fresh response is returned as soon as it is read; storing it happens
//! in the background. When the network fails the cached copy is served, then
//! the offline shell.

use crate::cache_store::VersionedCacheStore;
use crate::detached::spawn_detached;
use crate::error::{ProxyError, Result};
use crate::key_normalizer::{CacheKey, KeyNormalizer};
use crate::metrics::ProxyMetrics;
use crate::models::CachedResponse;
use crate::network::{materialize, OriginClient};
use crate::request::InboundRequest;
use crate::response_assembler::{cached_response, passthrough_response, ProxyBody};
use http::Response;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct NavigationStrategy {
    cache: Arc<VersionedCacheStore>,
    client: OriginClient,
    normalizer: KeyNormalizer,
    offline_shell: Option<CacheKey>,
    metrics: Arc<ProxyMetrics>,
}

impl NavigationStrategy {
    pub fn new(
        cache: Arc<VersionedCacheStore>,
        client: OriginClient,
        normalizer: KeyNormalizer,
        offline_shell: &str,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        let offline_shell = normalizer.normalize_path(offline_shell);
        NavigationStrategy {
            cache,
            client,
            normalizer,
            offline_shell,
            metrics,
        }
    }

    pub async fn handle(&self, mut request: InboundRequest) -> Result<Response<ProxyBody>> {
        let Some(key) = self.normalizer.normalize(&request.url) else {
            let response = self.client.forward(&request).await?;
            return Ok(passthrough_response(response));
        };

        let network = match request.take_preload() {
            Some(preload) => {
                debug!("Using navigation preload for {}", key);
                preload.await
            }
            None => self.client.fetch_get(&request.url, &request.headers).await,
        };

        let fresh = match network {
            Ok(response) if response.status().is_success() => materialize(response).await,
            Ok(response) => {
                // Relayed as-is and never cached
                debug!("Navigation {} returned {}", key, response.status());
                return Ok(passthrough_response(response));
            }
            Err(e) => Err(e),
        };

        match fresh {
            Ok(entry) => {
                if entry.is_cacheable() {
                    let cache = self.cache.clone();
                    let metrics = self.metrics.clone();
                    let write_key = key.clone();
                    let write_entry = entry.clone();
                    spawn_detached("navigation-cache-write", async move {
                        let result = cache.put(&write_key, write_entry).await;
                        if result.is_err() {
                            metrics.record_store_error("cache");
                        }
                        result
                    });
                }
                Ok(cached_response(&entry))
            }
            Err(e) => {
                warn!("Navigation to {} failed, trying cache: {}", key, e);
                self.offline_fallback(&key).await
            }
        }
    }

    async fn offline_fallback(&self, key: &CacheKey) -> Result<Response<ProxyBody>> {
        if let Some(entry) = self.lookup(key).await {
            info!("Serving cached copy of {} while offline", key);
            self.metrics.record_offline_fallback("cached");
            return Ok(cached_response(&entry));
        }

        if let Some(shell) = &self.offline_shell {
            if let Some(entry) = self.lookup(shell).await {
                info!("Serving offline shell for {}", key);
                self.metrics.record_offline_fallback("shell");
                return Ok(cached_response(&entry));
            }
        }

        Err(ProxyError::Offline(key.url().to_string()))
    }

    async fn lookup(&self, key: &CacheKey) -> Option<CachedResponse> {
        match self.cache.match_key(key).await {
            Ok(entry) => entry,
            Err(e) => {
                self.metrics.record_store_error("cache");
                warn!("Cache lookup for {} failed: {}", key, e);
                None
            }
        }
    }
}
