//! Stale-while-revalidate handling of same-origin assets

use crate::cache_store::VersionedCacheStore;
use crate::detached::spawn_detached;
use crate::error::{ProxyError, Result};
use crate::key_normalizer::KeyNormalizer;
use crate::metrics::ProxyMetrics;
use crate::models::CachedResponse;
use crate::network::{materialize, OriginClient};
use crate::request::InboundRequest;
use crate::response_assembler::{cached_response, passthrough_response, ProxyBody};
use http::Response;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct AssetStrategy {
    cache: Arc<VersionedCacheStore>,
    client: OriginClient,
    normalizer: KeyNormalizer,
    metrics: Arc<ProxyMetrics>,
}

impl AssetStrategy {
    pub fn new(
        cache: Arc<VersionedCacheStore>,
        client: OriginClient,
        normalizer: KeyNormalizer,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        AssetStrategy {
            cache,
            client,
            normalizer,
            metrics,
        }
    }

    /// Serve the cached copy at once and refresh it in the background
    ///
    /// The refresh always runs. Without a cached copy the caller waits for
    /// it; a network failure then surfaces as an error.
    pub async fn handle(&self, request: InboundRequest) -> Result<Response<ProxyBody>> {
        let Some(key) = self.normalizer.normalize(&request.url) else {
            let response = self.client.forward(&request).await?;
            return Ok(passthrough_response(response));
        };

        let cached = match self.cache.match_key(&key).await {
            Ok(entry) => entry,
            Err(e) => {
                self.metrics.record_store_error("cache");
                warn!("Cache lookup for {} failed: {}", key, e);
                None
            }
        };

        let cache = self.cache.clone();
        let client = self.client.clone();
        let metrics = self.metrics.clone();
        let revalidate_key = key.clone();
        let url = request.url.clone();
        let headers = request.headers.clone();
        let revalidation = tokio::spawn(async move {
            let response = client.fetch_get(&url, &headers).await?;
            let entry = materialize(response).await?;
            if entry.is_cacheable() {
                let write_entry = entry.clone();
                spawn_detached("asset-cache-write", async move {
                    let result = cache.put(&revalidate_key, write_entry).await;
                    if result.is_err() {
                        metrics.record_store_error("cache");
                    }
                    result
                });
            }
            Ok::<CachedResponse, ProxyError>(entry)
        });

        if let Some(entry) = cached {
            debug!("Serving {} from cache, revalidating in background", key);
            tokio::spawn(async move {
                match revalidation.await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!("Background revalidation failed: {}", e),
                    Err(e) => warn!("Background revalidation task failed: {}", e),
                }
            });
            return Ok(cached_response(&entry));
        }

        match revalidation.await {
            Ok(Ok(entry)) => Ok(cached_response(&entry)),
            Ok(Err(e)) => {
                warn!("Fetch of uncached asset {} failed: {}", key, e);
                Err(e)
            }
            Err(e) => Err(ProxyError::InternalError(format!(
                "Revalidation task failed: {}",
                e
            ))),
        }
    }
}
