//! Proxy dispatcher: the single entry point for every intercepted request

use crate::asset_strategy::AssetStrategy;
use crate::cache_store::{InstallReport, VersionedCacheStore};
use crate::config::TileProxyConfig;
use crate::error::{ProxyError, Result};
use crate::key_normalizer::KeyNormalizer;
use crate::metrics::ProxyMetrics;
use crate::models::{ObjectId, RangeRequest};
use crate::navigation_strategy::NavigationStrategy;
use crate::network::OriginClient;
use crate::range_tiler::RangeTiler;
use crate::request::{InboundRequest, Preload};
use crate::request_analyzer::{RequestAnalyzer, Route};
use crate::response_assembler::{full_body, passthrough_response, ProxyBody, ResponseAssembler};
use crate::tile_fetcher::{TileFetch, TileFetcher, TileSource};
use crate::tile_store::TileStore;
use crate::upstream_resolver::{UpstreamCandidate, UpstreamResolver};
use http::header::RANGE;
use http::Response;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Routes each request to pass-through, tiling, navigation or asset handling
pub struct ProxyDispatcher {
    analyzer: RequestAnalyzer,
    normalizer: KeyNormalizer,
    client: OriginClient,
    cache: Arc<VersionedCacheStore>,
    resolver: UpstreamResolver,
    tiler: RangeTiler,
    fetcher: TileFetcher,
    assembler: ResponseAssembler,
    navigation: NavigationStrategy,
    assets: AssetStrategy,
    metrics: Arc<ProxyMetrics>,
}

impl ProxyDispatcher {
    /// Wire up an engine
    ///
    /// Without a tile store the large-object path relays ranges straight
    /// from upstream.
    pub fn new(
        config: &TileProxyConfig,
        cache: Arc<VersionedCacheStore>,
        tile_store: Option<Arc<dyn TileStore>>,
        metrics: Arc<ProxyMetrics>,
    ) -> Result<Self> {
        let client = OriginClient::from_config(config)?;
        let normalizer = KeyNormalizer::new(config.origin_url()?, &config.cache_buster_param);
        let resolver = UpstreamResolver::from_config(&config.upstream, client.client().clone())?;
        let fetcher = TileFetcher::new(
            client.client().clone(),
            tile_store,
            config.max_retries,
            metrics.clone(),
        );

        Ok(ProxyDispatcher {
            analyzer: RequestAnalyzer::new(config)?,
            navigation: NavigationStrategy::new(
                cache.clone(),
                client.clone(),
                normalizer.clone(),
                &config.offline_shell,
                metrics.clone(),
            ),
            assets: AssetStrategy::new(
                cache.clone(),
                client.clone(),
                normalizer.clone(),
                metrics.clone(),
            ),
            tiler: RangeTiler::new(config.tile_size),
            assembler: ResponseAssembler::new(&config.tile_content_type),
            normalizer,
            client,
            cache,
            resolver,
            fetcher,
            metrics,
        })
    }

    pub fn cache(&self) -> &Arc<VersionedCacheStore> {
        &self.cache
    }

    pub fn resolver(&self) -> &UpstreamResolver {
        &self.resolver
    }

    pub fn metrics(&self) -> &Arc<ProxyMetrics> {
        &self.metrics
    }

    pub fn classify(&self, request: &InboundRequest) -> Route {
        self.analyzer.classify(request)
    }

    /// Precache the given assets into the current cache generation
    pub async fn install(&self, assets: &[String], max_concurrent: usize) -> Result<InstallReport> {
        self.cache
            .install(assets, &self.normalizer, &self.client, max_concurrent)
            .await
    }

    /// Start the backend fetch for a navigation before it is routed
    ///
    /// Only active once the cache generation has enabled navigation preload.
    pub fn begin_navigation_preload(&self, request: &mut InboundRequest) {
        if !self.cache.navigation_preload_enabled() || request.has_preload() {
            return;
        }
        if self.analyzer.classify(request) != Route::Navigation {
            return;
        }

        let client = self.client.clone();
        let url = request.url.clone();
        let headers = request.headers.clone();
        request.set_preload(Preload::spawn(async move {
            client.fetch_get(&url, &headers).await
        }));
    }

    /// Handle one request
    pub async fn handle(&self, request: InboundRequest) -> Result<Response<ProxyBody>> {
        let started = Instant::now();
        let route = self.analyzer.classify(&request);
        let label = route.label();

        let result = match route {
            Route::Passthrough(reason) => {
                debug!("Passing through {} ({:?})", request.url, reason);
                self.passthrough(&request).await
            }
            Route::RangePassthrough => self.passthrough(&request).await,
            Route::LargeObject(object) => self.handle_large_object(&object, &request).await,
            Route::Navigation => self.navigation.handle(request).await,
            Route::Asset => self.assets.handle(request).await,
        };

        self.metrics.record_request(label, started.elapsed());
        result
    }

    async fn passthrough(&self, request: &InboundRequest) -> Result<Response<ProxyBody>> {
        let response = self.client.forward(request).await?;
        Ok(passthrough_response(response))
    }

    /// Serve a window of a large object from exactly one tile
    async fn handle_large_object(
        &self,
        object: &ObjectId,
        request: &InboundRequest,
    ) -> Result<Response<ProxyBody>> {
        let resolution = self.resolver.resolve(object).await?;
        self.metrics.record_size_probe(resolution.total_size.is_some());
        let candidate = &resolution.candidate;

        let Some(range_header) = request.range_header() else {
            info!("Streaming whole object {} from {}", object, candidate.url);
            let response = self.fetch_candidate(candidate, None).await?;
            return Ok(passthrough_response(response));
        };

        if !self.fetcher.has_store() {
            debug!("No tile store, relaying {} for {}", range_header, object);
            let response = self.fetch_candidate(candidate, Some(range_header)).await?;
            return Ok(passthrough_response(response));
        }

        let range = RangeRequest::from_header_or_default(range_header);
        let window = match self.tiler.window(range, resolution.total_size) {
            Ok(window) => window,
            Err(ProxyError::UnsatisfiableRange { total, .. }) => {
                return Ok(self.assembler.unsatisfiable(Some(total)).map(full_body));
            }
            Err(e) => return Err(e),
        };

        // A tile stored earlier through a readable candidate still serves
        // when resolution has fallen through to an opaque one
        let stored = if candidate.cors_capable {
            None
        } else {
            self.fetcher.stored_tile(object, &window.tile).await
        };
        let fetched = match stored {
            Some(data) => Ok(TileFetch::Readable {
                data,
                source: TileSource::Store,
            }),
            None => {
                self.fetcher
                    .get_or_fetch_tile(object, &window.tile, candidate)
                    .await
            }
        };
        let fetched = match fetched {
            Ok(fetched) => fetched,
            Err(ProxyError::UnsatisfiableRange { total, .. }) => {
                return Ok(self.assembler.unsatisfiable(Some(total)).map(full_body));
            }
            Err(e) => return Err(e),
        };

        match fetched {
            TileFetch::Opaque(response) => Ok(passthrough_response(response)),
            TileFetch::Readable { data, source } => {
                if data.is_empty() {
                    return Ok(self.assembler.unsatisfiable(window.total_size).map(full_body));
                }

                // The last tile of an object of unknown size may be short
                let payload_end = window.tile.range.start + data.len() as u64 - 1;
                let response_end = window.response_end.min(payload_end);
                if window.request_start > response_end {
                    return Ok(self
                        .assembler
                        .unsatisfiable(Some(payload_end + 1))
                        .map(full_body));
                }

                let response = self.assembler.slice_and_respond(
                    &data,
                    window.request_start,
                    window.tile.range.start,
                    response_end,
                    window.total_size,
                )?;
                self.metrics
                    .record_bytes_served(source.as_str(), response.body().len() as u64);
                Ok(response.map(full_body))
            }
        }
    }

    async fn fetch_candidate(
        &self,
        candidate: &UpstreamCandidate,
        range: Option<&str>,
    ) -> Result<reqwest::Response> {
        let mut builder = self
            .client
            .client()
            .get(candidate.url.clone())
            .headers(candidate.headers.clone());
        if let Some(range) = range {
            builder = builder.header(RANGE, range);
        }
        Ok(builder.send().await?)
    }
}
