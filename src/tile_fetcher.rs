//! Tile fetcher: one tile per call, from the tile store or upstream

use crate::error::{ProxyError, Result};
use crate::metrics::ProxyMetrics;
use crate::models::{ByteRange, ContentRange, ObjectId, TileSpec};
use crate::tile_store::TileStore;
use crate::upstream_resolver::UpstreamCandidate;
use bytes::Bytes;
use http::header::{CONTENT_RANGE, RANGE};
use http::StatusCode;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Where readable tile bytes came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileSource {
    Store,
    Upstream,
}

impl TileSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TileSource::Store => "store",
            TileSource::Upstream => "upstream",
        }
    }
}

/// Outcome of fetching one tile
#[derive(Debug)]
pub enum TileFetch {
    /// Tile bytes the engine may slice and store
    Readable { data: Bytes, source: TileSource },
    /// An upstream response that must be relayed unread
    Opaque(reqwest::Response),
}

/// Retry policy for failed tile fetches
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries
    pub max_retries: usize,
    /// Backoff durations in milliseconds for each retry attempt
    pub backoff_ms: Vec<u64>,
}

impl RetryPolicy {
    /// Create a new retry policy with exponential backoff
    pub fn new(max_retries: usize) -> Self {
        // 100ms, 200ms, 400ms, ...
        let backoff_ms = (0..max_retries)
            .map(|i| 100 * 2u64.pow(i as u32))
            .collect();

        RetryPolicy {
            max_retries,
            backoff_ms,
        }
    }

    pub fn should_retry(&self, attempt: usize, error: &ProxyError) -> bool {
        attempt < self.max_retries && error.should_retry()
    }

    pub fn backoff_duration(&self, attempt: usize) -> Duration {
        let ms = self
            .backoff_ms
            .get(attempt)
            .copied()
            .unwrap_or_else(|| *self.backoff_ms.last().unwrap_or(&1000));
        Duration::from_millis(ms)
    }
}

/// Fetches tiles, consulting and filling the tile store for readable upstreams
pub struct TileFetcher {
    client: Client,
    store: Option<Arc<dyn TileStore>>,
    retry_policy: RetryPolicy,
    metrics: Arc<ProxyMetrics>,
}

impl TileFetcher {
    pub fn new(
        client: Client,
        store: Option<Arc<dyn TileStore>>,
        max_retries: usize,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        TileFetcher {
            client,
            store,
            retry_policy: RetryPolicy::new(max_retries),
            metrics,
        }
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    /// Produce one tile of `object` through `candidate`
    ///
    /// Readable candidates check the store first and persist what they fetch;
    /// store failures never fail the request. Opaque candidates bypass the
    /// store and return the raw ranged response.
    pub async fn get_or_fetch_tile(
        &self,
        object: &ObjectId,
        tile: &TileSpec,
        candidate: &UpstreamCandidate,
    ) -> Result<TileFetch> {
        if !candidate.cors_capable {
            let response = self.send_range(candidate, &tile.range).await?;
            self.metrics.record_upstream_fetch(true);
            debug!(
                "Tile {} of {} relayed opaquely from {} (status {})",
                tile.index,
                object,
                candidate.url,
                response.status()
            );
            return Ok(TileFetch::Opaque(response));
        }

        if let Some(data) = self.stored_tile(object, tile).await {
            return Ok(TileFetch::Readable {
                data,
                source: TileSource::Store,
            });
        }

        let data = match self.fetch_with_retry(tile, candidate).await {
            Ok(data) => {
                self.metrics.record_upstream_fetch(true);
                data
            }
            Err(e) => {
                self.metrics.record_upstream_fetch(false);
                return Err(e);
            }
        };

        if let Some(store) = &self.store {
            if let Err(e) = store.put(object, tile.index, data.clone()).await {
                self.metrics.record_store_error("tile");
                warn!("Failed to persist tile {} of {}: {}", tile.index, object, e);
            }
        }

        Ok(TileFetch::Readable {
            data,
            source: TileSource::Upstream,
        })
    }

    /// Persisted bytes of one tile, if any
    ///
    /// Lookup failures count as misses. Stored tiles are object bytes no matter
    /// which candidate fetched them, so this is safe to consult before an
    /// opaque relay.
    pub async fn stored_tile(&self, object: &ObjectId, tile: &TileSpec) -> Option<Bytes> {
        let store = self.store.as_ref()?;
        match store.get(object, tile.index).await {
            Ok(Some(data)) => {
                self.metrics.record_tile_lookup(true);
                debug!("Tile {} of {} served from store", tile.index, object);
                Some(data)
            }
            Ok(None) => {
                self.metrics.record_tile_lookup(false);
                None
            }
            Err(e) => {
                self.metrics.record_tile_lookup(false);
                self.metrics.record_store_error("tile");
                warn!("Tile store lookup failed for {}#{}: {}", object, tile.index, e);
                None
            }
        }
    }

    async fn send_range(
        &self,
        candidate: &UpstreamCandidate,
        range: &ByteRange,
    ) -> Result<reqwest::Response> {
        let response = self
            .client
            .get(candidate.url.clone())
            .headers(candidate.headers.clone())
            .header(RANGE, range.to_header())
            .send()
            .await?;
        Ok(response)
    }

    /// Fetch a tile with retry logic
    async fn fetch_with_retry(
        &self,
        tile: &TileSpec,
        candidate: &UpstreamCandidate,
    ) -> Result<Bytes> {
        let mut attempt = 0;

        loop {
            match self.try_fetch_tile(tile, candidate).await {
                Ok(data) => return Ok(data),
                Err(e) => {
                    if !self.retry_policy.should_retry(attempt, &e) {
                        return Err(e);
                    }

                    let backoff = self.retry_policy.backoff_duration(attempt);
                    warn!(
                        "Fetch of tile {} from {} failed (attempt {}), retrying after {:?}: {}",
                        tile.index,
                        candidate.url,
                        attempt + 1,
                        backoff,
                        e
                    );
                    sleep(backoff).await;

                    attempt += 1;
                }
            }
        }
    }

    /// Try to fetch a single tile (single attempt, no retry)
    async fn try_fetch_tile(&self, tile: &TileSpec, candidate: &UpstreamCandidate) -> Result<Bytes> {
        let response = self.send_range(candidate, &tile.range).await?;
        let status = response.status();
        let content_range = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .map(ContentRange::parse)
            .transpose()?;

        match status {
            StatusCode::PARTIAL_CONTENT => {
                if let Some(range) = content_range.and_then(|cr| cr.range) {
                    if range.start != tile.range.start {
                        return Err(ProxyError::InvalidResponse(format!(
                            "Content-Range mismatch: expected start {}, got {}",
                            tile.range.start, range.start
                        )));
                    }
                }
                let data = response.bytes().await?;
                if data.is_empty() {
                    return Err(ProxyError::HttpError(format!(
                        "Empty 206 body for tile {}",
                        tile.index
                    )));
                }
                let limit = tile.range.size() as usize;
                Ok(if data.len() > limit {
                    data.slice(..limit)
                } else {
                    data
                })
            }
            StatusCode::OK => {
                // Upstream ignored the Range header and sent the whole object
                let data = response.bytes().await?;
                let len = data.len() as u64;
                if tile.range.start >= len {
                    return Err(ProxyError::UnsatisfiableRange {
                        start: tile.range.start,
                        total: len,
                    });
                }
                let end = tile.range.end.min(len - 1);
                debug!(
                    "Upstream ignored Range, cutting tile {} out of {} bytes",
                    tile.index, len
                );
                Ok(data.slice(tile.range.start as usize..=end as usize))
            }
            StatusCode::RANGE_NOT_SATISFIABLE => Err(ProxyError::UnsatisfiableRange {
                start: tile.range.start,
                total: content_range
                    .and_then(|cr| cr.total)
                    .unwrap_or(tile.range.start),
            }),
            other => Err(ProxyError::from_http_status(
                other.as_u16(),
                format!("Tile fetch from {} failed", candidate.url),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_new() {
        let policy = RetryPolicy::new(3);
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.backoff_ms, vec![100, 200, 400]);
    }

    #[test]
    fn test_retry_policy_should_retry() {
        let policy = RetryPolicy::new(2);
        let transient = ProxyError::NetworkError("reset".to_string());
        let permanent = ProxyError::origin_client_error(404, "missing");

        assert!(policy.should_retry(0, &transient));
        assert!(policy.should_retry(1, &transient));
        assert!(!policy.should_retry(2, &transient));
        assert!(!policy.should_retry(0, &permanent));
    }

    #[test]
    fn test_retry_policy_backoff_duration() {
        let policy = RetryPolicy::new(3);
        assert_eq!(policy.backoff_duration(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_duration(2), Duration::from_millis(400));
        assert_eq!(policy.backoff_duration(10), Duration::from_millis(400));
        assert_eq!(RetryPolicy::new(0).backoff_duration(0), Duration::from_millis(1000));
    }

    #[test]
    fn test_tile_source_labels() {
        assert_eq!(TileSource::Store.as_str(), "store");
        assert_eq!(TileSource::Upstream.as_str(), "upstream");
    }
}
