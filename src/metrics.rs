//! Prometheus metrics for the tile proxy
//!
//! Every collector lives in a private registry so that several engines can
//! coexist in one process (tests build many).

use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;

/// Metrics collected by the engine
#[derive(Clone)]
pub struct ProxyMetrics {
    registry: Registry,

    /// Requests by route: passthrough, range_passthrough, large_object, navigation, asset
    requests_total: IntCounterVec,

    /// Request handling time by route
    request_duration_seconds: HistogramVec,

    /// Tile store lookups by result (hit/miss)
    tile_lookups_total: IntCounterVec,

    /// Upstream tile fetches by result (success/failure)
    upstream_fetches_total: IntCounterVec,

    /// Swallowed store failures by store (tile/cache)
    store_errors_total: IntCounterVec,

    /// Body bytes served from tiles by source (store/upstream)
    bytes_served_total: IntCounterVec,

    /// Offline fallbacks by kind (cached/shell)
    offline_fallbacks_total: IntCounterVec,

    /// Size probes by result (known/unknown)
    size_probes_total: IntCounterVec,
}

impl ProxyMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("tile_proxy_requests_total", "Total number of handled requests"),
            &["route"],
        )?;
        registry.register(Box::new(requests_total.clone()))?;

        let request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "tile_proxy_request_duration_seconds",
                "Time to produce response headers, in seconds",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
            &["route"],
        )?;
        registry.register(Box::new(request_duration_seconds.clone()))?;

        let tile_lookups_total = IntCounterVec::new(
            Opts::new("tile_proxy_tile_lookups_total", "Tile store lookups"),
            &["result"],
        )?;
        registry.register(Box::new(tile_lookups_total.clone()))?;

        let upstream_fetches_total = IntCounterVec::new(
            Opts::new("tile_proxy_upstream_fetches_total", "Upstream tile fetches"),
            &["result"],
        )?;
        registry.register(Box::new(upstream_fetches_total.clone()))?;

        let store_errors_total = IntCounterVec::new(
            Opts::new(
                "tile_proxy_store_errors_total",
                "Store failures that were swallowed",
            ),
            &["store"],
        )?;
        registry.register(Box::new(store_errors_total.clone()))?;

        let bytes_served_total = IntCounterVec::new(
            Opts::new("tile_proxy_bytes_served_total", "Tile bytes sent to clients"),
            &["source"],
        )?;
        registry.register(Box::new(bytes_served_total.clone()))?;

        let offline_fallbacks_total = IntCounterVec::new(
            Opts::new(
                "tile_proxy_offline_fallbacks_total",
                "Responses served from cache because the network failed",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(offline_fallbacks_total.clone()))?;

        let size_probes_total = IntCounterVec::new(
            Opts::new("tile_proxy_size_probes_total", "Object size resolutions"),
            &["result"],
        )?;
        registry.register(Box::new(size_probes_total.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration_seconds,
            tile_lookups_total,
            upstream_fetches_total,
            store_errors_total,
            bytes_served_total,
            offline_fallbacks_total,
            size_probes_total,
        })
    }

    pub fn record_request(&self, route: &str, duration: Duration) {
        self.requests_total.with_label_values(&[route]).inc();
        self.request_duration_seconds
            .with_label_values(&[route])
            .observe(duration.as_secs_f64());
    }

    pub fn record_tile_lookup(&self, hit: bool) {
        let result = if hit { "hit" } else { "miss" };
        self.tile_lookups_total.with_label_values(&[result]).inc();
    }

    pub fn record_upstream_fetch(&self, success: bool) {
        let result = if success { "success" } else { "failure" };
        self.upstream_fetches_total.with_label_values(&[result]).inc();
    }

    pub fn record_store_error(&self, store: &str) {
        self.store_errors_total.with_label_values(&[store]).inc();
    }

    pub fn record_bytes_served(&self, source: &str, bytes: u64) {
        self.bytes_served_total
            .with_label_values(&[source])
            .inc_by(bytes);
    }

    pub fn record_offline_fallback(&self, kind: &str) {
        self.offline_fallbacks_total.with_label_values(&[kind]).inc();
    }

    pub fn record_size_probe(&self, known: bool) {
        let result = if known { "known" } else { "unknown" };
        self.size_probes_total.with_label_values(&[result]).inc();
    }

    pub fn requests(&self, route: &str) -> u64 {
        self.requests_total.with_label_values(&[route]).get()
    }

    pub fn tile_hits(&self) -> u64 {
        self.tile_lookups_total.with_label_values(&["hit"]).get()
    }

    pub fn tile_misses(&self) -> u64 {
        self.tile_lookups_total.with_label_values(&["miss"]).get()
    }

    pub fn upstream_fetches(&self, success: bool) -> u64 {
        let result = if success { "success" } else { "failure" };
        self.upstream_fetches_total.with_label_values(&[result]).get()
    }

    pub fn store_errors(&self, store: &str) -> u64 {
        self.store_errors_total.with_label_values(&[store]).get()
    }

    pub fn bytes_served(&self, source: &str) -> u64 {
        self.bytes_served_total.with_label_values(&[source]).get()
    }

    pub fn offline_fallbacks(&self, kind: &str) -> u64 {
        self.offline_fallbacks_total.with_label_values(&[kind]).get()
    }

    /// Render every collector in the Prometheus text format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| prometheus::Error::Msg(format!("Metrics are not UTF-8: {}", e)))
    }
}
