//! Prometheus metrics collection.
//!
//! Tracks cache performance and upstream request behavior.

use prometheus::{Counter, Histogram, HistogramOpts, IntCounter, Opts, Registry};
use std::sync::Arc;

use crate::error::AppError;

#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<Registry>,

    // Cache metrics
    pub cache_hits: IntCounter,
    pub cache_misses: IntCounter,
    pub cache_stores: IntCounter,

    // Inbound request metrics
    pub requests_total: Counter,
    pub request_duration: Histogram,

    // Outbound upstream metrics
    pub upstream_requests: IntCounter,
    pub upstream_failures: IntCounter,
    pub upstream_latency: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Self, AppError> {
        let registry = Registry::new();

        let cache_hits = IntCounter::with_opts(Opts::new(
            "omniapi_cache_hits_total",
            "Total number of endpoint cache hits",
        ))
        .map_err(|e| AppError::Uncaught(anyhow::anyhow!("Failed to create metric: {}", e)))?;

        let cache_misses = IntCounter::with_opts(Opts::new(
            "omniapi_cache_misses_total",
            "Total number of endpoint cache misses",
        ))
        .map_err(|e| AppError::Uncaught(anyhow::anyhow!("Failed to create metric: {}", e)))?;

        let cache_stores = IntCounter::with_opts(Opts::new(
            "omniapi_cache_stores_total",
            "Total number of endpoint cache stores",
        ))
        .map_err(|e| AppError::Uncaught(anyhow::anyhow!("Failed to create metric: {}", e)))?;

        let requests_total = Counter::with_opts(Opts::new(
            "omniapi_requests_total",
            "Total number of inbound HTTP requests",
        ))
        .map_err(|e| AppError::Uncaught(anyhow::anyhow!("Failed to create metric: {}", e)))?;

        let request_duration = Histogram::with_opts(
            HistogramOpts::new(
                "omniapi_request_duration_seconds",
                "Inbound HTTP request duration in seconds",
            )
            .buckets(vec![
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5,
            ]),
        )
        .map_err(|e| AppError::Uncaught(anyhow::anyhow!("Failed to create metric: {}", e)))?;

        let upstream_requests = IntCounter::with_opts(Opts::new(
            "omniapi_upstream_requests_total",
            "Total number of outbound upstream requests attempted",
        ))
        .map_err(|e| AppError::Uncaught(anyhow::anyhow!("Failed to create metric: {}", e)))?;

        let upstream_failures = IntCounter::with_opts(Opts::new(
            "omniapi_upstream_failures_total",
            "Total number of outbound upstream requests that resulted in an error",
        ))
        .map_err(|e| AppError::Uncaught(anyhow::anyhow!("Failed to create metric: {}", e)))?;

        let upstream_latency = Histogram::with_opts(
            HistogramOpts::new(
                "omniapi_upstream_latency_seconds",
                "Duration of outbound upstream requests in seconds",
            )
            .buckets(vec![
                0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.0, 5.0,
            ]),
        )
        .map_err(|e| AppError::Uncaught(anyhow::anyhow!("Failed to create metric: {}", e)))?;

        registry
            .register(Box::new(cache_hits.clone()))
            .map_err(|e| AppError::Uncaught(anyhow::anyhow!("Failed to register metric: {}", e)))?;
        registry
            .register(Box::new(cache_misses.clone()))
            .map_err(|e| AppError::Uncaught(anyhow::anyhow!("Failed to register metric: {}", e)))?;
        registry
            .register(Box::new(cache_stores.clone()))
            .map_err(|e| AppError::Uncaught(anyhow::anyhow!("Failed to register metric: {}", e)))?;
        registry
            .register(Box::new(requests_total.clone()))
            .map_err(|e| AppError::Uncaught(anyhow::anyhow!("Failed to register metric: {}", e)))?;
        registry
            .register(Box::new(request_duration.clone()))
            .map_err(|e| AppError::Uncaught(anyhow::anyhow!("Failed to register metric: {}", e)))?;
        registry
            .register(Box::new(upstream_requests.clone()))
            .map_err(|e| AppError::Uncaught(anyhow::anyhow!("Failed to register metric: {}", e)))?;
        registry
            .register(Box::new(upstream_failures.clone()))
            .map_err(|e| AppError::Uncaught(anyhow::anyhow!("Failed to register metric: {}", e)))?;
        registry
            .register(Box::new(upstream_latency.clone()))
            .map_err(|e| AppError::Uncaught(anyhow::anyhow!("Failed to register metric: {}", e)))?;

        Ok(Self {
            registry: Arc::new(registry),
            cache_hits,
            cache_misses,
            cache_stores,
            requests_total,
            request_duration,
            upstream_requests,
            upstream_failures,
            upstream_latency,
        })
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.inc();
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.inc();
    }

    pub fn record_cache_store(&self) {
        self.cache_stores.inc();
    }

    pub fn record_request(&self, duration_seconds: f64) {
        self.requests_total.inc();
        self.request_duration.observe(duration_seconds);
    }

    pub fn record_upstream_request(&self) {
        self.upstream_requests.inc();
    }

    pub fn record_upstream_failure(&self) {
        self.upstream_failures.inc();
    }

    pub fn record_upstream_latency(&self, seconds: f64) {
        self.upstream_latency.observe(seconds);
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> Result<String, AppError> {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| AppError::Uncaught(anyhow::anyhow!("Failed to encode metrics: {}", e)))?;

        String::from_utf8(buffer).map_err(|e| {
            AppError::Uncaught(anyhow::anyhow!("Failed to convert metrics to string: {}", e))
        })
    }
}
