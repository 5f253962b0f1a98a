//! Metrics collection for the raftex service
//!
//! This module provides functionality for collecting and exposing service
//! metrics using Prometheus.

use lazy_static::lazy_static;
use prometheus::{CounterVec, Gauge, HistogramOpts, HistogramVec, Opts, Registry};
use std::time::Instant;

lazy_static! {
    /// Global Prometheus registry instance
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Counter for tracking request counts by method
    pub static ref REQ_COUNTER_VEC: CounterVec =
        CounterVec::new(Opts::new("raftex_request_counter", "request counter"), &["method"])
            .unwrap();

    /// Histogram for tracking method execution times
    pub static ref METHOD_HISTOGRAM_VEC: HistogramVec = HistogramVec::new(
        HistogramOpts::new("raftex_method_cost", "method cost"),
        &["method"]
    )
    .unwrap();

    /// Number of partitions currently registered on this host
    pub static ref PARTS_GAUGE: Gauge =
        Gauge::new("raftex_parts", "registered partitions").unwrap();

    /// Partitions that hit a persistence failure and stopped acknowledging
    pub static ref UNHEALTHY_PARTS_GAUGE: Gauge =
        Gauge::new("raftex_unhealthy_parts", "partitions with failed wal").unwrap();
}

/// Registers all metric collectors with the global registry
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(REQ_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(METHOD_HISTOGRAM_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(PARTS_GAUGE.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(UNHEALTHY_PARTS_GAUGE.clone()));
}

/// Records counter and latency metrics around an RPC handler.
pub async fn record_metrics<F, Fut, T>(
    method_name: &'static str,
    handler: F,
) -> Result<T, tonic::Status>
where
    F: FnOnce() -> Fut + Send,
    Fut: std::future::Future<Output = Result<T, tonic::Status>> + Send,
{
    let start = Instant::now();
    REQ_COUNTER_VEC.with_label_values(&[method_name]).inc();
    let result = handler().await;

    let elapsed = start.elapsed();
    METHOD_HISTOGRAM_VEC
        .with_label_values(&[method_name])
        .observe(elapsed.as_secs_f64());

    result
}
