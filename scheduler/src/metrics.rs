//! Prometheus metrics for the scheduler.
//!
//! Exported at `/metrics`.
//!
//! - **Replication**: dispatches by role and outcome, cache results by status,
//!   archives still being replicated
//! - **Validation**: rounds started, results by status, reported bandwidth

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::sync::{Arc, Mutex};
use tracing::error;

#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<Mutex<Registry>>,

    // Replication
    pub dispatches: Family<[(String, String); 2], Counter>, // Labels: role, outcome (ok/failed)
    pub cache_results: Family<[(String, String); 1], Counter>, // Label: status
    pub active_archives: Gauge,

    // Validation
    pub rounds_started: Counter,
    pub validation_results: Family<[(String, String); 1], Counter>, // Label: status
    /// Bandwidth of concluded challenges in bytes per second
    pub validation_bandwidth: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let dispatches = Family::<[(String, String); 2], Counter>::default();
        registry.register(
            "cache_dispatches_total",
            "Cache tasks dispatched to nodes",
            dispatches.clone(),
        );

        let cache_results = Family::<[(String, String); 1], Counter>::default();
        registry.register(
            "cache_results_total",
            "Terminal cache task reports",
            cache_results.clone(),
        );

        let active_archives = Gauge::default();
        registry.register(
            "active_archives",
            "Archives whose replication has not finished",
            active_archives.clone(),
        );

        let rounds_started = Counter::default();
        registry.register(
            "validation_rounds_total",
            "Validation rounds started",
            rounds_started.clone(),
        );

        let validation_results = Family::<[(String, String); 1], Counter>::default();
        registry.register(
            "validation_results_total",
            "Concluded validation results",
            validation_results.clone(),
        );

        // 1 KiB/s .. ~1 GiB/s
        let validation_bandwidth = Histogram::new(exponential_buckets(1024.0, 4.0, 11));
        registry.register(
            "validation_bandwidth_bytes_per_second",
            "Bandwidth measured by validators",
            validation_bandwidth.clone(),
        );

        Self {
            registry: Arc::new(Mutex::new(registry)),
            dispatches,
            cache_results,
            active_archives,
            rounds_started,
            validation_results,
            validation_bandwidth,
        }
    }

    pub fn record_dispatch(&self, role: &str, ok: bool) {
        self.dispatches
            .get_or_create(&[
                ("role".to_string(), role.to_string()),
                ("outcome".to_string(), if ok { "ok" } else { "failed" }.to_string()),
            ])
            .inc();
    }

    pub fn record_cache_result(&self, status: &str) {
        self.cache_results
            .get_or_create(&[("status".to_string(), status.to_string())])
            .inc();
    }

    pub fn record_validation(&self, status: &str) {
        self.validation_results
            .get_or_create(&[("status".to_string(), status.to_string())])
            .inc();
    }

    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        let registry = match self.registry.lock() {
            Ok(r) => r,
            Err(e) => {
                error!(error = %e, "Failed to acquire metrics registry lock");
                return buffer;
            }
        };
        if let Err(e) = encode(&mut buffer, &registry) {
            error!(error = %e, "Failed to encode metrics");
            return String::new();
        }
        buffer
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
