//! Prometheus metrics exported at the `/metrics` endpoint.
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `gateway_http_requests_total` | Counter | Proxied requests by user/status |
//! | `gateway_bad_requests_total` | Counter | Requests rejected by the dispatcher |
//! | `gateway_request_duration_seconds` | Histogram | Time to first upstream byte |
//! | `gateway_cache_hits_total` | Counter | Cache hits by cache name |
//! | `gateway_cache_misses_total` | Counter | Cache misses by cache name |
//! | `gateway_cache_size_bytes` | Gauge | On-disk cache size, refreshed on scrape |
//! | `gateway_cache_items` | Gauge | Committed cache entries, refreshed on scrape |
//! | `gateway_host_alive` | Gauge | Node availability by cluster/host |
//! | `gateway_killed_queries_total` | Counter | KILL QUERY requests issued |
//! | `gateway_config_last_reload_successful` | Gauge | 1 when the last reload applied |
//! | `gateway_config_last_reload_success_timestamp_seconds` | Gauge | Unix time of last good reload |

use std::sync::Arc;

use parking_lot::RwLock;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;

#[derive(Clone)]
pub struct Metrics {
    pub registry: Arc<RwLock<Registry>>,
    pub http_requests: Family<[(String, String); 2], Counter>, // user, code
    pub bad_requests: Counter,
    pub request_duration: Family<[(String, String); 1], Histogram>, // user
    pub cache_hits: Family<[(String, String); 1], Counter>,         // cache
    pub cache_misses: Family<[(String, String); 1], Counter>,       // cache
    pub cache_size_bytes: Family<[(String, String); 1], Gauge>,     // cache
    pub cache_items: Family<[(String, String); 1], Gauge>,          // cache
    pub host_alive: Family<[(String, String); 2], Gauge>,           // cluster, host
    pub killed_queries: Counter,
    pub config_success: Gauge,
    pub config_success_time: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let http_requests = Family::<[(String, String); 2], Counter>::default();
        registry.register(
            "gateway_http_requests_total",
            "Total proxied HTTP requests",
            http_requests.clone(),
        );

        let bad_requests = Counter::default();
        registry.register(
            "gateway_bad_requests_total",
            "Total requests rejected before proxying",
            bad_requests.clone(),
        );

        let request_duration =
            Family::<[(String, String); 1], Histogram>::new_with_constructor(|| {
                Histogram::new(exponential_buckets(0.01, 2.0, 12))
            });
        registry.register(
            "gateway_request_duration_seconds",
            "Time until the upstream response headers arrive",
            request_duration.clone(),
        );

        let cache_hits = Family::<[(String, String); 1], Counter>::default();
        registry.register(
            "gateway_cache_hits_total",
            "Total cache hits",
            cache_hits.clone(),
        );

        let cache_misses = Family::<[(String, String); 1], Counter>::default();
        registry.register(
            "gateway_cache_misses_total",
            "Total cache misses",
            cache_misses.clone(),
        );

        let cache_size_bytes = Family::<[(String, String); 1], Gauge>::default();
        registry.register(
            "gateway_cache_size_bytes",
            "Current on-disk cache size",
            cache_size_bytes.clone(),
        );

        let cache_items = Family::<[(String, String); 1], Gauge>::default();
        registry.register(
            "gateway_cache_items",
            "Current number of committed cache entries",
            cache_items.clone(),
        );

        let host_alive = Family::<[(String, String); 2], Gauge>::default();
        registry.register(
            "gateway_host_alive",
            "Whether a cluster node passed its last heartbeat",
            host_alive.clone(),
        );

        let killed_queries = Counter::default();
        registry.register(
            "gateway_killed_queries_total",
            "Total KILL QUERY requests issued for cancelled or timed-out queries",
            killed_queries.clone(),
        );

        let config_success = Gauge::default();
        registry.register(
            "gateway_config_last_reload_successful",
            "Whether the last configuration reload succeeded",
            config_success.clone(),
        );

        let config_success_time = Gauge::default();
        registry.register(
            "gateway_config_last_reload_success_timestamp_seconds",
            "Timestamp of the last successful configuration reload",
            config_success_time.clone(),
        );

        Self {
            registry: Arc::new(RwLock::new(registry)),
            http_requests,
            bad_requests,
            request_duration,
            cache_hits,
            cache_misses,
            cache_size_bytes,
            cache_items,
            host_alive,
            killed_queries,
            config_success,
            config_success_time,
        }
    }

    pub fn observe_request(&self, user: &str, code: u16) {
        self.http_requests
            .get_or_create(&[
                ("user".to_string(), user.to_string()),
                ("code".to_string(), code.to_string()),
            ])
            .inc();
    }

    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        let registry = self.registry.read();
        if let Err(e) = encode(&mut buffer, &registry) {
            tracing::error!(error = %e, "failed to encode Prometheus metrics");
            return format!("# Error encoding metrics: {}", e);
        }
        buffer
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
