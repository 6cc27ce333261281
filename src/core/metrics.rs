// src/core/metrics.rs

//! Defines and registers Prometheus metrics for control-plane monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, TextEncoder, register_counter, register_counter_vec,
    register_gauge, register_histogram,
};

lazy_static! {
    // --- Autopilot ---
    /// How many voter failures the cluster can absorb while keeping quorum.
    pub static ref AUTOPILOT_FAILURE_TOLERANCE: Gauge = register_gauge!(
        "muster_autopilot_failure_tolerance",
        "Number of voting servers the cluster can lose while keeping quorum."
    ).unwrap();
    /// A boolean gauge: 1 when every server is healthy.
    pub static ref AUTOPILOT_HEALTHY: Gauge = register_gauge!(
        "muster_autopilot_healthy",
        "Whether all servers are currently healthy (1 for true, 0 for false)."
    ).unwrap();
    /// Servers removed by dead-server cleanup since startup.
    pub static ref AUTOPILOT_REMOVALS_TOTAL: Counter = register_counter!(
        "muster_autopilot_removals_total",
        "Total number of servers removed by autopilot dead-server cleanup."
    ).unwrap();
    /// Non-voters promoted to voter since startup.
    pub static ref AUTOPILOT_PROMOTIONS_TOTAL: Counter = register_counter!(
        "muster_autopilot_promotions_total",
        "Total number of servers promoted to voter by autopilot."
    ).unwrap();

    // --- Event publisher ---
    /// Events published, labeled by topic.
    pub static ref EVENTS_PUBLISHED_TOTAL: CounterVec = register_counter_vec!(
        "muster_events_published_total",
        "Total number of events published, labeled by topic.",
        &["topic"]
    ).unwrap();
    /// Subscriptions force-closed (lag, token invalidation).
    pub static ref SUBSCRIPTIONS_FORCE_CLOSED_TOTAL: Counter = register_counter!(
        "muster_subscriptions_force_closed_total",
        "Total number of subscriptions force-closed by the publisher."
    ).unwrap();

    // --- RPC ---
    /// Currently blocked queries waiting on a watch set.
    pub static ref BLOCKING_QUERIES: Gauge = register_gauge!(
        "muster_blocking_queries",
        "Number of blocking queries currently registered on watch channels."
    ).unwrap();
    /// Requests forwarded, labeled by destination kind (leader / datacenter).
    pub static ref RPC_FORWARDED_TOTAL: CounterVec = register_counter_vec!(
        "muster_rpc_forwarded_total",
        "Total number of requests forwarded, labeled by destination kind.",
        &["destination"]
    ).unwrap();
    /// A histogram of locally-served RPC latencies.
    pub static ref RPC_LATENCY_SECONDS: Histogram = register_histogram!(
        "muster_rpc_latency_seconds",
        "Latency of locally-served RPC requests in seconds."
    ).unwrap();

    // --- Cache ---
    pub static ref CACHE_HITS_TOTAL: CounterVec = register_counter_vec!(
        "muster_cache_hits_total",
        "Total number of cache hits, labeled by cache type.",
        &["type"]
    ).unwrap();
    pub static ref CACHE_MISSES_TOTAL: CounterVec = register_counter_vec!(
        "muster_cache_misses_total",
        "Total number of cache misses, labeled by cache type.",
        &["type"]
    ).unwrap();
    pub static ref CACHE_EVICTIONS_TOTAL: Counter = register_counter!(
        "muster_cache_evictions_total",
        "Total number of cache entries evicted after their TTL."
    ).unwrap();
    pub static ref CACHE_FETCHES_TOTAL: CounterVec = register_counter_vec!(
        "muster_cache_fetches_total",
        "Total number of upstream fetches issued by the cache, labeled by outcome.",
        &["outcome"]
    ).unwrap();

    // --- Anti-entropy ---
    pub static ref ANTI_ENTROPY_SYNCS_TOTAL: CounterVec = register_counter_vec!(
        "muster_anti_entropy_syncs_total",
        "Total number of anti-entropy sync attempts, labeled by outcome.",
        &["outcome"]
    ).unwrap();
    /// Local entries currently out of sync with the catalog.
    pub static ref ANTI_ENTROPY_PENDING: Gauge = register_gauge!(
        "muster_anti_entropy_pending",
        "Number of locally-declared entries not yet in sync with the catalog."
    ).unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap()
}
