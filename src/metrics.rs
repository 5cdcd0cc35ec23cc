// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for globals-engine.
//!
//! Uses the `metrics` crate for backend-agnostic collection. The host process
//! picks the exporter (Prometheus, OTEL, ...); without one every call is a
//! no-op.
//!
//! # Metric Naming Convention
//! - `globals_engine_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `operation`: get, set, order, data, search, batch, ...
//! - `status`: success, error
//! - `route`: bulk, traversal
//! - `adapter`: memory, sql

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a façade operation outcome
pub fn record_operation(operation: &str, status: &str) {
    counter!(
        "globals_engine_operations_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "globals_engine_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record an error by class for alerting
pub fn record_error(operation: &str, error_class: &str) {
    counter!(
        "globals_engine_errors_total",
        "operation" => operation.to_string(),
        "class" => error_class.to_string()
    )
    .increment(1);
}

/// Record a retried attempt
pub fn record_retry(operation: &str) {
    counter!(
        "globals_engine_retries_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// CACHE
// ═══════════════════════════════════════════════════════════════════════════

/// Record cache hit/miss
pub fn record_cache_lookup(hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    counter!(
        "globals_engine_cache_lookups_total",
        "outcome" => outcome
    )
    .increment(1);
}

/// Record entries evicted by LRU capacity
pub fn record_cache_eviction(count: usize) {
    counter!("globals_engine_cache_evictions_total").increment(count as u64);
}

/// Set current cache entry count
pub fn set_cache_entries(count: usize) {
    gauge!("globals_engine_cache_entries").set(count as f64);
}

/// Record a prefetch pass and how many children it loaded
pub fn record_prefetch(loaded: usize) {
    counter!("globals_engine_prefetch_total").increment(1);
    counter!("globals_engine_prefetched_nodes_total").increment(loaded as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// POOL
// ═══════════════════════════════════════════════════════════════════════════

/// Record time spent waiting for a pooled connection
pub fn record_pool_wait(duration: Duration) {
    histogram!("globals_engine_pool_wait_seconds").record(duration.as_secs_f64());
}

/// Record an acquire that timed out
pub fn record_pool_timeout() {
    counter!("globals_engine_pool_timeouts_total").increment(1);
}

/// Record a connection discarded (broken or failed health check)
pub fn record_pool_eviction(reason: &str) {
    counter!(
        "globals_engine_pool_evictions_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Set connections currently lent out
pub fn set_pool_in_use(count: usize) {
    gauge!("globals_engine_pool_in_use").set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// BATCH + ROUTER
// ═══════════════════════════════════════════════════════════════════════════

/// Record batch size and how many members failed
pub fn record_batch(size: usize, failed: usize) {
    histogram!("globals_engine_batch_size").record(size as f64);
    if failed > 0 {
        counter!("globals_engine_batch_member_failures_total").increment(failed as u64);
    }
}

/// Record a routing decision
pub fn record_route(route: &str) {
    counter!(
        "globals_engine_routes_total",
        "route" => route.to_string()
    )
    .increment(1);
}

/// Record search result count
pub fn record_search_results(count: usize) {
    histogram!("globals_engine_search_results").record(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// LIFECYCLE
// ═══════════════════════════════════════════════════════════════════════════

/// Record startup phase duration
pub fn record_startup_phase(phase: &str, duration: Duration) {
    histogram!(
        "globals_engine_startup_seconds",
        "phase" => phase.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Track engine state transitions
pub fn set_engine_state(state: &str) {
    counter!(
        "globals_engine_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// Set backend health (1 = healthy, 0 = unhealthy)
pub fn set_backend_healthy(adapter: &str, healthy: bool) {
    gauge!(
        "globals_engine_backend_healthy",
        "adapter" => adapter.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}

/// Convenience macro for timing operations
#[macro_export]
macro_rules! time_operation {
    ($op:expr) => {
        $crate::metrics::LatencyTimer::new($op)
    };
}
