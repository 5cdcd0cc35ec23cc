// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the globals engine.

use std::time::Duration;

use crate::adapter::AdapterKind;
use crate::cache::CacheStats;
use crate::pool::PoolStats;
use crate::router::RouterStats;

/// Engine lifecycle state.
///
/// ```text
/// Created → Starting → Ready → ShuttingDown → Stopped
///              │
///              └─(connect failed)─► Created
/// ```
///
/// Use [`super::GlobalsEngine::state()`] to read it or
/// [`super::GlobalsEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Built, not yet started
    Created,
    /// Opening the first connection and reading capabilities
    Starting,
    /// Accepting operations
    Ready,
    /// Draining the pool
    ShuttingDown,
    /// Closed for good
    Stopped,
}

impl EngineState {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Starting => "Starting",
            Self::Ready => "Ready",
            Self::ShuttingDown => "ShuttingDown",
            Self::Stopped => "Stopped",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of engine counters. Monotonic for the life of one engine.
#[derive(Debug, Clone, Default)]
pub struct PerformanceReport {
    pub cache_hit_rate: f64,
    pub cache_size: usize,
    pub total_operations: u64,
    pub average_response_time: Duration,
    pub batch_operations: u64,
    pub bulk_queries: u64,
    pub traversal_queries: u64,
    pub cache: CacheStats,
    pub pool: PoolStats,
    pub router: RouterStats,
}

/// Result of [`super::GlobalsEngine::health_check`].
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: EngineState,
    pub adapter: AdapterKind,
    /// Backend answered a live ping
    pub backend_reachable: bool,
    pub backend_latency_ms: Option<u64>,
    /// Idle connections evicted by the check
    pub evicted_connections: usize,
    pub pool: PoolStats,
    /// Ready and reachable
    pub healthy: bool,
}
