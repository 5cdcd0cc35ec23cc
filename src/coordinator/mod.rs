// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Globals engine coordinator.
//!
//! The [`GlobalsEngine`] is the façade that ties the pieces together:
//! - a [`ConnectionPool`] of adapter connections
//! - a [`GlobalCache`] in front of reads, written through on `set`
//! - a [`BatchProcessor`] for many-address reads
//! - a [`QueryRouter`] for cross-reference searches
//!
//! # Per-operation flow
//!
//! ```text
//! get ─► cache ──hit──────────────────────────────────────────► value
//!          │miss
//!          ▼
//!        acquire ─► adapter.get ─► cache fill ─► release ─► value
//!                       │NotConnected
//!                       └─► mark broken, reacquire, retry (reads only)
//! ```
//!
//! # Lifecycle
//!
//! ```text
//! Created → Starting → Ready → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use globals_engine::{GlobalsEngine, GlobalsConfig, EngineState};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), globals_engine::GlobalsError> {
//! let engine = GlobalsEngine::new(GlobalsConfig::default())?;
//! assert_eq!(engine.state(), EngineState::Created);
//!
//! engine.start().await?;
//! let patient = "^DPT(1,0)".parse()?;
//! engine.set(&patient, "DOE,JOHN^M^2450101").await?;
//! assert_eq!(engine.get(&patient).await?.as_str(), Some("DOE,JOHN^M^2450101"));
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod api;
mod lifecycle;
mod transaction;
mod types;

pub use transaction::GlobalsTransaction;
pub use types::{EngineState, HealthCheck, PerformanceReport};

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::{watch, Semaphore};
use tracing::{debug, instrument, warn};

use crate::adapter::traits::{
    Capabilities, ConnectionResult, GlobalsAdapter, GlobalsError, Result, VersionInfo,
};
use crate::adapter::{create_connector, Connector};
use crate::batching::{BatchConfig, BatchProcessor};
use crate::cache::{spawn_prefetch, GlobalCache};
use crate::config::GlobalsConfig;
use crate::global::{DataStatus, GlobalAddress, GlobalValue, Subscript};
use crate::pool::{ConnectionPool, PooledConnection};
use crate::resilience::{retry_if, RetryConfig};
use crate::router::QueryRouter;

/// Connection that holds every lock this engine owns, plus the set of
/// addresses it holds them on.
#[derive(Default)]
pub(super) struct LockHolder {
    connection: Option<PooledConnection>,
    held: HashSet<GlobalAddress>,
}

/// Main entry point: one engine per backing database.
///
/// `Send + Sync`; share it behind an `Arc`. Every method takes `&self`.
pub struct GlobalsEngine {
    pub(super) config: GlobalsConfig,

    /// Lifecycle state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,
    pub(super) state_rx: watch::Receiver<EngineState>,

    pub(super) pool: ConnectionPool,
    pub(super) cache: Arc<GlobalCache>,
    pub(super) batch: BatchProcessor,
    pub(super) router: QueryRouter,

    /// Read once at start, immutable afterwards
    pub(super) capabilities: OnceLock<Capabilities>,
    pub(super) version: OnceLock<VersionInfo>,

    pub(super) read_retry: RetryConfig,
    pub(super) locks: tokio::sync::Mutex<LockHolder>,
    /// At most one prefetch in flight
    pub(super) prefetch_gate: Arc<Semaphore>,

    pub(super) operations: AtomicU64,
    pub(super) response_nanos: AtomicU64,
}

impl GlobalsEngine {
    /// Build an engine for the adapter named in `config`.
    ///
    /// Nothing connects until [`start()`](Self::start).
    pub fn new(config: GlobalsConfig) -> Result<Self> {
        let connector = create_connector(&config)?;
        Self::with_connector(config, connector)
    }

    /// Build an engine around a caller-supplied connector.
    pub fn with_connector(config: GlobalsConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let (state_tx, state_rx) = watch::channel(EngineState::Created);

        let pool = ConnectionPool::new(connector, config.pool_size, config.test_on_acquire);
        let cache = Arc::new(GlobalCache::from_config(&config));
        let batch = BatchProcessor::new(BatchConfig::from_config(&config), pool.clone(), Arc::clone(&cache));
        let router = QueryRouter::new(config.prefer_bulk_path);

        Ok(Self {
            config,
            state: state_tx,
            state_rx,
            pool,
            cache,
            batch,
            router,
            capabilities: OnceLock::new(),
            version: OnceLock::new(),
            read_retry: RetryConfig::query(),
            locks: tokio::sync::Mutex::new(LockHolder::default()),
            prefetch_gate: Arc::new(Semaphore::new(1)),
            operations: AtomicU64::new(0),
            response_nanos: AtomicU64::new(0),
        })
    }

    /// Replace the backoff used when a read loses its connection.
    #[must_use]
    pub fn with_read_retry(mut self, retry: RetryConfig) -> Self {
        self.read_retry = retry;
        self
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == EngineState::Ready
    }

    #[must_use]
    pub fn config(&self) -> &GlobalsConfig {
        &self.config
    }

    pub(super) fn set_state(&self, state: EngineState) {
        let _ = self.state.send(state);
        crate::metrics::set_engine_state(state.as_str());
    }

    /// Capabilities of the connected adapter.
    pub fn capabilities(&self) -> Result<Capabilities> {
        self.ensure_ready()
    }

    pub fn version_info(&self) -> Result<VersionInfo> {
        self.ensure_ready()?;
        self.version
            .get()
            .cloned()
            .ok_or_else(|| GlobalsError::NotConnected("engine not started".to_string()))
    }

    pub(super) fn ensure_ready(&self) -> Result<Capabilities> {
        let state = self.state();
        if state != EngineState::Ready {
            return Err(GlobalsError::NotConnected(format!("engine is {}", state)));
        }
        self.capabilities
            .get()
            .copied()
            .ok_or_else(|| GlobalsError::NotConnected("engine not started".to_string()))
    }

    pub(super) fn check_text(&self, capabilities: &Capabilities, address: &GlobalAddress, value: Option<&str>) -> Result<()> {
        if capabilities.unicode_support {
            return Ok(());
        }
        if !address.is_ascii() || value.is_some_and(|v| !v.is_ascii()) {
            return Err(GlobalsError::Validation(format!(
                "adapter does not support non-ASCII text: {}",
                address
            )));
        }
        Ok(())
    }

    /// Count and time a façade call.
    pub(super) fn finish<T>(&self, operation: &'static str, started: Instant, result: Result<T>) -> Result<T> {
        let elapsed = started.elapsed();
        self.operations.fetch_add(1, Ordering::Relaxed);
        self.response_nanos
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        crate::metrics::record_latency(operation, elapsed);
        match &result {
            Ok(_) => crate::metrics::record_operation(operation, "success"),
            Err(e) => {
                crate::metrics::record_operation(operation, "error");
                crate::metrics::record_error(operation, e.class().as_str());
                debug!(operation, error = %e, "Operation failed");
            }
        }
        result
    }

    /// One attempt on one pooled connection. A `NotConnected` failure marks
    /// the connection broken so it is not handed out again.
    pub(super) async fn with_connection<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn GlobalsAdapter>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut conn = self.pool.acquire(self.config.acquire_timeout()).await?;
        let result = op(conn.adapter_arc()).await;
        if matches!(result, Err(GlobalsError::NotConnected(_))) {
            warn!(connection = conn.id(), "Connection lost, discarding");
            conn.mark_broken();
        }
        result
    }

    /// [`with_connection`](Self::with_connection) retried on a fresh
    /// connection while the failure is `NotConnected`. Reads only.
    pub(super) async fn read_op<T, F, Fut>(&self, operation: &'static str, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn GlobalsAdapter>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let op = &op;
        retry_if(
            operation,
            &self.read_retry,
            |e: &GlobalsError| matches!(e, GlobalsError::NotConnected(_)),
            move || self.with_connection(op),
        )
        .await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Core operations
    // ═══════════════════════════════════════════════════════════════════════

    /// Read a node. Unwritten nodes read as undefined.
    #[instrument(skip_all, fields(address = %address))]
    pub async fn get(&self, address: &GlobalAddress) -> Result<GlobalValue> {
        let started = Instant::now();
        let result = self.get_inner(address).await;
        self.finish("get", started, result)
    }

    async fn get_inner(&self, address: &GlobalAddress) -> Result<GlobalValue> {
        let capabilities = self.ensure_ready()?;
        address.ensure_node()?;
        self.check_text(&capabilities, address, None)?;

        if let Some(value) = self.cache.get(address) {
            return Ok(value);
        }

        let ticket = self.cache.begin_fill();
        let value = self
            .read_op("get", move |adapter| async move { adapter.get(address).await })
            .await?;
        self.cache.complete_fill(ticket, address.clone(), value.clone());

        if self.config.prefetch_enabled() {
            if let Ok(permit) = Arc::clone(&self.prefetch_gate).try_acquire_owned() {
                spawn_prefetch(
                    self.pool.clone(),
                    Arc::clone(&self.cache),
                    address.clone(),
                    self.config.prefetch_width,
                    permit,
                );
            }
        }
        Ok(value)
    }

    /// Write a node. The empty string deletes the node's value (descendants
    /// stay). Never retried.
    #[instrument(skip_all, fields(address = %address))]
    pub async fn set(&self, address: &GlobalAddress, value: &str) -> Result<()> {
        let started = Instant::now();
        let result = self.set_inner(address, value).await;
        self.finish("set", started, result)
    }

    async fn set_inner(&self, address: &GlobalAddress, value: &str) -> Result<()> {
        let capabilities = self.ensure_ready()?;
        address.ensure_node()?;
        self.check_text(&capabilities, address, Some(value))?;

        let result = self
            .with_connection(move |adapter| async move { adapter.set(address, value).await })
            .await;
        match result {
            Ok(()) => {
                self.cache
                    .complete_write(address.clone(), GlobalValue::from_written(value));
                Ok(())
            }
            Err(e) => {
                // The write may or may not have landed.
                self.cache.invalidate(address);
                Err(e)
            }
        }
    }

    /// Delete a node's value. Same as `set(address, "")`.
    pub async fn kill(&self, address: &GlobalAddress) -> Result<()> {
        self.set(address, "").await
    }

    /// Next sibling subscript after the last subscript of `address`, in
    /// collation order. An empty last subscript starts before the first.
    #[instrument(skip_all, fields(address = %address))]
    pub async fn order(&self, address: &GlobalAddress) -> Result<Option<Subscript>> {
        let started = Instant::now();
        let result = self.order_inner(address).await;
        self.finish("order", started, result)
    }

    async fn order_inner(&self, address: &GlobalAddress) -> Result<Option<Subscript>> {
        let capabilities = self.ensure_ready()?;
        address.ensure_order_cursor()?;
        self.check_text(&capabilities, address, None)?;
        self.read_op("order", move |adapter| async move { adapter.order(address).await })
            .await
    }

    /// `$DATA`: whether the node has a value and/or descendants.
    #[instrument(skip_all, fields(address = %address))]
    pub async fn data_status(&self, address: &GlobalAddress) -> Result<DataStatus> {
        let started = Instant::now();
        let result = self.data_status_inner(address).await;
        self.finish("data", started, result)
    }

    async fn data_status_inner(&self, address: &GlobalAddress) -> Result<DataStatus> {
        let capabilities = self.ensure_ready()?;
        address.ensure_node()?;
        self.check_text(&capabilities, address, None)?;
        self.read_op("data", move |adapter| async move { adapter.data_status(address).await })
            .await
    }

    /// Open a connection and run the adapter's probe round trip.
    pub async fn test_connection(&self) -> ConnectionResult {
        match self.pool.acquire(self.config.acquire_timeout()).await {
            Ok(conn) => crate::adapter::test_connection(conn.adapter()).await,
            Err(e) => ConnectionResult {
                success: false,
                message: e.to_string(),
                timestamp: std::time::SystemTime::now(),
            },
        }
    }

    #[must_use]
    pub fn stats(&self) -> PerformanceReport {
        let cache = self.cache.stats();
        let router = self.router.stats();
        let total_operations = self.operations.load(Ordering::Relaxed);
        let average_response_time = if total_operations == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(self.response_nanos.load(Ordering::Relaxed) / total_operations)
        };
        PerformanceReport {
            cache_hit_rate: cache.hit_rate(),
            cache_size: cache.size,
            total_operations,
            average_response_time,
            batch_operations: self.batch.stats().batches,
            bulk_queries: router.bulk,
            traversal_queries: router.traversal,
            cache,
            pool: self.pool.stats(),
            router,
        }
    }

    /// Ping the backend and evict dead idle connections. Never fails.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let evicted_connections = self.pool.health_check().await;
        self.cache.purge_expired();

        let probe_started = Instant::now();
        let reachable = state == EngineState::Ready
            && self
                .with_connection(|adapter| async move { adapter.ping().await })
                .await
                .is_ok();
        let backend_latency_ms = reachable.then(|| probe_started.elapsed().as_millis() as u64);
        crate::metrics::set_backend_healthy(self.pool.kind().as_str(), reachable);

        HealthCheck {
            state,
            adapter: self.pool.kind(),
            backend_reachable: reachable,
            backend_latency_ms,
            evicted_connections,
            pool: self.pool.stats(),
            healthy: state == EngineState::Ready && reachable,
        }
    }
}
