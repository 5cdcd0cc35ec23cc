// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded pool of adapter connections.
//!
//! ```text
//!  acquire(timeout)
//!       │
//!       ▼
//!  Semaphore (pool_size permits) ──timeout──► GlobalsError::Timeout
//!       │ permit
//!       ▼
//!  idle queue ──empty──► Connector::connect()
//!       │ (ping first when test_on_acquire)
//!       ▼
//!  PooledConnection ──drop──► back to idle (or discarded if broken)
//! ```
//!
//! Permits bound the number of connections lent out at once, so the
//! number of live connections never exceeds `pool_size` for long.
//! Connections are opened lazily on demand.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapter::traits::{GlobalsAdapter, GlobalsError, Result};
use crate::adapter::{AdapterKind, Connector};

struct Slot {
    id: u64,
    adapter: Arc<dyn GlobalsAdapter>,
    created_at: Instant,
    idle_since: Instant,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    evicted: AtomicU64,
    acquired: AtomicU64,
    timeouts: AtomicU64,
    in_use: AtomicUsize,
    peak_in_use: AtomicUsize,
}

struct PoolInner {
    connector: Arc<dyn Connector>,
    permits: Arc<Semaphore>,
    idle: Mutex<VecDeque<Slot>>,
    max_size: usize,
    test_on_acquire: bool,
    closed: AtomicBool,
    next_id: AtomicU64,
    counters: Counters,
    shutdown_tx: watch::Sender<bool>,
    checker: Mutex<Option<JoinHandle<()>>>,
}

impl PoolInner {
    /// Close a connection we no longer want, off the caller's path.
    fn discard(&self, slot: Slot, reason: &'static str) {
        self.counters.evicted.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_pool_eviction(reason);
        debug!(connection = slot.id, reason, "Discarding connection");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let adapter = slot.adapter;
            handle.spawn(async move {
                let _ = adapter.close().await;
            });
        }
    }

    fn park(&self, mut slot: Slot) {
        if self.closed.load(Ordering::SeqCst) {
            self.discard(slot, "shutdown");
            return;
        }
        let mut idle = self.idle.lock();
        if idle.len() >= self.max_size {
            drop(idle);
            self.discard(slot, "surplus");
            return;
        }
        slot.idle_since = Instant::now();
        idle.push_back(slot);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub max_size: usize,
    /// Connections opened over the pool's lifetime
    pub created: u64,
    /// Connections discarded (broken, failed health check, shutdown)
    pub evicted: u64,
    pub acquired: u64,
    pub timeouts: u64,
    pub in_use: usize,
    pub peak_in_use: usize,
    pub idle: usize,
}

/// Bounded, lazily-filled pool. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    #[must_use]
    pub fn new(connector: Arc<dyn Connector>, max_size: usize, test_on_acquire: bool) -> Self {
        let max_size = max_size.max(1);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(PoolInner {
                connector,
                permits: Arc::new(Semaphore::new(max_size)),
                idle: Mutex::new(VecDeque::with_capacity(max_size)),
                max_size,
                test_on_acquire,
                closed: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                counters: Counters::default(),
                shutdown_tx,
                checker: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn kind(&self) -> AdapterKind {
        self.inner.connector.kind()
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.inner.max_size
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Borrow a connection, waiting at most `timeout` for a free slot.
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledConnection> {
        if self.is_closed() {
            return Err(GlobalsError::NotConnected("connection pool is shut down".to_string()));
        }

        let started = Instant::now();
        let permit = match tokio::time::timeout(timeout, Arc::clone(&self.inner.permits).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(GlobalsError::NotConnected("connection pool is shut down".to_string()))
            }
            Err(_) => {
                self.inner.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_pool_timeout();
                warn!(timeout_ms = timeout.as_millis() as u64, "Timed out waiting for a pooled connection");
                return Err(GlobalsError::timeout("pooled connection", started.elapsed()));
            }
        };
        crate::metrics::record_pool_wait(started.elapsed());
        self.checkout(permit).await
    }

    /// Borrow a connection only if a slot is free right now. Never waits
    /// behind queued callers.
    pub async fn try_acquire(&self) -> Result<Option<PooledConnection>> {
        if self.is_closed() {
            return Err(GlobalsError::NotConnected("connection pool is shut down".to_string()));
        }
        match Arc::clone(&self.inner.permits).try_acquire_owned() {
            Ok(permit) => self.checkout(permit).await.map(Some),
            Err(TryAcquireError::NoPermits) => Ok(None),
            Err(TryAcquireError::Closed) => {
                Err(GlobalsError::NotConnected("connection pool is shut down".to_string()))
            }
        }
    }

    async fn checkout(&self, permit: OwnedSemaphorePermit) -> Result<PooledConnection> {
        let slot = match self.take_idle().await {
            Some(slot) => slot,
            None => self.open().await?,
        };
        Ok(self.lend(slot, permit))
    }

    /// Explicit return. Dropping the guard does the same.
    pub fn release(&self, connection: PooledConnection) {
        drop(connection);
    }

    async fn take_idle(&self) -> Option<Slot> {
        loop {
            let slot = self.inner.idle.lock().pop_front()?;
            if !self.inner.test_on_acquire {
                return Some(slot);
            }
            match slot.adapter.ping().await {
                Ok(()) => return Some(slot),
                Err(e) => {
                    debug!(connection = slot.id, error = %e, "Idle connection failed ping");
                    self.inner.discard(slot, "ping");
                }
            }
        }
    }

    async fn open(&self) -> Result<Slot> {
        let adapter = self.inner.connector.connect().await?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.counters.created.fetch_add(1, Ordering::Relaxed);
        debug!(connection = id, kind = %self.kind(), "Opened pooled connection");
        let now = Instant::now();
        Ok(Slot {
            id,
            adapter,
            created_at: now,
            idle_since: now,
        })
    }

    fn lend(&self, slot: Slot, permit: OwnedSemaphorePermit) -> PooledConnection {
        let counters = &self.inner.counters;
        counters.acquired.fetch_add(1, Ordering::Relaxed);
        let in_use = counters.in_use.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_in_use.fetch_max(in_use, Ordering::SeqCst);
        crate::metrics::set_pool_in_use(in_use);
        PooledConnection {
            slot: Some(slot),
            pool: Arc::clone(&self.inner),
            broken: false,
            _permit: permit,
        }
    }

    /// Ping every idle connection and discard the ones that fail. Returns how
    /// many were discarded. Never fails.
    ///
    /// Each connection is pinged under a pool permit, so a check never
    /// pushes the live count past `max_size`. The round stops early when
    /// every permit is lent out.
    pub async fn health_check(&self) -> usize {
        let rounds = self.inner.idle.lock().len();
        let mut evicted = 0;
        for _ in 0..rounds {
            let Ok(_permit) = Arc::clone(&self.inner.permits).try_acquire_owned() else {
                break;
            };
            let Some(slot) = self.inner.idle.lock().pop_front() else {
                break;
            };
            match slot.adapter.ping().await {
                Ok(()) => self.inner.park(slot),
                Err(e) => {
                    warn!(connection = slot.id, error = %e, "Health check failed, evicting connection");
                    self.inner.discard(slot, "health_check");
                    evicted += 1;
                }
            }
        }
        crate::metrics::set_backend_healthy(self.kind().as_str(), evicted == 0);
        evicted
    }

    /// Run [`health_check`](Self::health_check) every `interval` until shutdown.
    pub fn start_health_checker(&self, interval: Duration) {
        let pool = self.clone();
        let mut shutdown_rx = self.inner.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = pool.health_check().await;
                        if evicted > 0 {
                            info!(evicted, "Background health check evicted connections");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
            debug!("Pool health checker stopped");
        });
        if let Some(previous) = self.inner.checker.lock().replace(handle) {
            previous.abort();
        }
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let c = &self.inner.counters;
        PoolStats {
            max_size: self.inner.max_size,
            created: c.created.load(Ordering::Relaxed),
            evicted: c.evicted.load(Ordering::Relaxed),
            acquired: c.acquired.load(Ordering::Relaxed),
            timeouts: c.timeouts.load(Ordering::Relaxed),
            in_use: c.in_use.load(Ordering::SeqCst),
            peak_in_use: c.peak_in_use.load(Ordering::SeqCst),
            idle: self.inner.idle.lock().len(),
        }
    }

    /// Reject further acquires, stop the health checker and close idle
    /// connections. Lent connections are closed as they come back.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.permits.close();
        let _ = self.inner.shutdown_tx.send(true);
        let checker = self.inner.checker.lock().take();
        if let Some(handle) = checker {
            let _ = handle.await;
        }

        let idle: Vec<Slot> = self.inner.idle.lock().drain(..).collect();
        let count = idle.len();
        for slot in idle {
            if let Err(e) = slot.adapter.close().await {
                debug!(connection = slot.id, error = %e, "Error closing connection");
            }
            self.inner.counters.evicted.fetch_add(1, Ordering::Relaxed);
        }
        info!(closed = count, "Connection pool shut down");
    }
}

/// A connection on loan from the pool. Returned on drop.
pub struct PooledConnection {
    slot: Option<Slot>,
    pool: Arc<PoolInner>,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    #[must_use]
    pub fn adapter(&self) -> &dyn GlobalsAdapter {
        match &self.slot {
            Some(slot) => slot.adapter.as_ref(),
            None => unreachable!("slot is only taken in drop"),
        }
    }

    /// Shared handle, for work that outlives the borrow.
    #[must_use]
    pub fn adapter_arc(&self) -> Arc<dyn GlobalsAdapter> {
        match &self.slot {
            Some(slot) => Arc::clone(&slot.adapter),
            None => unreachable!("slot is only taken in drop"),
        }
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.slot.as_ref().map_or(0, |s| s.id)
    }

    #[must_use]
    pub fn age(&self) -> Duration {
        self.slot.as_ref().map_or(Duration::ZERO, |s| s.created_at.elapsed())
    }

    /// Discard instead of returning to the pool.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let in_use = self.pool.counters.in_use.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        crate::metrics::set_pool_in_use(in_use);
        if let Some(slot) = self.slot.take() {
            if self.broken {
                self.pool.discard(slot, "broken");
            } else {
                self.pool.park(slot);
            }
        }
    }
}
