// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test helpers: a connector that counts adapter calls and can
//! inject transport failures or latency.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use globals_engine::adapter::{AdapterKind, Connector, GlobalsAdapter};
use globals_engine::{
    Capabilities, DataStatus, GlobalAddress, GlobalValue, GlobalsConfig, GlobalsEngine,
    GlobalsError, MemoryConnector, MemoryStore, RetryConfig, Subscript, Transaction, VersionInfo,
    XrefMatch, XrefQuery,
};

type Result<T> = std::result::Result<T, GlobalsError>;

#[derive(Default)]
pub struct Probe {
    pub gets: AtomicUsize,
    pub get_many_calls: AtomicUsize,
    pub sets: AtomicUsize,
    pub orders: AtomicUsize,
    pub scans: AtomicUsize,
    /// Upcoming gets that fail with `NotConnected`
    pub fail_gets: AtomicUsize,
    /// Upcoming sets that fail with `NotConnected`
    pub fail_sets: AtomicUsize,
    pub get_delay_ms: AtomicUsize,
    pub active_gets: AtomicUsize,
    pub peak_active_gets: AtomicUsize,
}

impl Probe {
    pub fn gets(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

pub struct CountingConnector {
    inner: MemoryConnector,
    pub probe: Arc<Probe>,
}

impl CountingConnector {
    pub fn new(capabilities: Capabilities) -> Self {
        Self::with_store(Arc::new(MemoryStore::new()), capabilities)
    }

    pub fn with_store(store: Arc<MemoryStore>, capabilities: Capabilities) -> Self {
        Self {
            inner: MemoryConnector::with_store(store).with_capabilities(capabilities),
            probe: Arc::new(Probe::default()),
        }
    }

    pub fn store(&self) -> Arc<MemoryStore> {
        self.inner.store()
    }
}

#[async_trait]
impl Connector for CountingConnector {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Memory
    }

    async fn connect(&self) -> Result<Arc<dyn GlobalsAdapter>> {
        let inner = self.inner.connect().await?;
        Ok(Arc::new(CountingAdapter {
            inner,
            probe: Arc::clone(&self.probe),
        }))
    }
}

struct CountingAdapter {
    inner: Arc<dyn GlobalsAdapter>,
    probe: Arc<Probe>,
}

#[async_trait]
impl GlobalsAdapter for CountingAdapter {
    fn kind(&self) -> AdapterKind {
        self.inner.kind()
    }

    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }

    fn version_info(&self) -> VersionInfo {
        self.inner.version_info()
    }

    async fn get(&self, address: &GlobalAddress) -> Result<GlobalValue> {
        self.probe.gets.fetch_add(1, Ordering::SeqCst);
        if Probe::take_failure(&self.probe.fail_gets) {
            return Err(GlobalsError::NotConnected("injected".into()));
        }
        let active = self.probe.active_gets.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.peak_active_gets.fetch_max(active, Ordering::SeqCst);
        let delay = self.probe.get_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        let result = self.inner.get(address).await;
        self.probe.active_gets.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn set(&self, address: &GlobalAddress, value: &str) -> Result<()> {
        self.probe.sets.fetch_add(1, Ordering::SeqCst);
        if Probe::take_failure(&self.probe.fail_sets) {
            return Err(GlobalsError::NotConnected("injected".into()));
        }
        self.inner.set(address, value).await
    }

    async fn order(&self, address: &GlobalAddress) -> Result<Option<Subscript>> {
        self.probe.orders.fetch_add(1, Ordering::SeqCst);
        self.inner.order(address).await
    }

    async fn data_status(&self, address: &GlobalAddress) -> Result<DataStatus> {
        self.inner.data_status(address).await
    }

    async fn get_many(&self, addresses: &[GlobalAddress]) -> Vec<Result<GlobalValue>> {
        self.probe.get_many_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.get_many(addresses).await
    }

    async fn scan_xref(&self, query: &XrefQuery) -> Result<Vec<XrefMatch>> {
        self.probe.scans.fetch_add(1, Ordering::SeqCst);
        self.inner.scan_xref(query).await
    }

    async fn lock(&self, address: &GlobalAddress, timeout: Duration) -> Result<bool> {
        self.inner.lock(address, timeout).await
    }

    async fn unlock(&self, address: &GlobalAddress) -> Result<()> {
        self.inner.unlock(address).await
    }

    async fn execute_native(&self, code: &str) -> Result<GlobalValue> {
        self.inner.execute_native(code).await
    }

    async fn start_transaction(&self) -> Result<Transaction> {
        self.inner.start_transaction().await
    }

    async fn commit(&self, tx: Transaction) -> Result<()> {
        self.inner.commit(tx).await
    }

    async fn rollback(&self, tx: Transaction) -> Result<()> {
        self.inner.rollback(tx).await
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        factor: 2.0,
        max_attempts: 3,
    }
}

/// Started engine over a counting connector.
pub async fn engine_with(config: GlobalsConfig, capabilities: Capabilities) -> (GlobalsEngine, Arc<Probe>, Arc<MemoryStore>) {
    let connector = CountingConnector::new(capabilities);
    let probe = Arc::clone(&connector.probe);
    let store = connector.store();
    let engine = GlobalsEngine::with_connector(config, Arc::new(connector))
        .unwrap()
        .with_read_retry(fast_retry());
    engine.start().await.unwrap();
    (engine, probe, store)
}

pub async fn engine() -> (GlobalsEngine, Arc<Probe>, Arc<MemoryStore>) {
    engine_with(GlobalsConfig::default(), Capabilities::full()).await
}

pub fn addr(s: &str) -> GlobalAddress {
    s.parse().unwrap()
}
