// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Higher-level API built on the core operations:
//! - `batch_get()` - many reads, positionally aligned
//! - `children()` - ordered subscripts under a node
//! - `search()` - cross-reference lookup through the router
//! - `lock()` / `unlock()` - advisory locks
//! - `execute_native()` - pass-through to the backend's own language
//! - `start_transaction()` - transaction bound to one connection

use std::time::{Duration, Instant};

use tracing::{debug, instrument};

use crate::adapter::traits::{GlobalsError, Result};
use crate::global::{GlobalAddress, GlobalValue, Subscript};
use crate::router::{XrefMatch, XrefQuery};

use super::{GlobalsEngine, GlobalsTransaction};

/// Longest single wait on the backend while holding the engine's lock table.
const LOCK_SLICE: Duration = Duration::from_millis(25);

impl GlobalsEngine {
    // ═══════════════════════════════════════════════════════════════════════
    // API: Batch & Listing
    // ═══════════════════════════════════════════════════════════════════════

    /// Read many nodes at once. The result lines up with `addresses`,
    /// duplicates included; a member that could not be read is undefined.
    /// Fails only when every member failed.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use globals_engine::{GlobalsEngine, GlobalAddress};
    /// # async fn example(engine: &GlobalsEngine) -> Result<(), globals_engine::GlobalsError> {
    /// let addresses: Vec<GlobalAddress> = vec!["^DPT(1,0)".parse()?, "^DPT(2,0)".parse()?];
    /// let values = engine.batch_get(&addresses).await?;
    /// assert_eq!(values.len(), 2);
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip_all, fields(count = addresses.len()))]
    pub async fn batch_get(&self, addresses: &[GlobalAddress]) -> Result<Vec<GlobalValue>> {
        let started = Instant::now();
        let result = self.batch_get_inner(addresses).await;
        self.finish("batch", started, result)
    }

    async fn batch_get_inner(&self, addresses: &[GlobalAddress]) -> Result<Vec<GlobalValue>> {
        let capabilities = self.ensure_ready()?;
        for address in addresses {
            address.ensure_node()?;
            self.check_text(&capabilities, address, None)?;
        }
        let outcome = self.batch.submit(addresses, &capabilities).await?;
        debug!(
            total = outcome.total,
            from_cache = outcome.from_cache,
            fetched = outcome.fetched,
            failed = outcome.failed,
            "Batch read complete"
        );
        Ok(outcome.values)
    }

    /// Subscripts directly under `parent`, in collation order, at most
    /// `limit` of them.
    #[instrument(skip_all, fields(parent = %parent))]
    pub async fn children(&self, parent: &GlobalAddress, limit: Option<usize>) -> Result<Vec<Subscript>> {
        let started = Instant::now();
        let result = self.children_inner(parent, limit).await;
        self.finish("children", started, result)
    }

    async fn children_inner(&self, parent: &GlobalAddress, limit: Option<usize>) -> Result<Vec<Subscript>> {
        let capabilities = self.ensure_ready()?;
        parent.ensure_node()?;
        self.check_text(&capabilities, parent, None)?;
        let limit = limit.unwrap_or(usize::MAX);

        self.read_op("children", move |adapter| async move {
            let mut found = Vec::new();
            let mut cursor = parent.child(Subscript::empty());
            while found.len() < limit {
                let Some(next) = adapter.order(&cursor).await? else {
                    break;
                };
                cursor = cursor.sibling(next.clone());
                found.push(next);
            }
            Ok::<_, GlobalsError>(found)
        })
        .await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // API: Cross-reference search
    // ═══════════════════════════════════════════════════════════════════════

    /// Look up `root(value, id)` entries whose value starts with the query's
    /// prefix. The router picks the bulk or traversal path; both return the
    /// same ordered matches.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use globals_engine::{GlobalsEngine, XrefQuery};
    /// # async fn example(engine: &GlobalsEngine) -> Result<(), globals_engine::GlobalsError> {
    /// let query = XrefQuery::new("^DPT(\"B\")".parse()?).with_prefix("SMITH").with_limit(10);
    /// for hit in engine.search(&query).await? {
    ///     println!("{} -> {}", hit.value, hit.id);
    /// }
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip_all, fields(root = %query.root, prefix = %query.prefix))]
    pub async fn search(&self, query: &XrefQuery) -> Result<Vec<XrefMatch>> {
        let started = Instant::now();
        let result = self.search_inner(query).await;
        self.finish("search", started, result)
    }

    async fn search_inner(&self, query: &XrefQuery) -> Result<Vec<XrefMatch>> {
        let capabilities = self.ensure_ready()?;
        if !capabilities.cross_references {
            return Err(GlobalsError::CapabilityUnsupported(
                "adapter does not support cross-reference search".to_string(),
            ));
        }
        query.root.ensure_node()?;
        self.check_text(&capabilities, &query.root, None)?;

        let router = &self.router;
        let matches = self
            .with_connection(move |adapter| async move {
                router
                    .execute(adapter.as_ref(), query, &capabilities)
                    .await
                    .map(|(_, matches)| matches)
            })
            .await?;
        crate::metrics::record_search_results(matches.len());
        Ok(matches)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // API: Locks
    // ═══════════════════════════════════════════════════════════════════════

    /// Take an advisory lock on `address` and its subtree.
    ///
    /// All of this engine's locks live on one pooled connection, held until
    /// the last one is released. Returns `Timeout` when another owner still
    /// holds a conflicting lock after `timeout`. Adapters without `locking`
    /// succeed immediately.
    #[instrument(skip_all, fields(address = %address, timeout_ms = timeout.as_millis() as u64))]
    pub async fn lock(&self, address: &GlobalAddress, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        let result = self.lock_inner(address, timeout).await;
        self.finish("lock", started, result)
    }

    async fn lock_inner(&self, address: &GlobalAddress, timeout: Duration) -> Result<()> {
        let capabilities = self.ensure_ready()?;
        address.ensure_node()?;
        self.check_text(&capabilities, address, None)?;
        if !capabilities.locking {
            debug!("Adapter has no locking; lock is a no-op");
            return Ok(());
        }

        let deadline = Instant::now() + timeout;
        loop {
            let slice = deadline.saturating_duration_since(Instant::now()).min(LOCK_SLICE);
            if self.try_lock_slice(address, slice).await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(GlobalsError::timeout(format!("lock on {}", address), timeout));
            }
            tokio::task::yield_now().await;
        }
    }

    /// One bounded attempt. The engine's lock table is held only for
    /// `slice`, so unlocks can get in between attempts.
    async fn try_lock_slice(&self, address: &GlobalAddress, slice: Duration) -> Result<bool> {
        let mut holder = self.locks.lock().await;
        if holder.held.contains(address) {
            return Ok(true);
        }
        let mut conn = match holder.connection.take() {
            Some(conn) => conn,
            None => self.pool.acquire(self.config.acquire_timeout()).await?,
        };

        let outcome = conn.adapter().lock(address, slice).await;
        match &outcome {
            Ok(true) => {
                holder.held.insert(address.clone());
            }
            Err(GlobalsError::NotConnected(_)) => {
                // Locks die with the connection.
                conn.mark_broken();
                holder.held.clear();
            }
            _ => {}
        }
        if !holder.held.is_empty() {
            holder.connection = Some(conn);
        }
        outcome
    }

    /// Release a lock taken with [`lock`](Self::lock). Releasing a lock that
    /// is not held is a no-op.
    #[instrument(skip_all, fields(address = %address))]
    pub async fn unlock(&self, address: &GlobalAddress) -> Result<()> {
        let started = Instant::now();
        let result = self.unlock_inner(address).await;
        self.finish("unlock", started, result)
    }

    async fn unlock_inner(&self, address: &GlobalAddress) -> Result<()> {
        let capabilities = self.ensure_ready()?;
        if !capabilities.locking {
            return Ok(());
        }
        let mut holder = self.locks.lock().await;
        if !holder.held.remove(address) {
            return Ok(());
        }
        let result = match &holder.connection {
            Some(conn) => conn.adapter().unlock(address).await,
            None => Ok(()),
        };
        if holder.held.is_empty() {
            holder.connection = None;
        }
        result
    }

    // ═══════════════════════════════════════════════════════════════════════
    // API: Native code & transactions
    // ═══════════════════════════════════════════════════════════════════════

    /// Run backend-native code and return its result.
    ///
    /// Adapters without `native_execution` return undefined. The cache is
    /// dropped afterwards since the code may have written anything.
    #[instrument(skip_all)]
    pub async fn execute_native(&self, code: &str) -> Result<GlobalValue> {
        let started = Instant::now();
        let result = self.execute_native_inner(code).await;
        self.finish("native", started, result)
    }

    async fn execute_native_inner(&self, code: &str) -> Result<GlobalValue> {
        let capabilities = self.ensure_ready()?;
        if !capabilities.native_execution {
            debug!("Adapter has no native execution; returning undefined");
            return Ok(GlobalValue::undefined());
        }
        let result = self
            .with_connection(move |adapter| async move { adapter.execute_native(code).await })
            .await;
        self.cache.clear();
        result
    }

    /// Begin a transaction on a dedicated connection.
    ///
    /// On adapters without `transactions` the handle is a no-op: writes go
    /// straight through and commit/rollback succeed without effect.
    #[instrument(skip_all)]
    pub async fn start_transaction(&self) -> Result<GlobalsTransaction> {
        let started = Instant::now();
        let result = self.start_transaction_inner().await;
        self.finish("transaction", started, result)
    }

    async fn start_transaction_inner(&self) -> Result<GlobalsTransaction> {
        let capabilities = self.ensure_ready()?;
        let mut conn = self.pool.acquire(self.config.acquire_timeout()).await?;
        let tx = match conn.adapter().start_transaction().await {
            Ok(tx) => tx,
            Err(e) => {
                if matches!(e, GlobalsError::NotConnected(_)) {
                    conn.mark_broken();
                }
                return Err(e);
            }
        };
        debug!(tx = ?tx.id(), connection = conn.id(), "Transaction started");
        Ok(GlobalsTransaction::new(conn, tx, std::sync::Arc::clone(&self.cache), capabilities))
    }
}
