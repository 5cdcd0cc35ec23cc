// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transactions bound to one pooled connection.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::adapter::traits::{Capabilities, GlobalsError, Result, Transaction};
use crate::cache::GlobalCache;
use crate::global::{GlobalAddress, GlobalValue};
use crate::pool::PooledConnection;

/// An open transaction. Holds its connection until committed or rolled
/// back.
///
/// Reads go straight to the connection so they see the transaction's own
/// uncommitted writes. Writes invalidate the shared cache, and commit or
/// rollback invalidates every written address again.
///
/// Dropping an unfinished transaction rolls it back in the background.
pub struct GlobalsTransaction {
    conn: Option<PooledConnection>,
    tx: Option<Transaction>,
    cache: Arc<GlobalCache>,
    capabilities: Capabilities,
    written: Vec<GlobalAddress>,
}

impl GlobalsTransaction {
    pub(super) fn new(
        conn: PooledConnection,
        tx: Transaction,
        cache: Arc<GlobalCache>,
        capabilities: Capabilities,
    ) -> Self {
        Self {
            conn: Some(conn),
            tx: Some(tx),
            cache,
            capabilities,
            written: Vec::new(),
        }
    }

    /// False when the adapter has no transactions and this handle only
    /// passes writes through.
    #[must_use]
    pub fn is_transactional(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_noop())
    }

    fn connection(&self) -> Result<&PooledConnection> {
        self.conn
            .as_ref()
            .ok_or_else(|| GlobalsError::OperationFailed("transaction already finished".to_string()))
    }

    fn check(&self, address: &GlobalAddress, value: Option<&str>) -> Result<()> {
        address.ensure_node()?;
        if !self.capabilities.unicode_support
            && (!address.is_ascii() || value.is_some_and(|v| !v.is_ascii()))
        {
            return Err(GlobalsError::Validation(format!(
                "adapter does not support non-ASCII text: {}",
                address
            )));
        }
        Ok(())
    }

    pub async fn get(&self, address: &GlobalAddress) -> Result<GlobalValue> {
        self.check(address, None)?;
        self.connection()?.adapter().get(address).await
    }

    pub async fn set(&mut self, address: &GlobalAddress, value: &str) -> Result<()> {
        self.check(address, Some(value))?;
        let result = self.connection()?.adapter().set(address, value).await;
        // Invalidate even on error: the write may have landed.
        self.cache.invalidate(address);
        if !self.written.contains(address) {
            self.written.push(address.clone());
        }
        result
    }

    pub async fn commit(mut self) -> Result<()> {
        let _timer = crate::time_operation!("commit");
        let (conn, tx) = self.take()?;
        let result = conn.adapter().commit(tx).await;
        // Readers outside the transaction may have cached pre-commit values.
        self.invalidate_written();
        debug!(writes = self.written.len(), ok = result.is_ok(), "Transaction commit");
        result
    }

    pub async fn rollback(mut self) -> Result<()> {
        let _timer = crate::time_operation!("rollback");
        let (conn, tx) = self.take()?;
        let result = conn.adapter().rollback(tx).await;
        self.invalidate_written();
        debug!(writes = self.written.len(), ok = result.is_ok(), "Transaction rollback");
        result
    }

    fn take(&mut self) -> Result<(PooledConnection, Transaction)> {
        match (self.conn.take(), self.tx.take()) {
            (Some(conn), Some(tx)) => Ok((conn, tx)),
            _ => Err(GlobalsError::OperationFailed("transaction already finished".to_string())),
        }
    }

    fn invalidate_written(&self) {
        for address in &self.written {
            self.cache.invalidate(address);
        }
    }
}

impl Drop for GlobalsTransaction {
    fn drop(&mut self) {
        let (Some(mut conn), Some(tx)) = (self.conn.take(), self.tx.take()) else {
            return;
        };
        self.invalidate_written();
        if tx.is_noop() {
            return;
        }
        warn!(writes = self.written.len(), "Transaction dropped unfinished, rolling back");
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            // No rollback possible here; the connection must not be reused
            // with the transaction still open.
            conn.mark_broken();
            return;
        };
        let cache = Arc::clone(&self.cache);
        let written = std::mem::take(&mut self.written);
        handle.spawn(async move {
            if let Err(e) = conn.adapter().rollback(tx).await {
                warn!(error = %e, "Background rollback failed");
            }
            for address in &written {
                cache.invalidate(address);
            }
        });
    }
}
