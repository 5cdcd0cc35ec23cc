// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle: start and shutdown.

use std::time::Instant;

use tracing::{error, info, warn};

use crate::adapter::traits::{GlobalsError, Result};

use super::{EngineState, GlobalsEngine};

impl GlobalsEngine {
    /// Connect to the backend and become `Ready`.
    ///
    /// Startup:
    /// 1. Open one pooled connection (the connector does its own retries)
    /// 2. Read capabilities and version; fixed for the engine's lifetime
    /// 3. Start the background pool health check, if configured
    ///
    /// Calling `start` on a ready engine is a no-op. A failed start leaves
    /// the engine in `Created` so it can be retried.
    #[tracing::instrument(skip(self), fields(adapter = %self.pool.kind()))]
    pub async fn start(&self) -> Result<()> {
        match self.state() {
            EngineState::Created => {}
            EngineState::Ready => return Ok(()),
            other => {
                return Err(GlobalsError::NotConnected(format!(
                    "cannot start engine in state {}",
                    other
                )))
            }
        }

        let startup_start = Instant::now();
        info!("Starting globals engine");
        self.set_state(EngineState::Starting);

        // ========== PHASE 1: Connect ==========
        let phase_start = Instant::now();
        let conn = match self.pool.acquire(self.config.acquire_timeout()).await {
            Ok(conn) => conn,
            Err(e) => {
                error!(error = %e, "Failed to connect to backend");
                crate::metrics::set_backend_healthy(self.pool.kind().as_str(), false);
                self.set_state(EngineState::Created);
                return Err(e);
            }
        };
        crate::metrics::record_startup_phase("connect", phase_start.elapsed());

        // ========== PHASE 2: Negotiate capabilities ==========
        let capabilities = conn.adapter().capabilities();
        let version = conn.adapter().version_info();
        drop(conn);
        let _ = self.capabilities.set(capabilities);
        let _ = self.version.set(version.clone());
        info!(
            adapter_version = %version.adapter_version,
            database_version = %version.database_version,
            transactions = capabilities.transactions,
            locking = capabilities.locking,
            bulk_query = capabilities.bulk_query,
            native_batch = capabilities.native_batch,
            "Backend capabilities negotiated"
        );

        // ========== PHASE 3: Background work ==========
        if let Some(interval) = self.config.health_check_interval() {
            self.pool.start_health_checker(interval);
            info!(interval_ms = interval.as_millis() as u64, "Pool health checker started");
        }

        crate::metrics::set_backend_healthy(self.pool.kind().as_str(), true);
        crate::metrics::record_startup_phase("total", startup_start.elapsed());
        self.set_state(EngineState::Ready);
        info!(elapsed_ms = startup_start.elapsed().as_millis() as u64, "Globals engine ready");
        Ok(())
    }

    /// Release held locks, close the pool and move to `Stopped`.
    ///
    /// Idempotent. Operations after shutdown fail with `NotConnected`.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        if matches!(self.state(), EngineState::ShuttingDown | EngineState::Stopped) {
            return;
        }
        info!("Shutting down globals engine");
        self.set_state(EngineState::ShuttingDown);

        {
            let mut locks = self.locks.lock().await;
            if let Some(conn) = locks.connection.take() {
                for address in locks.held.drain() {
                    if let Err(e) = conn.adapter().unlock(&address).await {
                        warn!(address = %address, error = %e, "Failed to release lock at shutdown");
                    }
                }
            }
        }

        self.pool.shutdown().await;
        self.cache.clear();

        let stats = self.stats();
        info!(
            operations = stats.total_operations,
            cache_hit_rate = stats.cache_hit_rate,
            "Globals engine stopped"
        );
        self.set_state(EngineState::Stopped);
    }
}
