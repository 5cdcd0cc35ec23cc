// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batched reads.
//!
//! ```text
//! addresses ──► cache hits ──────────────────────────────► values[i]
//!      │
//!      └─ misses (deduped) ─► units of work ─► JoinSet (≤ parallelism)
//!                                 │
//!               native_batch: one get_many per batch_size chunk
//!               otherwise:    one get per address
//!                                 │
//!                                 ▼
//!                     cache.complete_fill as each unit lands
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use crate::adapter::traits::{Capabilities, GlobalsError, Result};
use crate::cache::{FillTicket, GlobalCache};
use crate::config::GlobalsConfig;
use crate::global::{GlobalAddress, GlobalValue};
use crate::pool::ConnectionPool;

#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Addresses per grouped adapter call
    pub batch_size: usize,
    /// Units of work in flight at once
    pub parallelism: usize,
    pub acquire_timeout: Duration,
}

impl BatchConfig {
    #[must_use]
    pub fn from_config(config: &GlobalsConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            parallelism: config.effective_parallelism(),
            acquire_timeout: config.acquire_timeout(),
        }
    }
}

/// Result of one [`BatchProcessor::submit`]. `values` lines up with the
/// submitted addresses, duplicates included.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchOutcome {
    pub values: Vec<GlobalValue>,
    pub total: usize,
    pub from_cache: usize,
    /// Distinct addresses fetched from the adapter
    pub fetched: usize,
    /// Positions that failed and hold undefined
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub batches: u64,
    pub addresses: u64,
    pub failed: u64,
}

type UnitResult = (usize, Vec<Result<GlobalValue>>);

pub struct BatchProcessor {
    config: BatchConfig,
    pool: ConnectionPool,
    cache: Arc<GlobalCache>,
    batches: AtomicU64,
    addresses: AtomicU64,
    failed: AtomicU64,
}

impl BatchProcessor {
    #[must_use]
    pub fn new(config: BatchConfig, pool: ConnectionPool, cache: Arc<GlobalCache>) -> Self {
        Self {
            config,
            pool,
            cache,
            batches: AtomicU64::new(0),
            addresses: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Read many addresses at once.
    ///
    /// Member failures leave undefined in their slot. The call only fails
    /// when every member failed, and then returns the last error seen.
    #[instrument(skip_all, fields(count = addresses.len()))]
    pub async fn submit(&self, addresses: &[GlobalAddress], capabilities: &Capabilities) -> Result<BatchOutcome> {
        let total = addresses.len();
        let mut values: Vec<Option<GlobalValue>> = vec![None; total];
        let mut outcome = BatchOutcome {
            total,
            ..Default::default()
        };
        if total == 0 {
            return Ok(outcome);
        }

        // Distinct misses in first-seen order, each with every slot it fills.
        let mut misses: Vec<GlobalAddress> = Vec::new();
        let mut slots: HashMap<GlobalAddress, Vec<usize>> = HashMap::new();
        for (i, address) in addresses.iter().enumerate() {
            if let Some(value) = self.cache.get(address) {
                values[i] = Some(value);
                outcome.from_cache += 1;
                continue;
            }
            slots
                .entry(address.clone())
                .or_insert_with(|| {
                    misses.push(address.clone());
                    Vec::new()
                })
                .push(i);
        }

        let units: Vec<Vec<GlobalAddress>> = if capabilities.native_batch {
            misses.chunks(self.config.batch_size).map(<[_]>::to_vec).collect()
        } else {
            misses.iter().map(|a| vec![a.clone()]).collect()
        };
        debug!(
            cached = outcome.from_cache,
            misses = misses.len(),
            units = units.len(),
            grouped = capabilities.native_batch,
            "Dispatching batch"
        );

        let ticket = self.cache.begin_fill();
        let mut last_error: Option<GlobalsError> = None;
        let results = self.run_units(&units, ticket).await;

        for (unit, result) in units.iter().zip(results) {
            for (address, fetched) in unit.iter().zip(result) {
                let positions = slots.get(address).map(Vec::as_slice).unwrap_or_default();
                match fetched {
                    Ok(value) => {
                        outcome.fetched += 1;
                        for &i in positions {
                            values[i] = Some(value.clone());
                        }
                    }
                    Err(e) => {
                        outcome.failed += positions.len();
                        last_error = Some(e);
                    }
                }
            }
        }

        self.batches.fetch_add(1, Ordering::Relaxed);
        self.addresses.fetch_add(total as u64, Ordering::Relaxed);
        self.failed.fetch_add(outcome.failed as u64, Ordering::Relaxed);
        crate::metrics::record_batch(total, outcome.failed);

        if outcome.failed == total {
            let error = last_error
                .unwrap_or_else(|| GlobalsError::OperationFailed("batch failed".to_string()));
            warn!(count = total, error = %error, "Every batch member failed");
            return Err(error);
        }
        if outcome.failed > 0 {
            warn!(failed = outcome.failed, count = total, "Batch completed with failures");
        }

        outcome.values = values
            .into_iter()
            .map(Option::unwrap_or_default)
            .collect();
        Ok(outcome)
    }

    /// Run every unit, at most `parallelism` at once. The returned vector is
    /// indexed like `units`; each entry has one result per address.
    async fn run_units(&self, units: &[Vec<GlobalAddress>], ticket: FillTicket) -> Vec<Vec<Result<GlobalValue>>> {
        let limiter = Arc::new(Semaphore::new(self.config.parallelism.max(1)));
        let mut tasks: JoinSet<UnitResult> = JoinSet::new();

        for (index, unit) in units.iter().enumerate() {
            let unit = unit.clone();
            let limiter = Arc::clone(&limiter);
            let pool = self.pool.clone();
            let cache = Arc::clone(&self.cache);
            let timeout = self.config.acquire_timeout;
            tasks.spawn(async move {
                let _permit = match limiter.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        let err = GlobalsError::OperationFailed("batch cancelled".to_string());
                        return (index, vec![Err(err); unit.len()]);
                    }
                };
                let results = fetch_unit(&pool, &unit, timeout).await;
                for (address, result) in unit.iter().zip(&results) {
                    if let Ok(value) = result {
                        cache.complete_fill(ticket, address.clone(), value.clone());
                    }
                }
                (index, results)
            });
        }

        let mut collected: Vec<Option<Vec<Result<GlobalValue>>>> = vec![None; units.len()];
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, results)) => collected[index] = Some(results),
                Err(e) => warn!(error = %e, "Batch task aborted"),
            }
        }

        collected
            .into_iter()
            .zip(units)
            .map(|(results, unit)| {
                results.unwrap_or_else(|| {
                    let err = GlobalsError::OperationFailed("batch task aborted".to_string());
                    vec![Err(err); unit.len()]
                })
            })
            .collect()
    }

    #[must_use]
    pub fn stats(&self) -> BatchStats {
        BatchStats {
            batches: self.batches.load(Ordering::Relaxed),
            addresses: self.addresses.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

async fn fetch_unit(pool: &ConnectionPool, unit: &[GlobalAddress], timeout: Duration) -> Vec<Result<GlobalValue>> {
    let mut conn = match pool.acquire(timeout).await {
        Ok(conn) => conn,
        Err(e) => return vec![Err(e); unit.len()],
    };
    let results = match unit {
        [single] => vec![conn.adapter().get(single).await],
        _ => conn.adapter().get_many(unit).await,
    };
    if results
        .iter()
        .any(|r| matches!(r, Err(GlobalsError::NotConnected(_))))
    {
        conn.mark_broken();
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::MemoryConnector;

    async fn setup(native_batch: bool) -> (Arc<MemoryConnector>, BatchProcessor, Capabilities) {
        let capabilities = Capabilities {
            native_batch,
            ..Capabilities::full()
        };
        let connector = Arc::new(MemoryConnector::new().with_capabilities(capabilities));
        let pool = ConnectionPool::new(connector.clone(), 4, false);
        {
            let conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
            for i in 1..=5 {
                let address: GlobalAddress = format!("^B({})", i).parse().unwrap();
                conn.adapter().set(&address, &format!("v{}", i)).await.unwrap();
            }
        }
        let config = BatchConfig {
            batch_size: 2,
            parallelism: 3,
            acquire_timeout: Duration::from_secs(1),
        };
        let processor = BatchProcessor::new(config, pool, Arc::new(GlobalCache::new(100, None)));
        (connector, processor, capabilities)
    }

    fn addrs(list: &[&str]) -> Vec<GlobalAddress> {
        list.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[tokio::test]
    async fn test_alignment_with_duplicates() {
        for native in [true, false] {
            let (_, processor, caps) = setup(native).await;
            let input = addrs(&["^B(3)", "^B(1)", "^B(3)", "^B(9)", "^B(2)"]);
            let outcome = processor.submit(&input, &caps).await.unwrap();

            let got: Vec<Option<&str>> = outcome.values.iter().map(GlobalValue::as_str).collect();
            assert_eq!(got, vec![Some("v3"), Some("v1"), Some("v3"), None, Some("v2")]);
            assert_eq!(outcome.fetched, 4);
            assert_eq!(outcome.failed, 0);
        }
    }

    #[tokio::test]
    async fn test_second_submit_served_from_cache() {
        let (_, processor, caps) = setup(true).await;
        let input = addrs(&["^B(1)", "^B(2)"]);
        processor.submit(&input, &caps).await.unwrap();
        let outcome = processor.submit(&input, &caps).await.unwrap();
        assert_eq!(outcome.from_cache, 2);
        assert_eq!(outcome.fetched, 0);
        assert_eq!(processor.stats().batches, 2);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let (_, processor, caps) = setup(false).await;
        let outcome = processor.submit(&[], &caps).await.unwrap();
        assert!(outcome.values.is_empty());
        assert_eq!(outcome.total, 0);
    }

    #[tokio::test]
    async fn test_all_failed_is_error() {
        let (connector, processor, caps) = setup(false).await;
        connector.store().set_online(false);
        let err = processor
            .submit(&addrs(&["^B(1)", "^B(2)"]), &caps)
            .await
            .unwrap_err();
        assert!(matches!(err, GlobalsError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_cached_members() {
        let (connector, processor, caps) = setup(false).await;
        processor.submit(&addrs(&["^B(1)"]), &caps).await.unwrap();
        connector.store().set_online(false);

        let outcome = processor
            .submit(&addrs(&["^B(1)", "^B(2)"]), &caps)
            .await
            .unwrap();
        assert_eq!(outcome.values[0].as_str(), Some("v1"));
        assert!(!outcome.values[1].is_defined());
        assert_eq!(outcome.failed, 1);
    }
}
