// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Predictive loading: after a miss on a node, warm the cache with its first
//! few children. Runs detached; nothing here reaches the caller.
//!
//! Prefetch only ever borrows an idle pool slot, one child at a time. When
//! every connection is busy it gives up rather than queue behind callers.

use std::sync::Arc;

use tokio::sync::OwnedSemaphorePermit;
use tokio::task::JoinHandle;
use tracing::debug;

use super::GlobalCache;
use crate::adapter::traits::{GlobalsAdapter, GlobalsError, Result};
use crate::global::{GlobalAddress, Subscript};
use crate::pool::ConnectionPool;

/// `gate` is held until the walk finishes, so callers can cap how many
/// walks run at once.
pub(crate) fn spawn_prefetch(
    pool: ConnectionPool,
    cache: Arc<GlobalCache>,
    parent: GlobalAddress,
    width: usize,
    gate: OwnedSemaphorePermit,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let _gate = gate;
        match prefetch_children(&pool, &cache, &parent, width).await {
            Ok(loaded) => {
                crate::metrics::record_prefetch(loaded);
                if loaded > 0 {
                    debug!(parent = %parent, loaded, "Prefetched children");
                }
            }
            Err(e) => debug!(parent = %parent, error = %e, "Prefetch abandoned"),
        }
    })
}

enum Step {
    Loaded(GlobalAddress),
    Skipped(GlobalAddress),
    Exhausted,
    Busy,
}

/// Visits at most `width` children, cached or not.
async fn prefetch_children(
    pool: &ConnectionPool,
    cache: &GlobalCache,
    parent: &GlobalAddress,
    width: usize,
) -> Result<usize> {
    let mut cursor = parent.child(Subscript::empty());
    let mut loaded = 0;
    for _ in 0..width {
        match prefetch_next(pool, cache, &cursor).await? {
            Step::Loaded(child) => {
                loaded += 1;
                cursor = child;
            }
            Step::Skipped(child) => cursor = child,
            Step::Exhausted => break,
            Step::Busy => {
                debug!(parent = %parent, "Pool busy, stopping prefetch");
                break;
            }
        }
    }
    Ok(loaded)
}

async fn prefetch_next(pool: &ConnectionPool, cache: &GlobalCache, cursor: &GlobalAddress) -> Result<Step> {
    let Some(mut conn) = pool.try_acquire().await? else {
        return Ok(Step::Busy);
    };
    let result = load_next(conn.adapter(), cache, cursor).await;
    if let Err(GlobalsError::NotConnected(_)) = &result {
        conn.mark_broken();
    }
    result
}

async fn load_next(adapter: &dyn GlobalsAdapter, cache: &GlobalCache, cursor: &GlobalAddress) -> Result<Step> {
    let Some(next) = adapter.order(cursor).await? else {
        return Ok(Step::Exhausted);
    };
    let child = cursor.sibling(next);
    if cache.contains(&child) {
        return Ok(Step::Skipped(child));
    }
    let ticket = cache.begin_fill();
    let value = adapter.get(&child).await?;
    if cache.complete_fill(ticket, child.clone(), value) {
        Ok(Step::Loaded(child))
    } else {
        Ok(Step::Skipped(child))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::Semaphore;

    use super::*;
    use crate::adapter::MemoryConnector;

    fn gate() -> OwnedSemaphorePermit {
        Arc::new(Semaphore::new(1)).try_acquire_owned().unwrap()
    }

    async fn seeded_pool(size: usize, children: usize) -> ConnectionPool {
        let pool = ConnectionPool::new(Arc::new(MemoryConnector::new()), size, false);
        let conn = pool.acquire(Duration::from_secs(1)).await.unwrap();
        for i in 1..=children {
            let address: GlobalAddress = format!("^P(1,{})", i).parse().unwrap();
            conn.adapter().set(&address, &format!("v{}", i)).await.unwrap();
        }
        pool
    }

    #[tokio::test]
    async fn test_prefetch_loads_first_children() {
        let pool = seeded_pool(2, 5).await;

        let cache = Arc::new(GlobalCache::new(100, None));
        let parent: GlobalAddress = "^P(1)".parse().unwrap();
        spawn_prefetch(pool, cache.clone(), parent, 3, gate()).await.unwrap();

        assert_eq!(cache.len(), 3);
        assert!(cache.contains(&"^P(1,1)".parse().unwrap()));
        assert!(cache.contains(&"^P(1,3)".parse().unwrap()));
        assert!(!cache.contains(&"^P(1,4)".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_cached_children_count_toward_width() {
        let pool = seeded_pool(1, 5).await;

        let cache = Arc::new(GlobalCache::new(100, None));
        cache.put("^P(1,1)".parse().unwrap(), "v1".into());
        cache.put("^P(1,2)".parse().unwrap(), "v2".into());
        let parent: GlobalAddress = "^P(1)".parse().unwrap();
        spawn_prefetch(pool, cache.clone(), parent, 3, gate()).await.unwrap();

        assert_eq!(cache.len(), 3);
        assert!(cache.contains(&"^P(1,3)".parse().unwrap()));
        assert!(!cache.contains(&"^P(1,4)".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_prefetch_yields_to_busy_pool() {
        let pool = seeded_pool(1, 5).await;
        let held = pool.acquire(Duration::from_secs(1)).await.unwrap();

        let cache = Arc::new(GlobalCache::new(100, None));
        let parent: GlobalAddress = "^P(1)".parse().unwrap();
        spawn_prefetch(pool.clone(), cache.clone(), parent, 3, gate())
            .await
            .unwrap();

        assert!(cache.is_empty());
        assert_eq!(pool.stats().timeouts, 0);
        drop(held);
    }

    #[tokio::test]
    async fn test_prefetch_failure_is_silent() {
        let connector = Arc::new(MemoryConnector::new());
        let store = connector.store();
        let pool = ConnectionPool::new(connector, 1, false);
        store.set_online(false);

        let cache = Arc::new(GlobalCache::new(10, None));
        let parent: GlobalAddress = "^P(1)".parse().unwrap();
        spawn_prefetch(pool, cache.clone(), parent, 3, gate()).await.unwrap();
        assert!(cache.is_empty());
    }
}
