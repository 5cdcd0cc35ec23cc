// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Globals Engine
//!
//! Async access to MUMPS-style globals: sparse, ordered, hierarchical
//! key-value trees addressed as `^NAME(sub1,sub2,...)`.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      GlobalsEngine                          │
//! │  • get / set / kill / order / data_status / children       │
//! │  • batch_get, search, lock, transactions, native code      │
//! └─────────────────────────────────────────────────────────────┘
//!          │ reads                │ many reads        │ searches
//!          ▼                      ▼                   ▼
//! ┌─────────────────┐   ┌──────────────────┐   ┌──────────────────┐
//! │  GlobalCache    │◄──│  BatchProcessor  │   │   QueryRouter    │
//! │  LRU + TTL      │   │  dedupe, chunk,  │   │  bulk scan vs    │
//! │  fill tickets   │   │  bounded fan-out │   │  $ORDER walk     │
//! └─────────────────┘   └──────────────────┘   └──────────────────┘
//!          │ miss                 │                   │
//!          ▼                      ▼                   ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ConnectionPool                          │
//! │  • semaphore-bounded, lazy, health-checked                 │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  dyn GlobalsAdapter                         │
//! │  • memory: in-process ordered store                        │
//! │  • sql: SQLite / MySQL through sqlx                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use globals_engine::{GlobalsConfig, GlobalsEngine, GlobalAddress, Subscript};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), globals_engine::GlobalsError> {
//!     let config = GlobalsConfig::from_json(r#"{"adapter": "memory", "cacheMaxSize": 500}"#)?;
//!     let engine = GlobalsEngine::new(config)?;
//!     engine.start().await?;
//!
//!     let name = GlobalAddress::new("DPT", [Subscript::from(1), Subscript::from(0)])?;
//!     engine.set(&name, "DOE,JOHN").await?;
//!     println!("{}", engine.get(&name).await?);
//!
//!     let mut cursor: GlobalAddress = "^DPT(\"\")".parse()?;
//!     while let Some(next) = engine.order(&cursor).await? {
//!         println!("patient {}", next);
//!         cursor = cursor.sibling(next);
//!     }
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Collation
//!
//! Canonical numbers sort before strings and compare numerically; strings
//! compare by bytes. [`Subscript`] implements that order and
//! [`Subscript::collation_key`] encodes it as bytes for range scans.
//!
//! ## Modules
//!
//! - [`coordinator`]: the [`GlobalsEngine`] façade and its lifecycle
//! - [`global`]: addresses, subscripts, values, `$DATA` codes
//! - [`adapter`]: the [`GlobalsAdapter`] contract and its implementations
//! - [`pool`]: bounded connection pool
//! - [`cache`]: LRU read cache with fill tickets
//! - [`batching`]: batched reads
//! - [`router`]: cross-reference search routing
//! - [`resilience`]: retry with backoff
//! - [`config`]: [`GlobalsConfig`]
//! - [`metrics`]: `metrics` crate instrumentation

pub mod adapter;
pub mod batching;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod global;
pub mod metrics;
pub mod pool;
pub mod resilience;
pub mod router;

pub use adapter::{
    create_connector, AdapterKind, Capabilities, ConnectionResult, Connector, ErrorClass,
    GlobalsAdapter, GlobalsError, MemoryConnector, MemoryStore, SqlConnector, Transaction,
    VersionInfo,
};
pub use batching::{BatchOutcome, BatchProcessor};
pub use cache::{CacheStats, GlobalCache};
pub use config::GlobalsConfig;
pub use coordinator::{EngineState, GlobalsEngine, GlobalsTransaction, HealthCheck, PerformanceReport};
pub use global::{CanonicalNumber, DataStatus, GlobalAddress, GlobalValue, Subscript};
pub use metrics::LatencyTimer;
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use resilience::RetryConfig;
pub use router::{QueryRouter, Route, RoutePreference, XrefMatch, XrefQuery, BULK_THRESHOLD};
