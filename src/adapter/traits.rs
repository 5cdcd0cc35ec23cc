// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::AdapterKind;
use crate::global::{DataStatus, GlobalAddress, GlobalValue, Subscript};
use crate::router::{XrefMatch, XrefQuery};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GlobalsError {
    #[error("Not connected: {0}")]
    NotConnected(String),
    #[error("Operation failed: {0}")]
    OperationFailed(String),
    #[error("Timed out after {elapsed_ms}ms waiting for {what}")]
    Timeout { what: String, elapsed_ms: u64 },
    #[error("Capability not supported: {0}")]
    CapabilityUnsupported(String),
    #[error("Invalid request: {0}")]
    Validation(String),
}

/// How a caller should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Try later
    Transient,
    /// Cannot succeed as given
    Invalid,
    /// State may be inconsistent
    Indeterminate,
}

impl ErrorClass {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Invalid => "invalid",
            Self::Indeterminate => "indeterminate",
        }
    }
}

impl GlobalsError {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::NotConnected(_) | Self::Timeout { .. } => ErrorClass::Transient,
            Self::CapabilityUnsupported(_) | Self::Validation(_) => ErrorClass::Invalid,
            Self::OperationFailed(_) => ErrorClass::Indeterminate,
        }
    }

    /// Only transport-level failures are safe to retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotConnected(_) | Self::Timeout { .. })
    }

    pub(crate) fn timeout(what: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            what: what.into(),
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }
}

pub type Result<T> = std::result::Result<T, GlobalsError>;

/// Optional features an adapter declares. Fixed once the adapter is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub transactions: bool,
    pub locking: bool,
    pub native_execution: bool,
    pub concurrent_access: bool,
    pub cross_references: bool,
    pub unicode_support: bool,
    /// Implements [`GlobalsAdapter::scan_xref`].
    pub bulk_query: bool,
    /// Implements a grouped [`GlobalsAdapter::get_many`].
    pub native_batch: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            transactions: false,
            locking: false,
            native_execution: false,
            concurrent_access: true,
            cross_references: true,
            unicode_support: false,
            bulk_query: false,
            native_batch: false,
        }
    }
}

impl Capabilities {
    /// Everything on. Used by the in-memory adapter.
    #[must_use]
    pub fn full() -> Self {
        Self {
            transactions: true,
            locking: true,
            native_execution: true,
            concurrent_access: true,
            cross_references: true,
            unicode_support: true,
            bulk_query: true,
            native_batch: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub adapter_version: String,
    pub database_version: String,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            adapter_version: env!("CARGO_PKG_VERSION").to_string(),
            database_version: "unknown".to_string(),
        }
    }
}

/// Outcome of [`test_connection`].
#[derive(Debug, Clone)]
pub struct ConnectionResult {
    pub success: bool,
    pub message: String,
    pub timestamp: SystemTime,
}

/// Transaction handle. Consumed by `commit` or `rollback`, so it cannot be
/// finished twice. Handles from adapters without `transactions` are no-ops.
#[derive(Debug)]
pub struct Transaction {
    id: Option<u64>,
}

impl Transaction {
    #[must_use]
    pub fn noop() -> Self {
        Self { id: None }
    }

    #[must_use]
    pub fn new(id: u64) -> Self {
        Self { id: Some(id) }
    }

    #[must_use]
    pub fn id(&self) -> Option<u64> {
        self.id
    }

    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.id.is_none()
    }
}

/// Name of the global written by [`test_connection`] and read by the default
/// [`GlobalsAdapter::ping`].
pub const PROBE_GLOBAL: &str = "^ZZGLBPROBE";

/// One connection to a backing engine.
///
/// The four core operations are required. Everything else has a neutral
/// default; callers check [`Capabilities`] before relying on them.
#[async_trait]
pub trait GlobalsAdapter: Send + Sync {
    fn kind(&self) -> AdapterKind;
    fn capabilities(&self) -> Capabilities;

    fn version_info(&self) -> VersionInfo {
        VersionInfo::default()
    }

    /// Undefined when the node has no value.
    async fn get(&self, address: &GlobalAddress) -> Result<GlobalValue>;

    /// An empty `value` deletes the node's own value; descendants are kept.
    async fn set(&self, address: &GlobalAddress, value: &str) -> Result<()>;

    /// Next subscript after the address's last subscript at the same level.
    /// An empty last subscript starts before the first.
    async fn order(&self, address: &GlobalAddress) -> Result<Option<Subscript>>;

    async fn data_status(&self, address: &GlobalAddress) -> Result<DataStatus>;

    /// Results align with `addresses`. Default reads one by one.
    async fn get_many(&self, addresses: &[GlobalAddress]) -> Vec<Result<GlobalValue>> {
        let mut out = Vec::with_capacity(addresses.len());
        for address in addresses {
            out.push(self.get(address).await);
        }
        out
    }

    /// Bulk cross-reference scan used by the router.
    async fn scan_xref(&self, query: &XrefQuery) -> Result<Vec<XrefMatch>> {
        let _ = query;
        Err(GlobalsError::CapabilityUnsupported(format!(
            "{} adapter has no bulk query path",
            self.kind()
        )))
    }

    /// `true` when acquired within `timeout`. Adapters without locking
    /// report `true`: no locking needed.
    async fn lock(&self, address: &GlobalAddress, timeout: Duration) -> Result<bool> {
        let _ = (address, timeout);
        Ok(true)
    }

    async fn unlock(&self, address: &GlobalAddress) -> Result<()> {
        let _ = address;
        Ok(())
    }

    async fn execute_native(&self, code: &str) -> Result<GlobalValue> {
        let _ = code;
        Ok(GlobalValue::undefined())
    }

    async fn start_transaction(&self) -> Result<Transaction> {
        Ok(Transaction::noop())
    }

    async fn commit(&self, tx: Transaction) -> Result<()> {
        let _ = tx;
        Ok(())
    }

    async fn rollback(&self, tx: Transaction) -> Result<()> {
        let _ = tx;
        Ok(())
    }

    /// Cheap liveness round trip.
    async fn ping(&self) -> Result<()> {
        let probe = GlobalAddress::root(PROBE_GLOBAL)?;
        self.data_status(&probe).await.map(|_| ())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Set, read back and clear a probe node.
pub async fn test_connection(adapter: &dyn GlobalsAdapter) -> ConnectionResult {
    let (success, message) = match probe_round_trip(adapter).await {
        Ok(()) => (true, format!("{} connection OK", adapter.kind())),
        Err(e) => (false, e.to_string()),
    };
    ConnectionResult {
        success,
        message,
        timestamp: SystemTime::now(),
    }
}

async fn probe_round_trip(adapter: &dyn GlobalsAdapter) -> Result<()> {
    let probe = GlobalAddress::new(PROBE_GLOBAL, ["connection"])?;
    adapter.set(&probe, "test").await?;
    let read = adapter.get(&probe).await;
    adapter.set(&probe, "").await?;
    match read?.as_str() {
        Some("test") => Ok(()),
        other => Err(GlobalsError::OperationFailed(format!(
            "probe read back {:?}",
            other
        ))),
    }
}
