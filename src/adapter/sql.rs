// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relational adapter (SQLite / MySQL through the sqlx `Any` driver).
//!
//! One row per valued node. `node_key` is the concatenated subscript
//! collation key, so byte order of the key column is MUMPS collation and
//! every traversal is an index range scan:
//!
//! ```sql
//! CREATE TABLE globals_nodes (
//!   global_name VARCHAR(64),      -- "^DPT"
//!   node_key    VARBINARY(2048),  -- order-preserving subscript key
//!   subscripts  LONGTEXT,         -- JSON array of subscript strings
//!   node_value  LONGTEXT,
//!   PRIMARY KEY (global_name, node_key)
//! )
//! ```
//!
//! ```text
//! order(^X("A",""))  →  SELECT subscripts WHERE node_key > key(^X("A"))
//!                                            AND node_key < key(^X("A"))++FF
//!                       ORDER BY node_key LIMIT 1
//! ```
//!
//! Each adapter owns a single-connection sqlx pool so transactions stay on
//! one session. Native execution runs raw SQL and returns the first column
//! of the first row.
//!
//! ## sqlx Any Driver Quirks
//!
//! MySQL LONGTEXT comes back as bytes through `Any`, so text columns are
//! read as `String` first and `Vec<u8>` second.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::traits::{Capabilities, GlobalsAdapter, GlobalsError, Result, Transaction, VersionInfo};
use super::{AdapterKind, Connector};
use crate::global::{DataStatus, GlobalAddress, GlobalValue, Subscript};
use crate::resilience::retry::{retry, RetryConfig};
use crate::router::{collect_matches, XrefMatch, XrefQuery};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// Keep IN lists well under driver placeholder limits.
const GET_MANY_CHUNK: usize = 500;

const SQLITE_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS globals_nodes (
        global_name TEXT NOT NULL,
        node_key BLOB NOT NULL,
        subscripts TEXT NOT NULL,
        node_value TEXT NOT NULL,
        PRIMARY KEY (global_name, node_key)
    )
"#;

const MYSQL_SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS globals_nodes (
        global_name VARCHAR(64) NOT NULL,
        node_key VARBINARY(2048) NOT NULL,
        subscripts LONGTEXT NOT NULL,
        node_value LONGTEXT NOT NULL,
        PRIMARY KEY (global_name, node_key)
    )
"#;

fn map_sqlx_error(e: sqlx::Error) -> GlobalsError {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => GlobalsError::NotConnected(e.to_string()),
        other => GlobalsError::OperationFailed(other.to_string()),
    }
}

/// Read a text column as String (SQLite TEXT) or bytes (MySQL LONGTEXT).
fn text_column(row: &AnyRow, column: &str) -> Option<String> {
    row.try_get::<String, _>(column).ok().or_else(|| {
        row.try_get::<Vec<u8>, _>(column)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok())
    })
}

fn decode_subscripts(row: &AnyRow) -> Result<Vec<Subscript>> {
    let raw = text_column(row, "subscripts")
        .ok_or_else(|| GlobalsError::OperationFailed("row without subscripts".to_string()))?;
    let parts: Vec<String> = serde_json::from_str(&raw)
        .map_err(|e| GlobalsError::OperationFailed(format!("corrupt subscripts {:?}: {}", raw, e)))?;
    Ok(parts.into_iter().map(Subscript::parse).collect())
}

/// Opens single-connection pools against one database URL.
pub struct SqlConnector {
    url: String,
    is_sqlite: bool,
    schema_ready: OnceCell<()>,
}

impl SqlConnector {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let is_sqlite = url.starts_with("sqlite:");
        Self {
            url,
            is_sqlite,
            schema_ready: OnceCell::new(),
        }
    }

    async fn open_pool(&self) -> Result<AnyPool> {
        install_drivers();
        let url = self.url.as_str();
        retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(1)
                .min_connections(0)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(None)
                .max_lifetime(None)
                .connect(url)
                .await
                .map_err(map_sqlx_error)
        })
        .await
    }

    async fn init_schema(&self, pool: &AnyPool) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                let sql = if self.is_sqlite { SQLITE_SCHEMA } else { MYSQL_SCHEMA };
                sqlx::query(sql).execute(pool).await.map_err(map_sqlx_error)?;
                info!(sqlite = self.is_sqlite, "globals_nodes schema ready");
                Ok::<(), GlobalsError>(())
            })
            .await
            .map(|_| ())
    }

    /// WAL lets readers on other pooled connections proceed during writes.
    async fn enable_wal_mode(pool: &AnyPool) -> Result<()> {
        for pragma in [
            "PRAGMA busy_timeout = 5000",
            "PRAGMA journal_mode = WAL",
            "PRAGMA synchronous = NORMAL",
        ] {
            sqlx::query(pragma)
                .execute(pool)
                .await
                .map_err(map_sqlx_error)?;
        }
        Ok(())
    }

    async fn database_version(&self, pool: &AnyPool) -> String {
        let sql = if self.is_sqlite {
            "SELECT sqlite_version() AS v"
        } else {
            "SELECT VERSION() AS v"
        };
        match sqlx::query(sql).fetch_one(pool).await {
            Ok(row) => text_column(&row, "v").unwrap_or_else(|| "unknown".to_string()),
            Err(_) => "unknown".to_string(),
        }
    }
}

#[async_trait]
impl Connector for SqlConnector {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Sql
    }

    async fn connect(&self) -> Result<Arc<dyn GlobalsAdapter>> {
        let pool = self.open_pool().await?;
        if self.is_sqlite {
            Self::enable_wal_mode(&pool).await?;
        }
        self.init_schema(&pool).await?;
        let database_version = self.database_version(&pool).await;
        debug!(version = %database_version, "Opened SQL connection");

        Ok(Arc::new(SqlAdapter {
            pool,
            is_sqlite: self.is_sqlite,
            version: VersionInfo {
                database_version,
                ..VersionInfo::default()
            },
            next_tx: AtomicU64::new(1),
            active_tx: Mutex::new(None),
        }))
    }
}

/// One SQL session.
pub struct SqlAdapter {
    pool: AnyPool,
    is_sqlite: bool,
    version: VersionInfo,
    next_tx: AtomicU64,
    active_tx: Mutex<Option<u64>>,
}

impl SqlAdapter {
    fn upsert_sql(&self) -> &'static str {
        if self.is_sqlite {
            "INSERT INTO globals_nodes (global_name, node_key, subscripts, node_value) VALUES (?, ?, ?, ?) \
             ON CONFLICT(global_name, node_key) DO UPDATE SET node_value = excluded.node_value"
        } else {
            "INSERT INTO globals_nodes (global_name, node_key, subscripts, node_value) VALUES (?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE node_value = VALUES(node_value)"
        }
    }

    async fn exists_in(&self, name: &str, lo: Vec<u8>, hi: Vec<u8>) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 AS present FROM globals_nodes \
             WHERE global_name = ? AND node_key > ? AND node_key < ? LIMIT 1",
        )
        .bind(name)
        .bind(lo)
        .bind(hi)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(row.is_some())
    }

    async fn get_many_in(&self, name: &str, keys: &[Vec<u8>]) -> Result<HashMap<Vec<u8>, String>> {
        let placeholders = vec!["?"; keys.len()].join(", ");
        let sql = format!(
            "SELECT node_key, node_value FROM globals_nodes WHERE global_name = ? AND node_key IN ({})",
            placeholders
        );
        let mut query = sqlx::query(&sql).bind(name);
        for key in keys {
            query = query.bind(key.clone());
        }
        let rows = query.fetch_all(&self.pool).await.map_err(map_sqlx_error)?;

        let mut found = HashMap::with_capacity(rows.len());
        for row in rows {
            let key: Vec<u8> = row.try_get("node_key").map_err(map_sqlx_error)?;
            if let Some(value) = text_column(&row, "node_value") {
                found.insert(key, value);
            }
        }
        Ok(found)
    }
}

#[async_trait]
impl GlobalsAdapter for SqlAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Sql
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            transactions: true,
            locking: false,
            native_execution: true,
            concurrent_access: true,
            cross_references: true,
            unicode_support: true,
            bulk_query: true,
            native_batch: true,
        }
    }

    fn version_info(&self) -> VersionInfo {
        self.version.clone()
    }

    async fn get(&self, address: &GlobalAddress) -> Result<GlobalValue> {
        let row = sqlx::query(
            "SELECT node_value FROM globals_nodes WHERE global_name = ? AND node_key = ?",
        )
        .bind(address.name())
        .bind(address.collation_key())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(row.and_then(|r| text_column(&r, "node_value")).into())
    }

    async fn set(&self, address: &GlobalAddress, value: &str) -> Result<()> {
        address.ensure_node()?;
        if value.is_empty() {
            sqlx::query("DELETE FROM globals_nodes WHERE global_name = ? AND node_key = ?")
                .bind(address.name())
                .bind(address.collation_key())
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
            return Ok(());
        }

        let subscripts = serde_json::to_string(&address.subscript_strings())
            .map_err(|e| GlobalsError::OperationFailed(e.to_string()))?;
        sqlx::query(self.upsert_sql())
            .bind(address.name())
            .bind(address.collation_key())
            .bind(subscripts)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn order(&self, address: &GlobalAddress) -> Result<Option<Subscript>> {
        address.ensure_order_cursor()?;
        let Some(parent) = address.parent() else {
            return Ok(None);
        };
        let level = parent.depth();
        let lower = match address.last() {
            Some(start) if !start.is_empty() => address.descendant_upper_key(),
            _ => parent.collation_key(),
        };

        let row = sqlx::query(
            "SELECT subscripts FROM globals_nodes \
             WHERE global_name = ? AND node_key > ? AND node_key < ? \
             ORDER BY node_key LIMIT 1",
        )
        .bind(address.name())
        .bind(lower)
        .bind(parent.descendant_upper_key())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        match row {
            Some(row) => Ok(decode_subscripts(&row)?.into_iter().nth(level)),
            None => Ok(None),
        }
    }

    async fn data_status(&self, address: &GlobalAddress) -> Result<DataStatus> {
        let has_value = self.get(address).await?.is_defined();
        let has_descendants = self
            .exists_in(
                address.name(),
                address.collation_key(),
                address.descendant_upper_key(),
            )
            .await?;
        Ok(DataStatus::from_parts(has_value, has_descendants))
    }

    /// Grouped by global, one IN query per chunk.
    async fn get_many(&self, addresses: &[GlobalAddress]) -> Vec<Result<GlobalValue>> {
        let mut by_global: HashMap<&str, Vec<Vec<u8>>> = HashMap::new();
        for address in addresses {
            by_global
                .entry(address.name())
                .or_default()
                .push(address.collation_key());
        }

        let mut found: HashMap<&str, std::result::Result<HashMap<Vec<u8>, String>, GlobalsError>> =
            HashMap::new();
        for (name, mut keys) in by_global {
            keys.sort();
            keys.dedup();
            let mut values = HashMap::new();
            let mut outcome = Ok(());
            for chunk in keys.chunks(GET_MANY_CHUNK) {
                match self.get_many_in(name, chunk).await {
                    Ok(part) => values.extend(part),
                    Err(e) => {
                        outcome = Err(e);
                        break;
                    }
                }
            }
            found.insert(name, outcome.map(|_| values));
        }

        addresses
            .iter()
            .map(|address| match found.get(address.name()) {
                Some(Ok(values)) => Ok(values.get(&address.collation_key()).cloned().into()),
                Some(Err(e)) => Err(e.clone()),
                None => Ok(GlobalValue::undefined()),
            })
            .collect()
    }

    async fn scan_xref(&self, query: &XrefQuery) -> Result<Vec<XrefMatch>> {
        let (lo, hi) = query.key_range();
        let rows = sqlx::query(
            "SELECT subscripts FROM globals_nodes \
             WHERE global_name = ? AND node_key >= ? AND node_key < ? \
             ORDER BY node_key",
        )
        .bind(query.root.name())
        .bind(lo)
        .bind(hi)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let level = query.root.depth();
        let mut pairs = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut subscripts = decode_subscripts(row)?;
            if subscripts.len() < level + 2 {
                continue;
            }
            subscripts.truncate(level + 2);
            let id = subscripts.pop();
            let value = subscripts.pop();
            if let (Some(value), Some(id)) = (value, id) {
                pairs.push((value, id));
            }
        }
        Ok(collect_matches(query, pairs))
    }

    async fn execute_native(&self, code: &str) -> Result<GlobalValue> {
        let row = sqlx::query(code)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        let Some(row) = row else {
            return Ok(GlobalValue::undefined());
        };
        if row.columns().is_empty() {
            return Ok(GlobalValue::undefined());
        }
        let value = row
            .try_get::<String, _>(0)
            .ok()
            .or_else(|| row.try_get::<i64, _>(0).ok().map(|n| n.to_string()))
            .or_else(|| row.try_get::<f64, _>(0).ok().map(|n| n.to_string()))
            .or_else(|| {
                row.try_get::<Vec<u8>, _>(0)
                    .ok()
                    .and_then(|bytes| String::from_utf8(bytes).ok())
            });
        Ok(value.into())
    }

    async fn start_transaction(&self) -> Result<Transaction> {
        if self.active_tx.lock().is_some() {
            return Err(GlobalsError::OperationFailed(
                "a transaction is already active on this connection".to_string(),
            ));
        }
        sqlx::raw_sql("BEGIN")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        let id = self.next_tx.fetch_add(1, Ordering::SeqCst);
        *self.active_tx.lock() = Some(id);
        Ok(Transaction::new(id))
    }

    async fn commit(&self, tx: Transaction) -> Result<()> {
        self.finish(tx, "COMMIT").await
    }

    async fn rollback(&self, tx: Transaction) -> Result<()> {
        self.finish(tx, "ROLLBACK").await
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

impl SqlAdapter {
    async fn finish(&self, tx: Transaction, statement: &'static str) -> Result<()> {
        let Some(id) = tx.id() else {
            return Ok(());
        };
        {
            let mut active = self.active_tx.lock();
            if *active != Some(id) {
                return Err(GlobalsError::OperationFailed(format!(
                    "transaction {} is not active",
                    id
                )));
            }
            *active = None;
        }
        sqlx::raw_sql(statement)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        debug!(tx = id, statement, "Transaction finished");
        Ok(())
    }
}
