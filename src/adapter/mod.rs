// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backing-engine adapters.
//!
//! ```text
//! GlobalsConfig.adapter ──► AdapterKind ──► create_connector()
//!                                                 │
//!                                                 ▼
//!                          Connector::connect() ──► Arc<dyn GlobalsAdapter>
//!                                                   (one per pooled connection)
//! ```
//!
//! The set of adapter kinds is closed. Unknown names fail with
//! [`GlobalsError::Validation`] when the config is parsed, never later.

pub mod memory;
pub mod sql;
pub mod traits;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::GlobalsConfig;
pub use memory::{MemoryConnector, MemoryStore};
pub use sql::{SqlAdapter, SqlConnector};
pub use traits::{
    test_connection, Capabilities, ConnectionResult, ErrorClass, GlobalsAdapter, GlobalsError,
    Transaction, VersionInfo,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AdapterKind {
    /// In-process ordered store
    Memory,
    /// Relational store through sqlx (SQLite / MySQL)
    Sql,
}

impl AdapterKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Sql => "sql",
        }
    }
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdapterKind {
    type Err = GlobalsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(Self::Memory),
            "sql" | "sqlite" | "mysql" => Ok(Self::Sql),
            other => Err(GlobalsError::Validation(format!(
                "unknown adapter kind: {:?} (expected \"memory\" or \"sql\")",
                other
            ))),
        }
    }
}

/// Opens new adapter connections on demand. The pool owns one.
#[async_trait]
pub trait Connector: Send + Sync {
    fn kind(&self) -> AdapterKind;

    async fn connect(&self) -> Result<Arc<dyn GlobalsAdapter>, GlobalsError>;
}

/// Build the connector named by `config.adapter`.
pub fn create_connector(config: &GlobalsConfig) -> Result<Arc<dyn Connector>, GlobalsError> {
    match config.adapter_kind()? {
        AdapterKind::Memory => Ok(Arc::new(MemoryConnector::new())),
        AdapterKind::Sql => Ok(Arc::new(SqlConnector::new(config.sql_url()?))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parsing() {
        assert_eq!("memory".parse::<AdapterKind>().unwrap(), AdapterKind::Memory);
        assert_eq!("SQL".parse::<AdapterKind>().unwrap(), AdapterKind::Sql);
        assert_eq!(" sqlite ".parse::<AdapterKind>().unwrap(), AdapterKind::Sql);
        assert!(matches!(
            "iris".parse::<AdapterKind>(),
            Err(GlobalsError::Validation(_))
        ));
    }

    #[test]
    fn test_kind_display_round_trip() {
        for kind in [AdapterKind::Memory, AdapterKind::Sql] {
            assert_eq!(kind.to_string().parse::<AdapterKind>().unwrap(), kind);
        }
    }

    #[tokio::test]
    async fn test_create_memory_connector() {
        let connector = create_connector(&GlobalsConfig::default()).unwrap();
        assert_eq!(connector.kind(), AdapterKind::Memory);
        let adapter = connector.connect().await.unwrap();
        assert_eq!(adapter.kind(), AdapterKind::Memory);
    }

    #[test]
    fn test_create_rejects_unknown_kind() {
        let config = GlobalsConfig {
            adapter: "gtm".into(),
            ..Default::default()
        };
        assert!(matches!(create_connector(&config), Err(GlobalsError::Validation(_))));
    }

    #[test]
    fn test_create_sql_needs_location() {
        let config = GlobalsConfig {
            adapter: "sql".into(),
            ..Default::default()
        };
        assert!(matches!(create_connector(&config), Err(GlobalsError::Validation(_))));
    }
}
