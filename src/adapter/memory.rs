// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process ordered globals store.
//!
//! Each global is a `BTreeMap` keyed by the subscript collation key, so
//! `order` and cross-reference scans are range queries. All connections from
//! one [`MemoryConnector`] share the same [`MemoryStore`].
//!
//! Native execution understands a small command set:
//!
//! ```text
//! SET ^X("A",1)="value"     S is accepted for SET
//! KILL ^X("A")              node and all descendants; K is accepted
//! WRITE ^X("A",1)           returns the value; W and $GET(...) are accepted
//! ```

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::traits::{Capabilities, GlobalsAdapter, GlobalsError, Result, Transaction, VersionInfo};
use super::{AdapterKind, Connector};
use crate::global::{DataStatus, GlobalAddress, GlobalValue, Subscript};
use crate::router::{collect_matches, XrefMatch, XrefQuery};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(5);

type Tree = BTreeMap<Vec<u8>, StoredNode>;

#[derive(Debug, Clone)]
struct StoredNode {
    subscripts: Vec<Subscript>,
    value: String,
}

#[derive(Debug)]
struct LockEntry {
    address: GlobalAddress,
    owner: u64,
}

#[derive(Debug)]
struct TxJournal {
    tx_id: u64,
    owner: u64,
    undo: Vec<(GlobalAddress, Option<String>)>,
}

/// Shared ordered storage behind every memory connection.
#[derive(Debug)]
pub struct MemoryStore {
    globals: DashMap<String, Tree>,
    locks: Mutex<Vec<LockEntry>>,
    journal: Mutex<Option<TxJournal>>,
    next_tx: AtomicU64,
    /// Connection ids, unique across every connector on this store.
    next_owner: AtomicU64,
    online: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            globals: DashMap::new(),
            locks: Mutex::new(Vec::new()),
            journal: Mutex::new(None),
            next_tx: AtomicU64::new(1),
            next_owner: AtomicU64::new(1),
            online: AtomicBool::new(true),
        }
    }

    /// Total valued nodes across all globals
    #[must_use]
    pub fn len(&self) -> usize {
        self.globals.iter().map(|g| g.value().len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.globals.clear();
    }

    /// Simulate the engine going away. While offline every call fails with
    /// `NotConnected`.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn ensure_online(&self) -> Result<()> {
        if self.is_online() {
            Ok(())
        } else {
            Err(GlobalsError::NotConnected("memory store is offline".to_string()))
        }
    }

    fn read(&self, address: &GlobalAddress) -> Option<String> {
        self.globals
            .get(address.name())
            .and_then(|tree| tree.get(&address.collation_key()).map(|n| n.value.clone()))
    }

    /// Write without journaling. Returns the previous value.
    fn write_raw(&self, address: &GlobalAddress, value: Option<&str>) -> Option<String> {
        let key = address.collation_key();
        match value {
            Some(v) => {
                let mut tree = self.globals.entry(address.name().to_string()).or_default();
                tree.insert(
                    key,
                    StoredNode {
                        subscripts: address.subscripts().to_vec(),
                        value: v.to_string(),
                    },
                )
                .map(|old| old.value)
            }
            None => {
                let previous = self
                    .globals
                    .get_mut(address.name())
                    .and_then(|mut tree| tree.remove(&key))
                    .map(|old| old.value);
                self.globals.remove_if(address.name(), |_, tree| tree.is_empty());
                previous
            }
        }
    }

    fn write(&self, owner: u64, address: &GlobalAddress, value: Option<&str>) {
        let previous = self.write_raw(address, value);
        if let Some(journal) = self.journal.lock().as_mut() {
            if journal.owner == owner {
                journal.undo.push((address.clone(), previous));
            }
        }
    }

    /// Remove a node and everything below it.
    fn kill(&self, owner: u64, address: &GlobalAddress) {
        let lo = address.collation_key();
        let hi = address.descendant_upper_key();
        let doomed: Vec<GlobalAddress> = match self.globals.get(address.name()) {
            Some(tree) => tree
                .range::<[u8], _>((Bound::Included(lo.as_slice()), Bound::Excluded(hi.as_slice())))
                .map(|(_, node)| address.with_subscripts(node.subscripts.clone()))
                .collect(),
            None => return,
        };
        for node in doomed {
            self.write(owner, &node, None);
        }
    }

    fn order(&self, address: &GlobalAddress) -> Option<Subscript> {
        let parent = address.parent()?;
        let level = parent.depth();
        let upper = parent.descendant_upper_key();
        let lower = match address.last() {
            Some(start) if !start.is_empty() => address.descendant_upper_key(),
            _ => parent.collation_key(),
        };

        let tree = self.globals.get(address.name())?;
        let found = tree
            .range::<[u8], _>((Bound::Excluded(lower.as_slice()), Bound::Excluded(upper.as_slice())))
            .next()
            .and_then(|(_, node)| node.subscripts.get(level).cloned());
        found
    }

    fn data_status(&self, address: &GlobalAddress) -> DataStatus {
        let Some(tree) = self.globals.get(address.name()) else {
            return DataStatus::Undefined;
        };
        let key = address.collation_key();
        let upper = address.descendant_upper_key();
        let has_value = tree.contains_key(&key);
        let has_descendants = tree
            .range::<[u8], _>((Bound::Excluded(key.as_slice()), Bound::Excluded(upper.as_slice())))
            .next()
            .is_some();
        DataStatus::from_parts(has_value, has_descendants)
    }

    fn scan_xref(&self, query: &XrefQuery) -> Vec<XrefMatch> {
        let Some(tree) = self.globals.get(query.root.name()) else {
            return Vec::new();
        };
        let (lo, hi) = query.key_range();
        let level = query.root.depth();
        let rows = tree
            .range::<[u8], _>((Bound::Included(lo.as_slice()), Bound::Excluded(hi.as_slice())))
            .filter(|(_, node)| node.subscripts.len() >= level + 2)
            .map(|(_, node)| (node.subscripts[level].clone(), node.subscripts[level + 1].clone()));
        collect_matches(query, rows)
    }

    fn try_lock(&self, owner: u64, address: &GlobalAddress) -> bool {
        let mut locks = self.locks.lock();
        let conflict = locks.iter().any(|held| {
            held.owner != owner
                && (held.address == *address
                    || held.address.is_ancestor_of(address)
                    || address.is_ancestor_of(&held.address))
        });
        if !conflict {
            locks.push(LockEntry {
                address: address.clone(),
                owner,
            });
        }
        !conflict
    }

    fn unlock(&self, owner: u64, address: &GlobalAddress) {
        let mut locks = self.locks.lock();
        if let Some(pos) = locks
            .iter()
            .rposition(|held| held.owner == owner && held.address == *address)
        {
            locks.remove(pos);
        }
    }

    fn release_all(&self, owner: u64) {
        self.locks.lock().retain(|held| held.owner != owner);
    }

    fn replay_undo(&self, undo: Vec<(GlobalAddress, Option<String>)>) {
        for (address, previous) in undo.into_iter().rev() {
            self.write_raw(&address, previous.as_deref());
        }
    }

    /// A connection went away: drop its locks and roll back any transaction
    /// it left open.
    fn end_session(&self, owner: u64) {
        self.release_all(owner);
        let abandoned = {
            let mut journal = self.journal.lock();
            if journal.as_ref().is_some_and(|active| active.owner == owner) {
                journal.take()
            } else {
                None
            }
        };
        if let Some(active) = abandoned {
            debug!(tx = active.tx_id, connection = owner, "Rolling back abandoned transaction");
            self.replay_undo(active.undo);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Opens connections onto one shared [`MemoryStore`].
pub struct MemoryConnector {
    store: Arc<MemoryStore>,
    capabilities: Capabilities,
    next_conn: AtomicU64,
}

impl MemoryConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    #[must_use]
    pub fn with_store(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            capabilities: Capabilities::full(),
            next_conn: AtomicU64::new(0),
        }
    }

    /// Declare a narrower feature set, e.g. to model an engine without
    /// transactions or a bulk path.
    #[must_use]
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    #[must_use]
    pub fn store(&self) -> Arc<MemoryStore> {
        Arc::clone(&self.store)
    }

    /// Connections opened so far
    #[must_use]
    pub fn connections_opened(&self) -> u64 {
        self.next_conn.load(Ordering::SeqCst)
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Memory
    }

    async fn connect(&self) -> Result<Arc<dyn GlobalsAdapter>> {
        self.store.ensure_online()?;
        self.next_conn.fetch_add(1, Ordering::SeqCst);
        let id = self.store.next_owner.fetch_add(1, Ordering::SeqCst);
        debug!(connection = id, "Opened memory connection");
        Ok(Arc::new(MemoryAdapter {
            store: Arc::clone(&self.store),
            capabilities: self.capabilities,
            id,
        }))
    }
}

/// One connection onto a [`MemoryStore`].
pub struct MemoryAdapter {
    store: Arc<MemoryStore>,
    capabilities: Capabilities,
    id: u64,
}

impl MemoryAdapter {
    fn require(&self, enabled: bool, what: &str) -> Result<()> {
        if enabled {
            Ok(())
        } else {
            Err(GlobalsError::CapabilityUnsupported(format!(
                "memory adapter configured without {}",
                what
            )))
        }
    }
}

#[async_trait]
impl GlobalsAdapter for MemoryAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Memory
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    fn version_info(&self) -> VersionInfo {
        VersionInfo {
            database_version: "memory".to_string(),
            ..VersionInfo::default()
        }
    }

    async fn get(&self, address: &GlobalAddress) -> Result<GlobalValue> {
        self.store.ensure_online()?;
        Ok(self.store.read(address).into())
    }

    async fn set(&self, address: &GlobalAddress, value: &str) -> Result<()> {
        self.store.ensure_online()?;
        address.ensure_node()?;
        let value = (!value.is_empty()).then_some(value);
        self.store.write(self.id, address, value);
        Ok(())
    }

    async fn order(&self, address: &GlobalAddress) -> Result<Option<Subscript>> {
        self.store.ensure_online()?;
        address.ensure_order_cursor()?;
        Ok(self.store.order(address))
    }

    async fn data_status(&self, address: &GlobalAddress) -> Result<DataStatus> {
        self.store.ensure_online()?;
        Ok(self.store.data_status(address))
    }

    async fn get_many(&self, addresses: &[GlobalAddress]) -> Vec<Result<GlobalValue>> {
        if let Err(e) = self.store.ensure_online() {
            return addresses.iter().map(|_| Err(e.clone())).collect();
        }
        addresses
            .iter()
            .map(|addr| Ok(self.store.read(addr).into()))
            .collect()
    }

    async fn scan_xref(&self, query: &XrefQuery) -> Result<Vec<XrefMatch>> {
        self.require(self.capabilities.bulk_query, "bulk query")?;
        self.store.ensure_online()?;
        Ok(self.store.scan_xref(query))
    }

    async fn lock(&self, address: &GlobalAddress, timeout: Duration) -> Result<bool> {
        if !self.capabilities.locking {
            return Ok(true);
        }
        let deadline = Instant::now() + timeout;
        loop {
            self.store.ensure_online()?;
            if self.store.try_lock(self.id, address) {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    async fn unlock(&self, address: &GlobalAddress) -> Result<()> {
        self.store.unlock(self.id, address);
        Ok(())
    }

    async fn execute_native(&self, code: &str) -> Result<GlobalValue> {
        self.require(self.capabilities.native_execution, "native execution")?;
        self.store.ensure_online()?;
        match NativeCommand::parse(code)? {
            NativeCommand::Set(address, value) => {
                address.ensure_node()?;
                let value = (!value.is_empty()).then_some(value.as_str());
                self.store.write(self.id, &address, value);
                Ok(GlobalValue::undefined())
            }
            NativeCommand::Kill(address) => {
                self.store.kill(self.id, &address);
                Ok(GlobalValue::undefined())
            }
            NativeCommand::Write(address) => Ok(self.store.read(&address).into()),
        }
    }

    async fn start_transaction(&self) -> Result<Transaction> {
        if !self.capabilities.transactions {
            return Ok(Transaction::noop());
        }
        self.store.ensure_online()?;
        let mut journal = self.store.journal.lock();
        if journal.is_some() {
            return Err(GlobalsError::OperationFailed(
                "a transaction is already active on this store".to_string(),
            ));
        }
        let tx_id = self.store.next_tx.fetch_add(1, Ordering::SeqCst);
        *journal = Some(TxJournal {
            tx_id,
            owner: self.id,
            undo: Vec::new(),
        });
        debug!(tx = tx_id, connection = self.id, "Transaction started");
        Ok(Transaction::new(tx_id))
    }

    async fn commit(&self, tx: Transaction) -> Result<()> {
        let Some(tx_id) = tx.id() else {
            return Ok(());
        };
        let mut journal = self.store.journal.lock();
        match journal.as_ref() {
            Some(active) if active.tx_id == tx_id => {
                *journal = None;
                Ok(())
            }
            _ => Err(GlobalsError::OperationFailed(format!(
                "transaction {} is not active",
                tx_id
            ))),
        }
    }

    async fn rollback(&self, tx: Transaction) -> Result<()> {
        let Some(tx_id) = tx.id() else {
            return Ok(());
        };
        let undo = {
            let mut journal = self.store.journal.lock();
            match journal.take() {
                Some(active) if active.tx_id == tx_id => active.undo,
                other => {
                    *journal = other;
                    return Err(GlobalsError::OperationFailed(format!(
                        "transaction {} is not active",
                        tx_id
                    )));
                }
            }
        };
        self.store.replay_undo(undo);
        debug!(tx = tx_id, "Transaction rolled back");
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.store.ensure_online()
    }

    async fn close(&self) -> Result<()> {
        self.store.end_session(self.id);
        Ok(())
    }
}

impl Drop for MemoryAdapter {
    fn drop(&mut self) {
        self.store.end_session(self.id);
    }
}

enum NativeCommand {
    Set(GlobalAddress, String),
    Kill(GlobalAddress),
    Write(GlobalAddress),
}

impl NativeCommand {
    fn parse(code: &str) -> Result<Self> {
        let code = code.trim();
        let unsupported =
            || GlobalsError::Validation(format!("unsupported native command: {:?}", code));

        if let Some(inner) = strip_keyword(code, &["$GET", "$G"]) {
            let reference = inner
                .trim()
                .strip_prefix('(')
                .and_then(|r| r.strip_suffix(')'))
                .ok_or_else(unsupported)?;
            return Ok(Self::Write(reference.trim().parse()?));
        }

        let (command, rest) = code.split_once(char::is_whitespace).ok_or_else(unsupported)?;
        let rest = rest.trim();
        match command.to_ascii_uppercase().as_str() {
            "S" | "SET" => {
                let (reference, value) = split_assignment(rest).ok_or_else(unsupported)?;
                Ok(Self::Set(reference.trim().parse()?, parse_literal(value.trim())?))
            }
            "K" | "KILL" => Ok(Self::Kill(rest.parse()?)),
            "W" | "WRITE" => Ok(Self::Write(rest.parse()?)),
            _ => Err(unsupported()),
        }
    }
}

fn strip_keyword<'a>(code: &'a str, keywords: &[&str]) -> Option<&'a str> {
    let upper = code.to_ascii_uppercase();
    keywords
        .iter()
        .find(|kw| upper.starts_with(*kw) && code[kw.len()..].trim_start().starts_with('('))
        .map(|kw| &code[kw.len()..])
}

/// Split `ref=value` at the first `=` outside quotes and parentheses.
fn split_assignment(s: &str) -> Option<(&str, &str)> {
    let mut depth = 0i32;
    let mut quoted = false;
    for (i, c) in s.char_indices() {
        match c {
            '"' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => depth -= 1,
            '=' if !quoted && depth == 0 => return Some((&s[..i], &s[i + 1..])),
            _ => {}
        }
    }
    None
}

fn parse_literal(s: &str) -> Result<String> {
    if let Some(body) = s.strip_prefix('"').and_then(|b| b.strip_suffix('"')) {
        return Ok(body.replace("\"\"", "\""));
    }
    match Subscript::parse(s) {
        Subscript::Number(n) => Ok(n.as_str().to_string()),
        Subscript::Text(_) => Err(GlobalsError::Validation(format!(
            "native literal must be quoted or numeric: {:?}",
            s
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn adapter() -> Arc<dyn GlobalsAdapter> {
        MemoryConnector::new().connect().await.unwrap()
    }

    fn addr(s: &str) -> GlobalAddress {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let a = adapter().await;
        a.set(&addr("^X(\"A\")"), "hello").await.unwrap();
        assert_eq!(a.get(&addr("^X(\"A\")")).await.unwrap().as_str(), Some("hello"));
        assert!(!a.get(&addr("^X(\"B\")")).await.unwrap().is_defined());
    }

    #[tokio::test]
    async fn test_empty_set_deletes_value_only() {
        let a = adapter().await;
        a.set(&addr("^X(1)"), "parent").await.unwrap();
        a.set(&addr("^X(1,2)"), "child").await.unwrap();
        assert_eq!(a.data_status(&addr("^X(1)")).await.unwrap(), DataStatus::HasBoth);

        a.set(&addr("^X(1)"), "").await.unwrap();
        assert!(!a.get(&addr("^X(1)")).await.unwrap().is_defined());
        assert_eq!(
            a.data_status(&addr("^X(1)")).await.unwrap(),
            DataStatus::HasDescendants
        );
        assert_eq!(a.get(&addr("^X(1,2)")).await.unwrap().as_str(), Some("child"));
    }

    #[tokio::test]
    async fn test_set_rejects_empty_subscript() {
        let a = adapter().await;
        let bad = GlobalAddress::new("X", ["A", ""]).unwrap();
        assert!(matches!(a.set(&bad, "v").await, Err(GlobalsError::Validation(_))));
    }

    #[tokio::test]
    async fn test_order_walks_collation() {
        let a = adapter().await;
        for sub in ["\"b\"", "10", "\"A\"", "2", "-1", "\"a\"", ".5"] {
            a.set(&addr(&format!("^X({})", sub)), "v").await.unwrap();
        }
        a.set(&addr("^X(2,\"deep\")"), "v").await.unwrap();

        let mut seen = Vec::new();
        let mut cursor = GlobalAddress::new("X", [""]).unwrap();
        while let Some(next) = a.order(&cursor).await.unwrap() {
            seen.push(next.as_str().to_string());
            cursor = cursor.sibling(next);
        }
        assert_eq!(seen, vec!["-1", ".5", "2", "10", "A", "a", "b"]);
    }

    #[tokio::test]
    async fn test_order_skips_descendants_of_start() {
        let a = adapter().await;
        a.set(&addr("^X(\"A\",1)"), "v").await.unwrap();
        a.set(&addr("^X(\"A\",2)"), "v").await.unwrap();
        a.set(&addr("^X(\"B\")"), "v").await.unwrap();

        let next = a.order(&addr("^X(\"A\")")).await.unwrap();
        assert_eq!(next, Some(Subscript::from("B")));
        let inner = a.order(&addr("^X(\"A\",1)")).await.unwrap();
        assert_eq!(inner, Some(Subscript::from(2i64)));
        assert_eq!(a.order(&addr("^X(\"B\")")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_order_on_missing_global() {
        let a = adapter().await;
        let cursor = GlobalAddress::new("NOPE", [""]).unwrap();
        assert_eq!(a.order(&cursor).await.unwrap(), None);
        let root = GlobalAddress::root("NOPE").unwrap();
        assert!(matches!(a.order(&root).await, Err(GlobalsError::Validation(_))));
    }

    #[tokio::test]
    async fn test_offline_store() {
        let connector = MemoryConnector::new();
        let a = connector.connect().await.unwrap();
        connector.store().set_online(false);
        assert!(matches!(a.get(&addr("^X(1)")).await, Err(GlobalsError::NotConnected(_))));
        assert!(a.ping().await.is_err());
        assert!(connector.connect().await.is_err());
        connector.store().set_online(true);
        assert!(a.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_connections_share_store() {
        let connector = MemoryConnector::new();
        let a = connector.connect().await.unwrap();
        let b = connector.connect().await.unwrap();
        a.set(&addr("^X(1)"), "shared").await.unwrap();
        assert_eq!(b.get(&addr("^X(1)")).await.unwrap().as_str(), Some("shared"));
        assert_eq!(connector.connections_opened(), 2);
    }

    #[tokio::test]
    async fn test_lock_conflicts_with_subtree() {
        let connector = MemoryConnector::new();
        let a = connector.connect().await.unwrap();
        let b = connector.connect().await.unwrap();
        let short = Duration::from_millis(20);

        assert!(a.lock(&addr("^X(\"A\")"), short).await.unwrap());
        assert!(!b.lock(&addr("^X(\"A\",1)"), short).await.unwrap());
        assert!(!b.lock(&addr("^X"), short).await.unwrap());
        assert!(b.lock(&addr("^X(\"B\")"), short).await.unwrap());

        a.unlock(&addr("^X(\"A\")")).await.unwrap();
        assert!(b.lock(&addr("^X(\"A\",1)"), short).await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_waits_for_release() {
        let connector = MemoryConnector::new();
        let a = connector.connect().await.unwrap();
        let b = connector.connect().await.unwrap();
        let target = addr("^X(1)");
        assert!(a.lock(&target, Duration::ZERO).await.unwrap());

        let releaser = {
            let a = Arc::clone(&a);
            let target = target.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                a.unlock(&target).await.unwrap();
            })
        };
        assert!(b.lock(&target, Duration::from_secs(2)).await.unwrap());
        releaser.await.unwrap();
    }

    #[tokio::test]
    async fn test_transaction_rollback_restores() {
        let a = adapter().await;
        a.set(&addr("^X(1)"), "before").await.unwrap();

        let tx = a.start_transaction().await.unwrap();
        assert!(!tx.is_noop());
        a.set(&addr("^X(1)"), "during").await.unwrap();
        a.set(&addr("^X(2)"), "new").await.unwrap();
        a.rollback(tx).await.unwrap();

        assert_eq!(a.get(&addr("^X(1)")).await.unwrap().as_str(), Some("before"));
        assert!(!a.get(&addr("^X(2)")).await.unwrap().is_defined());
    }

    #[tokio::test]
    async fn test_transaction_commit_keeps_writes() {
        let a = adapter().await;
        let tx = a.start_transaction().await.unwrap();
        a.set(&addr("^X(1)"), "kept").await.unwrap();
        a.commit(tx).await.unwrap();
        assert_eq!(a.get(&addr("^X(1)")).await.unwrap().as_str(), Some("kept"));
    }

    #[tokio::test]
    async fn test_single_active_transaction() {
        let connector = MemoryConnector::new();
        let a = connector.connect().await.unwrap();
        let b = connector.connect().await.unwrap();
        let tx = a.start_transaction().await.unwrap();
        assert!(matches!(
            b.start_transaction().await,
            Err(GlobalsError::OperationFailed(_))
        ));
        a.commit(tx).await.unwrap();
        let tx = b.start_transaction().await.unwrap();
        b.commit(tx).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_connection_ends_its_session() {
        let connector = MemoryConnector::new();
        let a = connector.connect().await.unwrap();
        let b = connector.connect().await.unwrap();
        b.set(&addr("^X(1)"), "before").await.unwrap();

        let _tx = a.start_transaction().await.unwrap();
        a.set(&addr("^X(1)"), "during").await.unwrap();
        assert!(a.lock(&addr("^X(2)"), Duration::ZERO).await.unwrap());
        drop(a);

        assert_eq!(b.get(&addr("^X(1)")).await.unwrap().as_str(), Some("before"));
        assert!(b.lock(&addr("^X(2)"), Duration::ZERO).await.unwrap());
        let tx = b.start_transaction().await.unwrap();
        b.commit(tx).await.unwrap();
    }

    #[tokio::test]
    async fn test_without_transactions_is_noop() {
        let a = MemoryConnector::new()
            .with_capabilities(Capabilities::default())
            .connect()
            .await
            .unwrap();
        let tx = a.start_transaction().await.unwrap();
        assert!(tx.is_noop());
        a.set(&addr("^X(1)"), "v").await.unwrap();
        a.rollback(tx).await.unwrap();
        // No-op handle: the write stands
        assert!(a.get(&addr("^X(1)")).await.unwrap().is_defined());
    }

    #[tokio::test]
    async fn test_native_commands() {
        let a = adapter().await;
        a.execute_native("SET ^X(\"A\",1)=\"a = b\"").await.unwrap();
        a.execute_native("S ^X(\"A\",2)=42").await.unwrap();
        assert_eq!(
            a.execute_native("W ^X(\"A\",1)").await.unwrap().as_str(),
            Some("a = b")
        );
        assert_eq!(
            a.execute_native("$GET(^X(\"A\",2))").await.unwrap().as_str(),
            Some("42")
        );

        a.execute_native("KILL ^X(\"A\")").await.unwrap();
        assert_eq!(a.data_status(&addr("^X(\"A\")")).await.unwrap(), DataStatus::Undefined);
        assert!(matches!(
            a.execute_native("HALT").await,
            Err(GlobalsError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_scan_xref_matches_prefix() {
        let a = adapter().await;
        for (name, id) in [("SMITH,JOHN", 3), ("SMITH,ANN", 7), ("SMYTHE,BOB", 2), ("JONES,AL", 1)] {
            let node = GlobalAddress::new("DPT", ["B", name]).unwrap().child(id as i64);
            a.set(&node, "1").await.unwrap();
        }
        let query = XrefQuery::new(GlobalAddress::new("DPT", ["B"]).unwrap()).with_prefix("SMITH");
        let matches = a.scan_xref(&query).await.unwrap();
        let names: Vec<_> = matches.iter().map(|m| m.value.as_str().to_string()).collect();
        assert_eq!(names, vec!["SMITH,ANN", "SMITH,JOHN"]);
        assert_eq!(matches[1].id, Subscript::from(3i64));
    }
}
