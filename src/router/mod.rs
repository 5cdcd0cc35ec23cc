// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Query routing for cross-reference searches.
//!
//! A cross-reference is an index global laid out as `root(value, id)`, e.g.
//! `^DPT("B","SMITH,JOHN",42)`. A search lists `(value, id)` pairs whose
//! value starts with a prefix, in collation order.
//!
//! # Routes
//!
//! ```text
//!                 XrefQuery
//!                     │
//!          QueryRouter::decide()
//!           │                 │
//!       Traversal            Bulk
//!   (order() walk,      (adapter.scan_xref,
//!    any adapter)        bulk_query only)
//!           │                 │
//!           └──── same ordered Vec<XrefMatch> ────┘
//! ```
//!
//! Bulk wins when the adapter declares `bulk_query` and either the caller
//! asks for it or more than [`BULK_THRESHOLD`] candidates are expected.
//! A bulk call the adapter turns down falls back to traversal.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::adapter::traits::{Capabilities, GlobalsAdapter, GlobalsError, Result};
use crate::global::{text_prefix_key, GlobalAddress, Subscript, KEY_UPPER_SENTINEL};

/// Expected candidates above which the bulk path is chosen.
pub const BULK_THRESHOLD: usize = 25;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutePreference {
    /// Let the router decide from the estimate and config
    #[default]
    Auto,
    PreferBulk,
    PreferTraversal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Traversal,
    Bulk,
}

impl Route {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Traversal => "traversal",
            Self::Bulk => "bulk",
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A cross-reference search.
///
/// # Example
///
/// ```
/// use globals_engine::{GlobalAddress, XrefQuery};
///
/// let query = XrefQuery::new(GlobalAddress::new("DPT", ["B"]).unwrap())
///     .with_prefix("SMITH")
///     .with_limit(50);
/// assert_eq!(query.estimate(), Some(50));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XrefQuery {
    /// Index node whose children are the indexed values
    pub root: GlobalAddress,
    /// Empty matches every value
    pub prefix: String,
    pub limit: Option<usize>,
    /// Caller's guess at the candidate count, used only for routing
    pub size_hint: Option<usize>,
    pub preference: RoutePreference,
}

impl XrefQuery {
    #[must_use]
    pub fn new(root: GlobalAddress) -> Self {
        Self {
            root,
            prefix: String::new(),
            limit: None,
            size_hint: None,
            preference: RoutePreference::Auto,
        }
    }

    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn with_size_hint(mut self, hint: usize) -> Self {
        self.size_hint = Some(hint);
        self
    }

    #[must_use]
    pub fn with_preference(mut self, preference: RoutePreference) -> Self {
        self.preference = preference;
        self
    }

    /// Candidate estimate used for routing.
    #[must_use]
    pub fn estimate(&self) -> Option<usize> {
        self.size_hint.or(self.limit)
    }

    #[must_use]
    pub fn matches(&self, value: &Subscript) -> bool {
        value.as_str().starts_with(&self.prefix)
    }

    /// Whether some canonical number could start with the prefix. When it
    /// can, the numeric region has to be scanned too.
    #[must_use]
    pub fn prefix_may_be_numeric(&self) -> bool {
        self.prefix
            .chars()
            .next()
            .map_or(true, |c| c.is_ascii_digit() || c == '-' || c == '.')
    }

    /// Collation-key range `[lo, hi)` holding every candidate node.
    #[must_use]
    pub fn key_range(&self) -> (Vec<u8>, Vec<u8>) {
        let mut lo = self.root.collation_key();
        if !self.prefix_may_be_numeric() {
            lo.extend_from_slice(&text_prefix_key(&self.prefix));
        }
        let mut hi = lo.clone();
        hi.push(KEY_UPPER_SENTINEL);
        (lo, hi)
    }

    fn is_full(&self, found: usize) -> bool {
        self.limit.is_some_and(|limit| found >= limit)
    }

    /// True once `value` sorts after every possible match.
    fn is_past_matches(&self, value: &Subscript) -> bool {
        !self.prefix.is_empty()
            && value.is_text()
            && value.as_str() > self.prefix.as_str()
            && !self.matches(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct XrefMatch {
    pub value: Subscript,
    pub id: Subscript,
}

/// Filter `(value, id)` rows already in collation order: prefix match,
/// consecutive duplicates dropped (rows from deeper nodes repeat a pair),
/// truncated to the limit. Adapters implementing
/// [`GlobalsAdapter::scan_xref`] feed their range-scan rows through this.
pub fn collect_matches<I>(query: &XrefQuery, rows: I) -> Vec<XrefMatch>
where
    I: IntoIterator<Item = (Subscript, Subscript)>,
{
    let mut out: Vec<XrefMatch> = Vec::new();
    for (value, id) in rows {
        if query.is_full(out.len()) {
            break;
        }
        if !query.matches(&value) {
            continue;
        }
        if out.last().is_some_and(|last| last.value == value && last.id == id) {
            continue;
        }
        out.push(XrefMatch { value, id });
    }
    out
}

/// Walk the cross-reference with `order`. Works on every adapter.
pub async fn traverse(adapter: &dyn GlobalsAdapter, query: &XrefQuery) -> Result<Vec<XrefMatch>> {
    let mut out = Vec::new();
    if query.is_full(0) {
        return Ok(out);
    }

    let mut cursor = query.root.child(Subscript::empty());

    // Text-only prefix: seek straight to it instead of scanning from the start.
    if !query.prefix_may_be_numeric() {
        let seek = Subscript::Text(query.prefix.clone());
        cursor = query.root.child(seek.clone());
        if adapter.data_status(&cursor).await?.is_defined() {
            collect_ids(adapter, query, &seek, &mut out).await?;
        }
    }

    while !query.is_full(out.len()) {
        let Some(value) = adapter.order(&cursor).await? else {
            break;
        };
        if query.is_past_matches(&value) {
            break;
        }
        if query.matches(&value) {
            collect_ids(adapter, query, &value, &mut out).await?;
        }
        cursor = cursor.sibling(value);
    }
    Ok(out)
}

async fn collect_ids(
    adapter: &dyn GlobalsAdapter,
    query: &XrefQuery,
    value: &Subscript,
    out: &mut Vec<XrefMatch>,
) -> Result<()> {
    let mut cursor = query.root.child(value).child(Subscript::empty());
    while !query.is_full(out.len()) {
        let Some(id) = adapter.order(&cursor).await? else {
            break;
        };
        out.push(XrefMatch {
            value: value.clone(),
            id: id.clone(),
        });
        cursor = cursor.sibling(id);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub bulk: u64,
    pub traversal: u64,
}

/// Chooses and runs a route per search. Counts which route served each call.
#[derive(Debug, Default)]
pub struct QueryRouter {
    prefer_bulk: bool,
    bulk_calls: AtomicU64,
    traversal_calls: AtomicU64,
}

impl QueryRouter {
    #[must_use]
    pub fn new(prefer_bulk: bool) -> Self {
        Self {
            prefer_bulk,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn decide(&self, query: &XrefQuery, capabilities: &Capabilities) -> Route {
        if !capabilities.bulk_query {
            return Route::Traversal;
        }
        match query.preference {
            RoutePreference::PreferTraversal => Route::Traversal,
            RoutePreference::PreferBulk => Route::Bulk,
            RoutePreference::Auto if self.prefer_bulk => Route::Bulk,
            RoutePreference::Auto => match query.estimate() {
                Some(estimate) if estimate > BULK_THRESHOLD => Route::Bulk,
                _ => Route::Traversal,
            },
        }
    }

    /// Run the query on the chosen route. Returns the route that produced
    /// the results.
    pub async fn execute(
        &self,
        adapter: &dyn GlobalsAdapter,
        query: &XrefQuery,
        capabilities: &Capabilities,
    ) -> Result<(Route, Vec<XrefMatch>)> {
        let route = self.decide(query, capabilities);
        debug!(root = %query.root, prefix = %query.prefix, route = %route, "Routing search");

        let (route, matches) = match route {
            Route::Bulk => match adapter.scan_xref(query).await {
                Ok(matches) => (Route::Bulk, matches),
                Err(GlobalsError::CapabilityUnsupported(reason)) => {
                    warn!(reason = %reason, "Bulk path refused, falling back to traversal");
                    (Route::Traversal, traverse(adapter, query).await?)
                }
                Err(e) => return Err(e),
            },
            Route::Traversal => (Route::Traversal, traverse(adapter, query).await?),
        };

        self.record(route);
        Ok((route, matches))
    }

    fn record(&self, route: Route) {
        let counter = match route {
            Route::Bulk => &self.bulk_calls,
            Route::Traversal => &self.traversal_calls,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_route(route.as_str());
    }

    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            bulk: self.bulk_calls.load(Ordering::Relaxed),
            traversal: self.traversal_calls.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Connector, MemoryConnector};
    use std::sync::Arc;

    fn xref_root() -> GlobalAddress {
        GlobalAddress::new("DPT", ["B"]).unwrap()
    }

    async fn seeded() -> Arc<dyn GlobalsAdapter> {
        let adapter = MemoryConnector::new().connect().await.unwrap();
        let entries: [(&str, i64); 8] = [
            ("ADAMS,AMY", 9),
            ("SMITH,ANN", 7),
            ("SMITH,JOHN", 3),
            ("SMITH,JOHN", 12),
            ("SMYTHE,BOB", 2),
            ("SM", 20),
            ("100", 5),
            ("1ABC", 6),
        ];
        for (value, id) in entries {
            let node = xref_root().child(value).child(id);
            adapter.set(&node, "1").await.unwrap();
        }
        // Record data below an id must not duplicate the pair
        adapter
            .set(&xref_root().child("SMITH,JOHN").child(3i64).child("x"), "1")
            .await
            .unwrap();
        adapter
    }

    fn pairs(matches: &[XrefMatch]) -> Vec<(String, String)> {
        matches
            .iter()
            .map(|m| (m.value.as_str().to_string(), m.id.as_str().to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_traversal_prefix() {
        let adapter = seeded().await;
        let query = XrefQuery::new(xref_root()).with_prefix("SMITH");
        let found = traverse(adapter.as_ref(), &query).await.unwrap();
        assert_eq!(
            pairs(&found),
            vec![
                ("SMITH,ANN".into(), "7".into()),
                ("SMITH,JOHN".into(), "3".into()),
                ("SMITH,JOHN".into(), "12".into()),
            ]
        );
    }

    #[tokio::test]
    async fn test_traversal_includes_exact_prefix_value() {
        let adapter = seeded().await;
        let query = XrefQuery::new(xref_root()).with_prefix("SM");
        let found = traverse(adapter.as_ref(), &query).await.unwrap();
        assert_eq!(found.first().map(|m| m.value.as_str()), Some("SM"));
        assert_eq!(found.len(), 5);
    }

    #[tokio::test]
    async fn test_traversal_numeric_capable_prefix() {
        let adapter = seeded().await;
        let query = XrefQuery::new(xref_root()).with_prefix("1");
        let found = traverse(adapter.as_ref(), &query).await.unwrap();
        // The number 100 collates before the string "1ABC"
        assert_eq!(
            pairs(&found),
            vec![("100".into(), "5".into()), ("1ABC".into(), "6".into())]
        );
    }

    #[tokio::test]
    async fn test_limit_and_empty_prefix() {
        let adapter = seeded().await;
        let query = XrefQuery::new(xref_root()).with_limit(3);
        let found = traverse(adapter.as_ref(), &query).await.unwrap();
        assert_eq!(found.len(), 3);
        assert_eq!(found[0].value.as_str(), "100");

        let none = XrefQuery::new(xref_root()).with_limit(0);
        assert!(traverse(adapter.as_ref(), &none).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_match_is_empty() {
        let adapter = seeded().await;
        let query = XrefQuery::new(xref_root()).with_prefix("ZZZ");
        assert!(traverse(adapter.as_ref(), &query).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bulk_and_traversal_agree() {
        let adapter = seeded().await;
        for prefix in ["", "S", "SM", "SMITH", "SMITH,J", "1", "A", "ZZZ"] {
            for limit in [None, Some(1), Some(2), Some(100)] {
                let mut query = XrefQuery::new(xref_root()).with_prefix(prefix);
                query.limit = limit;
                let walked = traverse(adapter.as_ref(), &query).await.unwrap();
                let bulk = adapter.scan_xref(&query).await.unwrap();
                assert_eq!(walked, bulk, "prefix {prefix:?} limit {limit:?}");
            }
        }
    }

    #[test]
    fn test_decide() {
        let router = QueryRouter::new(false);
        let bulk_caps = Capabilities::full();
        let plain = Capabilities::default();
        let root = xref_root();

        let small = XrefQuery::new(root.clone()).with_limit(10);
        let large = XrefQuery::new(root.clone()).with_size_hint(500);
        let at_threshold = XrefQuery::new(root.clone()).with_limit(BULK_THRESHOLD);
        let unknown = XrefQuery::new(root.clone());

        assert_eq!(router.decide(&small, &bulk_caps), Route::Traversal);
        assert_eq!(router.decide(&large, &bulk_caps), Route::Bulk);
        assert_eq!(router.decide(&at_threshold, &bulk_caps), Route::Traversal);
        assert_eq!(router.decide(&unknown, &bulk_caps), Route::Traversal);
        assert_eq!(router.decide(&large, &plain), Route::Traversal);

        let forced = small.clone().with_preference(RoutePreference::PreferBulk);
        assert_eq!(router.decide(&forced, &bulk_caps), Route::Bulk);
        assert_eq!(router.decide(&forced, &plain), Route::Traversal);
        let walk = large.with_preference(RoutePreference::PreferTraversal);
        assert_eq!(router.decide(&walk, &bulk_caps), Route::Traversal);

        let eager = QueryRouter::new(true);
        assert_eq!(eager.decide(&small, &bulk_caps), Route::Bulk);
    }

    #[tokio::test]
    async fn test_bulk_refusal_falls_back() {
        let adapter = MemoryConnector::new()
            .with_capabilities(Capabilities {
                bulk_query: false,
                ..Capabilities::full()
            })
            .connect()
            .await
            .unwrap();
        adapter
            .set(&xref_root().child("SMITH").child(1i64), "1")
            .await
            .unwrap();

        // Claim bulk support the adapter doesn't actually have.
        let router = QueryRouter::new(true);
        let query = XrefQuery::new(xref_root()).with_prefix("SMITH");
        let (route, found) = router
            .execute(adapter.as_ref(), &query, &Capabilities::full())
            .await
            .unwrap();
        assert_eq!(route, Route::Traversal);
        assert_eq!(found.len(), 1);
        assert_eq!(router.stats(), RouterStats { bulk: 0, traversal: 1 });
    }

    #[test]
    fn test_key_range_bounds() {
        let query = XrefQuery::new(xref_root()).with_prefix("SMI");
        let (lo, hi) = query.key_range();
        let inside = xref_root().child("SMITH").child(1i64).collation_key();
        let outside = xref_root().child("SMYTHE").child(1i64).collation_key();
        assert!(inside >= lo && inside < hi);
        assert!(outside >= hi);

        let numeric = XrefQuery::new(xref_root()).with_prefix("1");
        let (lo, hi) = numeric.key_range();
        let number = xref_root().child(100i64).child(1i64).collation_key();
        assert!(number >= lo && number < hi);
    }
}
