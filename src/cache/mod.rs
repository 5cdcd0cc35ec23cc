// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read cache in front of the adapters.
//!
//! A bounded LRU map from [`GlobalAddress`] to [`GlobalValue`], with an
//! optional TTL. Undefined values are cached too, so repeated reads of an
//! unwritten node stay off the backend.
//!
//! # Fill tickets
//!
//! A reader takes a [`FillTicket`] before it goes to the adapter and hands it
//! back with the fetched value. Every write bumps the cache epoch, and a fill
//! whose ticket predates the bump is dropped:
//!
//! ```text
//! reader: begin_fill (epoch 7) ──── fetch "old" ─────────── complete_fill ✗
//! writer:              set "new" ── complete_write (epoch 8)
//! ```
//!
//! Without this a fetch that raced a write could re-insert the old value
//! after the writer had already refreshed the entry.

mod prefetch;

pub(crate) use prefetch::spawn_prefetch;

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::config::GlobalsConfig;
use crate::global::{GlobalAddress, GlobalValue};

#[derive(Debug, Clone)]
struct CacheEntry {
    value: GlobalValue,
    inserted_at: Instant,
    access_count: u64,
}

struct CacheState {
    entries: LruCache<GlobalAddress, CacheEntry>,
    epoch: u64,
}

/// Proof that a fill started at a given cache epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillTicket {
    epoch: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub invalidations: u64,
    pub inserts: u64,
    pub size: usize,
    pub capacity: usize,
}

impl CacheStats {
    /// Hits over lookups, 0.0 before the first lookup.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

pub struct GlobalCache {
    state: Mutex<CacheState>,
    ttl: Option<Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    invalidations: AtomicU64,
    inserts: AtomicU64,
}

impl GlobalCache {
    /// `capacity` of 0 is treated as 1.
    #[must_use]
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(CacheState {
                entries: LruCache::new(capacity),
                epoch: 0,
            }),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn from_config(config: &GlobalsConfig) -> Self {
        Self::new(config.effective_cache_size(), config.ttl())
    }

    fn is_expired(&self, entry: &CacheEntry, now: Instant) -> bool {
        self.ttl
            .is_some_and(|ttl| now.duration_since(entry.inserted_at) >= ttl)
    }

    /// Look up a value. A hit refreshes recency; an expired entry is dropped
    /// and counts as a miss.
    pub fn get(&self, address: &GlobalAddress) -> Option<GlobalValue> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let expired = match state.entries.peek(address) {
            Some(entry) => self.is_expired(entry, now),
            None => {
                drop(state);
                self.record_lookup(false);
                return None;
            }
        };
        if expired {
            state.entries.pop(address);
            drop(state);
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.record_lookup(false);
            return None;
        }

        let value = state.entries.get_mut(address).map(|entry| {
            entry.access_count += 1;
            entry.value.clone()
        });
        drop(state);
        self.record_lookup(value.is_some());
        value
    }

    fn record_lookup(&self, hit: bool) {
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        crate::metrics::record_cache_lookup(hit);
    }

    /// Unconditional insert.
    pub fn put(&self, address: GlobalAddress, value: GlobalValue) {
        let mut state = self.state.lock();
        self.insert_locked(&mut state, address, value);
    }

    fn insert_locked(&self, state: &mut CacheState, address: GlobalAddress, value: GlobalValue) {
        let entry = CacheEntry {
            value,
            inserted_at: Instant::now(),
            access_count: 0,
        };
        let key = address.clone();
        if let Some((displaced, _)) = state.entries.push(address, entry) {
            if displaced != key {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_cache_eviction(1);
            }
        }
        self.inserts.fetch_add(1, Ordering::Relaxed);
        crate::metrics::set_cache_entries(state.entries.len());
    }

    /// Start a fill: take this before fetching from the adapter.
    #[must_use]
    pub fn begin_fill(&self) -> FillTicket {
        FillTicket {
            epoch: self.state.lock().epoch,
        }
    }

    /// Store a fetched value unless a write happened since `ticket` was
    /// taken. Returns whether the value was stored.
    pub fn complete_fill(&self, ticket: FillTicket, address: GlobalAddress, value: GlobalValue) -> bool {
        let mut state = self.state.lock();
        if state.epoch != ticket.epoch {
            debug!(address = %address, "Dropping stale cache fill");
            return false;
        }
        self.insert_locked(&mut state, address, value);
        true
    }

    /// Record a successful write: invalidate in-flight fills and cache the
    /// value just written.
    pub fn complete_write(&self, address: GlobalAddress, value: GlobalValue) {
        let mut state = self.state.lock();
        state.epoch += 1;
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        self.insert_locked(&mut state, address, value);
    }

    /// Forget one address.
    pub fn invalidate(&self, address: &GlobalAddress) {
        let mut state = self.state.lock();
        state.epoch += 1;
        state.entries.pop(address);
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        crate::metrics::set_cache_entries(state.entries.len());
    }

    /// Drop every entry, e.g. after native code ran against the backend.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.epoch += 1;
        state.entries.clear();
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        crate::metrics::set_cache_entries(0);
    }

    /// Remove expired entries now rather than on their next lookup.
    pub fn purge_expired(&self) -> usize {
        if self.ttl.is_none() {
            return 0;
        }
        let now = Instant::now();
        let mut state = self.state.lock();
        let expired: Vec<GlobalAddress> = state
            .entries
            .iter()
            .filter(|(_, entry)| self.is_expired(entry, now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            state.entries.pop(key);
        }
        self.expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        crate::metrics::set_cache_entries(state.entries.len());
        expired.len()
    }

    /// Times a cached address has been served since it was inserted.
    #[must_use]
    pub fn access_count(&self, address: &GlobalAddress) -> Option<u64> {
        self.state.lock().entries.peek(address).map(|e| e.access_count)
    }

    #[must_use]
    pub fn contains(&self, address: &GlobalAddress) -> bool {
        self.state.lock().entries.contains(address)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let (size, capacity) = {
            let state = self.state.lock();
            (state.entries.len(), state.entries.cap().get())
        };
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            size,
            capacity,
        }
    }
}
