//! Memoization of ranked search results.
//!
//! Entries live in a sharded [`DashMap`], so lookups on unrelated keys never
//! contend. A separate sweep lock orders the whole-cache operations:
//! - `get` takes no sweep lock at all.
//! - `put` holds the upgradable side, so inserts are serialized and at most
//!   one sweep runs at a time. It upgrades to exclusive only to sweep.
//! - `clear` takes the exclusive side.
//!
//! Expiry is observed lazily on lookup; pressure eviction eagerly on insert.

use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{RwLock, RwLockUpgradableReadGuard};

use super::metrics::{CacheCounters, CacheMetrics};
use crate::vector::SearchResult;

/// Entries idle for longer than this are treated as absent.
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Default bound on the number of cached queries.
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

/// Structural key of a cached query.
///
/// The query is copied on construction, so later changes to the caller's
/// buffer can never alter a stored key. Floats compare by bit pattern.
#[derive(Debug, Clone)]
pub struct CacheKey {
    query: Arc<[f32]>,
    top_k: usize,
    filter_fingerprint: String,
}

impl CacheKey {
    pub fn new(query: &[f32], top_k: usize, filter_fingerprint: &str) -> Self {
        Self {
            query: Arc::from(query),
            top_k,
            filter_fingerprint: filter_fingerprint.to_string(),
        }
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.top_k == other.top_k
            && self.filter_fingerprint == other.filter_fingerprint
            && self.query.len() == other.query.len()
            && self
                .query
                .iter()
                .zip(other.query.iter())
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.top_k.hash(state);
        self.filter_fingerprint.hash(state);
        self.query.len().hash(state);
        for value in self.query.iter() {
            value.to_bits().hash(state);
        }
    }
}

#[derive(Debug)]
struct CacheEntry {
    results: Arc<[SearchResult]>,
    /// Nanoseconds since the cache's epoch.
    last_access: AtomicU64,
    /// Global access order; breaks ties between equal timestamps.
    sequence: AtomicU64,
}

/// Bounded, concurrent cache of `(query, top_k, filter) -> results`.
#[derive(Debug)]
pub struct ResultCache {
    entries: DashMap<CacheKey, CacheEntry>,
    sweep: RwLock<()>,
    max_entries: usize,
    ttl: Duration,
    epoch: Instant,
    access_clock: AtomicU64,
    counters: CacheCounters,
}

impl Default for ResultCache {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

impl ResultCache {
    /// Creates a cache holding at most `max_entries` queries with the standard
    /// one hour TTL. A bound of zero disables caching.
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self::with_ttl(max_entries, DEFAULT_TTL)
    }

    #[must_use]
    pub fn with_ttl(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            sweep: RwLock::new(()),
            max_entries,
            ttl,
            epoch: Instant::now(),
            access_clock: AtomicU64::new(0),
            counters: CacheCounters::default(),
        }
    }

    fn now(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn tick(&self) -> u64 {
        self.access_clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Looks up cached results. A stale entry counts as a miss and is removed.
    pub fn get(
        &self,
        query: &[f32],
        top_k: usize,
        filter_fingerprint: &str,
    ) -> Option<Arc<[SearchResult]>> {
        let key = CacheKey::new(query, top_k, filter_fingerprint);
        let now = self.now();
        let ttl = self.ttl.as_nanos() as u64;

        let fresh = match self.entries.get(&key) {
            None => {
                self.counters.record_miss();
                return None;
            }
            Some(entry) => {
                let last = entry.last_access.load(Ordering::Relaxed);
                if now.saturating_sub(last) > ttl {
                    None
                } else {
                    entry.last_access.fetch_max(now, Ordering::Relaxed);
                    entry.sequence.store(self.tick(), Ordering::Relaxed);
                    Some(Arc::clone(&entry.results))
                }
            }
        };

        match fresh {
            Some(results) => {
                self.counters.record_hit();
                Some(results)
            }
            None => {
                // Re-check under the shard lock: a concurrent put may have
                // refreshed the entry since it was read.
                let removed = self.entries.remove_if(&key, |_, entry| {
                    now.saturating_sub(entry.last_access.load(Ordering::Relaxed)) > ttl
                });
                if removed.is_some() {
                    self.counters.record_expiration();
                    tracing::debug!(top_k, "expired cached search result");
                }
                self.counters.record_miss();
                None
            }
        }
    }

    /// Caches `results`, sweeping the coldest fifth first when full.
    pub fn put(
        &self,
        query: &[f32],
        top_k: usize,
        filter_fingerprint: &str,
        results: impl Into<Arc<[SearchResult]>>,
    ) {
        if self.max_entries == 0 {
            return;
        }
        let key = CacheKey::new(query, top_k, filter_fingerprint);
        let entry = CacheEntry {
            results: results.into(),
            last_access: AtomicU64::new(self.now()),
            sequence: AtomicU64::new(self.tick()),
        };

        let guard = self.sweep.upgradable_read();
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(&key) {
            let _exclusive = RwLockUpgradableReadGuard::upgrade(guard);
            self.evict_coldest();
            self.entries.insert(key, entry);
        } else {
            self.entries.insert(key, entry);
            drop(guard);
        }
    }

    /// Removes the `max(1, len / 5)` least recently accessed entries.
    fn evict_coldest(&self) {
        let len = self.entries.len();
        let count = (len / 5).max(1);

        let mut by_age: Vec<(u64, u64, CacheKey)> = self
            .entries
            .iter()
            .map(|item| {
                let entry = item.value();
                (
                    entry.last_access.load(Ordering::Relaxed),
                    entry.sequence.load(Ordering::Relaxed),
                    item.key().clone(),
                )
            })
            .collect();
        by_age.sort_unstable_by_key(|(last, seq, _)| (*last, *seq));

        let mut evicted = 0u64;
        for (_, _, key) in by_age.into_iter().take(count) {
            if self.entries.remove(&key).is_some() {
                evicted += 1;
            }
        }
        self.counters.record_evictions(evicted);
        tracing::debug!(evicted, remaining = self.entries.len(), "swept result cache");
    }

    /// Drops every entry.
    pub fn clear(&self) {
        let _exclusive = self.sweep.write();
        self.entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    #[must_use]
    pub fn metrics(&self) -> CacheMetrics {
        self.counters.snapshot(self.entries.len())
    }
}
