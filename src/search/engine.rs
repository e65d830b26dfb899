//! Exhaustive cosine-similarity search over a [`VectorStore`].
//!
//! A query is conformed to the store's dimension, looked up in the result
//! cache, and on a miss scored against a consistent snapshot of the store.
//! The snapshot is split into fixed-size batches scored in parallel on a
//! dedicated rayon pool; each batch returns its own ranked list and the
//! coordinator merges them once. The merged top-K is identical to a
//! sequential scan and sort of the same snapshot.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::filter::{MetadataFilter, fingerprint_of};
use super::merge::{merge_top_k, top_k};
use crate::cache::{CacheMetrics, DEFAULT_MAX_ENTRIES, ResultCache};
use crate::error::{EmbeddingError, SearchError, ValidationError};
use crate::storage::VectorStore;
use crate::vector::{EmbeddingGenerator, SearchResult, Vector, conformed, cosine_similarity};

/// Tunables for a [`SearchEngine`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchOptions {
    /// Vectors scored per parallel task.
    pub batch_size: usize,
    /// Threads in the scoring pool.
    pub worker_threads: usize,
    /// How long `close` waits for in-flight searches before cancelling them.
    pub shutdown_timeout: Duration,
    pub cache_max_entries: usize,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            worker_threads: num_cpus::get(),
            shutdown_timeout: Duration::from_secs(5),
            cache_max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

/// Parallel brute-force search engine with result caching.
pub struct SearchEngine {
    store: Arc<VectorStore>,
    cache: ResultCache,
    embedder: Option<Arc<dyn EmbeddingGenerator>>,
    pool: rayon::ThreadPool,
    options: SearchOptions,
    /// Store generation the cache contents belong to.
    cache_generation: Mutex<u64>,
    closed: AtomicBool,
    cancelled: AtomicBool,
    in_flight: Mutex<usize>,
    drained: Condvar,
}

impl std::fmt::Debug for SearchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchEngine")
            .field("store", &self.store)
            .field("options", &self.options)
            .field("has_embedder", &self.embedder.is_some())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Counts a search as in flight until dropped.
struct InFlight<'a>(&'a SearchEngine);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut count = self.0.in_flight.lock();
        *count -= 1;
        if *count == 0 {
            self.0.drained.notify_all();
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "batch task panicked".to_string()
    }
}

impl SearchEngine {
    /// Create a new engine over `store` with its own scoring pool and cache.
    pub fn new(store: Arc<VectorStore>, options: SearchOptions) -> Result<Self, SearchError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.worker_threads.max(1))
            .thread_name(|i| format!("plotarmor-search-{i}"))
            .build()
            .map_err(|e| SearchError::ThreadPool(e.to_string()))?;

        let generation = store.generation();
        tracing::debug!(
            batch_size = options.batch_size,
            worker_threads = options.worker_threads,
            "search engine started"
        );

        Ok(Self {
            store,
            cache: ResultCache::new(options.cache_max_entries),
            embedder: None,
            pool,
            options,
            cache_generation: Mutex::new(generation),
            closed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            in_flight: Mutex::new(0),
            drained: Condvar::new(),
        })
    }

    /// Attach the text embedding producer used by [`search_by_text`](Self::search_by_text).
    #[must_use]
    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingGenerator>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    #[must_use]
    pub fn options(&self) -> &SearchOptions {
        &self.options
    }

    #[must_use]
    pub fn cache_metrics(&self) -> CacheMetrics {
        self.cache.metrics()
    }

    fn enter(&self) -> Result<InFlight<'_>, SearchError> {
        let mut count = self.in_flight.lock();
        // Checked under the same lock `close` waits on, so no search slips
        // in after the drain started.
        if self.closed.load(Ordering::Acquire) {
            return Err(SearchError::ShuttingDown);
        }
        *count += 1;
        Ok(InFlight(self))
    }

    /// Returns the `top_k` stored vectors most similar to `query` that match
    /// `filter`, best first. `top_k == 0` yields an empty list.
    pub fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let _in_flight = self.enter()?;
        self.search_inner(query, top_k, filter)
    }

    /// Embeds `text` with the configured generator, then runs [`search`](Self::search).
    pub fn search_by_text(
        &self,
        text: &str,
        top_k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let _in_flight = self.enter()?;
        let embedder = self.embedder.as_ref().ok_or(EmbeddingError::NotConfigured)?;
        let query = embedder.generate_embedding(text)?;
        self.search_inner(&query, top_k, filter)
    }

    fn search_inner(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<SearchResult>, SearchError> {
        if query.is_empty() {
            return Err(ValidationError::EmptyQuery.into());
        }
        if let Some(index) = query.iter().position(|v| !v.is_finite()) {
            return Err(ValidationError::NonFiniteValue {
                id: "<query>".to_string(),
                index,
            }
            .into());
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let started = Instant::now();
        let query = conformed(query, self.store.dimension());
        let fingerprint = fingerprint_of(filter);

        self.sync_cache_generation();
        if let Some(hit) = self.cache.get(&query, k, &fingerprint) {
            tracing::debug!(top_k = k, elapsed = ?started.elapsed(), "search served from cache");
            return Ok(hit.to_vec());
        }

        let snapshot = self.store.snapshot()?;
        let results = self.score(&query, k, filter, &snapshot.vectors)?;

        {
            let cached = self.cache_generation.lock();
            if *cached == snapshot.generation {
                self.cache.put(&query, k, &fingerprint, results.clone());
            }
        }

        tracing::debug!(
            top_k = k,
            scanned = snapshot.vectors.len(),
            returned = results.len(),
            elapsed = ?started.elapsed(),
            "search completed"
        );
        Ok(results)
    }

    /// Drops cached results computed against an older store generation.
    fn sync_cache_generation(&self) {
        let current = self.store.generation();
        let mut cached = self.cache_generation.lock();
        if *cached != current {
            self.cache.clear();
            *cached = current;
        }
    }

    /// Scores `vectors` in parallel batches and merges the batch rankings.
    fn score(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
        vectors: &[Arc<Vector>],
    ) -> Result<Vec<SearchResult>, SearchError> {
        if self.cancelled.load(Ordering::Acquire) {
            return Err(SearchError::Cancelled);
        }
        let batch_size = self.options.batch_size.max(1);

        let batches = self.pool.install(|| {
            vectors
                .par_chunks(batch_size)
                .enumerate()
                .map(|(batch, chunk)| {
                    panic::catch_unwind(AssertUnwindSafe(|| {
                        self.score_batch(batch, query, k, filter, chunk)
                    }))
                    .unwrap_or_else(|payload| {
                        Err(SearchError::TaskFailed {
                            batch,
                            reason: panic_message(payload),
                        })
                    })
                })
                .collect::<Result<Vec<_>, SearchError>>()
        })?;

        Ok(merge_top_k(batches, k))
    }

    fn score_batch(
        &self,
        batch: usize,
        query: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
        chunk: &[Arc<Vector>],
    ) -> Result<Vec<SearchResult>, SearchError> {
        let mut local = Vec::new();
        for vector in chunk {
            if self.cancelled.load(Ordering::Relaxed) {
                return Err(SearchError::Cancelled);
            }
            if filter.is_some_and(|f| !f.matches(vector)) {
                continue;
            }
            let similarity =
                cosine_similarity(query, &vector.values).map_err(|e| SearchError::TaskFailed {
                    batch,
                    reason: format!("vector '{}': {e}", vector.id),
                })?;
            local.push(SearchResult::new(Arc::clone(vector), similarity));
        }
        Ok(top_k(local, k))
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stops accepting searches, waits up to `timeout` for in-flight ones,
    /// then cancels whatever is left and clears the cache.
    ///
    /// Returns `true` when every in-flight search finished on its own.
    /// Idempotent.
    pub fn close(&self, timeout: Duration) -> bool {
        let mut count = self.in_flight.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return *count == 0 || self.cancelled.load(Ordering::Acquire);
        }

        let deadline = Instant::now() + timeout;
        while *count > 0 {
            if self.drained.wait_until(&mut count, deadline).timed_out() {
                break;
            }
        }
        let drained = *count == 0;
        if !drained {
            tracing::warn!(
                in_flight = *count,
                ?timeout,
                "searches did not finish in time, cancelling"
            );
            self.cancelled.store(true, Ordering::Release);
        }
        drop(count);

        self.cache.clear();
        tracing::info!(drained, "search engine closed");
        drained
    }
}

impl Drop for SearchEngine {
    fn drop(&mut self) {
        self.close(self.options.shutdown_timeout);
    }
}
