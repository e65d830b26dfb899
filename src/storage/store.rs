//! Persistent vector store.
//!
//! The live dataset is an ordered in-memory map behind a single task-fair
//! reader/writer lock. Every mutation is framed into the write-ahead log
//! before it becomes visible, and a background compaction folds the log into
//! a fresh snapshot once it grows past a threshold.
//!
//! Lock order: `compaction` mutex, then the `state` lock. Readers copy `Arc`s
//! out under the shared lock and never hold it while doing real work.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use super::backup;
use super::log::{self, Durability, FileKind, LogRecord, WalWriter};
use crate::error::{StorageError, StorageResult};
use crate::vector::{Vector, VectorDimension, conform};

/// Tunables for opening a [`VectorStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageOptions {
    /// Width every stored vector is conformed to.
    pub dimension: VectorDimension,
    /// Compress log and snapshot frames with lz4.
    pub compression: bool,
    pub durability: Durability,
    /// Threads available for background compaction.
    pub background_jobs: usize,
    /// WAL records accumulated before a compaction is scheduled.
    pub compaction_threshold: u64,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            dimension: VectorDimension::default(),
            compression: true,
            durability: Durability::Sync,
            background_jobs: 4,
            compaction_threshold: 4096,
        }
    }
}

/// Storage health counters. Reading them never takes the dataset lock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStatistics {
    pub key_count: usize,
    /// Records written since the last snapshot.
    pub wal_records: u64,
    pub wal_bytes: u64,
    /// Background compactions queued or running.
    pub pending_jobs: usize,
    pub compactions: u64,
    /// Rough size of the in-memory dataset.
    pub approximate_memory_bytes: u64,
    /// Mutation counter, see [`VectorStore::generation`].
    pub generation: u64,
    /// Generation of the active on-disk WAL.
    pub disk_generation: u64,
}

/// A consistent copy of the dataset and the mutation generation it reflects.
#[derive(Debug, Clone)]
pub struct StoreSnapshot {
    pub generation: u64,
    pub vectors: Vec<Arc<Vector>>,
}

#[derive(Debug)]
struct StoreState {
    vectors: BTreeMap<String, Arc<Vector>>,
    /// `None` once the store is closed.
    wal: Option<WalWriter>,
    disk_generation: u64,
}

#[derive(Debug, Default)]
struct Counters {
    key_count: AtomicUsize,
    wal_records: AtomicU64,
    wal_bytes: AtomicU64,
    pending_jobs: AtomicUsize,
    compactions: AtomicU64,
    memory_bytes: AtomicU64,
    generation: AtomicU64,
    disk_generation: AtomicU64,
}

#[derive(Debug)]
struct StoreInner {
    dir: PathBuf,
    options: StorageOptions,
    state: RwLock<StoreState>,
    compaction: Mutex<()>,
    closed: AtomicBool,
    counters: Counters,
}

/// Persistent, lockable key-value store of vectors keyed by ID.
pub struct VectorStore {
    inner: Arc<StoreInner>,
    jobs: rayon::ThreadPool,
}

impl std::fmt::Debug for VectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorStore")
            .field("dir", &self.inner.dir)
            .field("options", &self.inner.options)
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn approximate_size(vector: &Vector) -> u64 {
    let metadata: usize = vector.metadata.iter().map(|(k, v)| k.len() + v.len()).sum();
    (vector.id.len() + vector.values.len() * std::mem::size_of::<f32>() + metadata + 64) as u64
}

impl VectorStore {
    /// Opens the store in `dir`, creating it if empty, and recovers its state
    /// from the newest snapshot plus every later WAL.
    pub fn open(dir: impl AsRef<Path>, options: StorageOptions) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| StorageError::io("create store directory", e))?;
        log::remove_temp_files(&dir)?;

        let current = match log::read_current(&dir)? {
            Some(generation) => generation,
            None => {
                log::write_current(&dir, 0)?;
                0
            }
        };

        let mut vectors = BTreeMap::new();
        let snapshot = log::snapshot_path(&dir, current);
        if snapshot.exists() {
            for vector in log::read_snapshot(&snapshot)? {
                vectors.insert(vector.id.clone(), vector);
            }
        } else if current > 0 {
            return Err(StorageError::Corrupted {
                path: snapshot,
                reason: format!("CURRENT names generation {current} but its snapshot is missing"),
            });
        }
        let snapshot_keys = vectors.len();

        let mut active = current;
        let mut wal_records = 0u64;
        let mut wal_bytes = 0u64;
        for (kind, generation, path) in log::list_generation_files(&dir)? {
            if generation < current {
                // Left behind by a compaction that crashed before cleanup.
                if let Err(e) = std::fs::remove_file(&path) {
                    tracing::warn!(path = %path.display(), "failed to remove stale file: {e}");
                }
                continue;
            }
            if kind != FileKind::Wal {
                continue;
            }
            let (records, stats) = log::replay_wal(&path)?;
            for record in records {
                apply(&mut vectors, record);
            }
            wal_records += stats.records as u64;
            wal_bytes += stats.bytes;
            active = active.max(generation);
            tracing::debug!(
                wal = %path.display(),
                records = stats.records,
                truncated = stats.truncated_at.is_some(),
                "replayed WAL"
            );
        }

        let wal = WalWriter::open(log::wal_path(&dir, active), options.durability)?;

        let counters = Counters::default();
        counters.key_count.store(vectors.len(), Ordering::Relaxed);
        counters.wal_records.store(wal_records, Ordering::Relaxed);
        counters.wal_bytes.store(wal_bytes, Ordering::Relaxed);
        counters.memory_bytes.store(
            vectors.values().map(|v| approximate_size(v)).sum(),
            Ordering::Relaxed,
        );
        counters.disk_generation.store(active, Ordering::Relaxed);

        tracing::info!(
            path = %dir.display(),
            snapshot_generation = current,
            snapshot_keys,
            wal_records,
            keys = vectors.len(),
            "opened vector store"
        );

        let jobs = rayon::ThreadPoolBuilder::new()
            .num_threads(options.background_jobs.max(1))
            .thread_name(|i| format!("plotarmor-compact-{i}"))
            .build()
            .map_err(|e| StorageError::ThreadPool(e.to_string()))?;

        let store = Self {
            inner: Arc::new(StoreInner {
                dir,
                options,
                state: RwLock::new(StoreState {
                    vectors,
                    wal: Some(wal),
                    disk_generation: active,
                }),
                compaction: Mutex::new(()),
                closed: AtomicBool::new(false),
                counters,
            }),
            jobs,
        };
        store.maybe_schedule_compaction();
        Ok(store)
    }

    /// Directory this store lives in.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.inner.dir
    }

    #[must_use]
    pub fn options(&self) -> &StorageOptions {
        &self.inner.options
    }

    #[must_use]
    pub fn dimension(&self) -> VectorDimension {
        self.inner.options.dimension
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.is_closed() {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    fn prepare(&self, mut vector: Vector) -> StorageResult<Arc<Vector>> {
        vector.validate()?;
        conform(&mut vector.values, self.inner.options.dimension);
        Ok(Arc::new(vector))
    }

    /// Validates, conforms and durably stores one vector. Last write wins.
    pub fn store(&self, vector: Vector) -> StorageResult<()> {
        self.ensure_open()?;
        let vector = self.prepare(vector)?;
        let key = vector.id.clone();
        self.commit(LogRecord::Put { vector }, Some(&key))
    }

    /// Stores every vector as one atomic unit. If any element is invalid or
    /// the write fails, none of them become visible.
    pub fn store_batch(&self, vectors: Vec<Vector>) -> StorageResult<()> {
        self.ensure_open()?;
        if vectors.is_empty() {
            return Ok(());
        }
        let vectors = vectors
            .into_iter()
            .map(|v| self.prepare(v))
            .collect::<StorageResult<Vec<_>>>()?;
        self.commit(LogRecord::Batch { vectors }, None)
    }

    /// Removes `id`. Returns whether it was present; deleting an absent ID is
    /// a no-op and writes nothing.
    pub fn delete(&self, id: &str) -> StorageResult<bool> {
        self.ensure_open()?;
        if !self.inner.state.read().vectors.contains_key(id) {
            return Ok(false);
        }
        // Re-checked under the write lock: a racing delete may have won.
        self.commit_if(
            LogRecord::Delete { id: id.to_string() },
            Some(id),
            |vectors| vectors.contains_key(id),
        )
    }

    fn commit(&self, record: LogRecord, key: Option<&str>) -> StorageResult<()> {
        self.commit_if(record, key, |_| true).map(|_| ())
    }

    /// Encodes outside the lock, then appends and applies under the exclusive
    /// lock if `precondition` holds there. The map only changes once the
    /// append succeeded. Returns whether the record was written.
    fn commit_if(
        &self,
        record: LogRecord,
        key: Option<&str>,
        precondition: impl FnOnce(&BTreeMap<String, Arc<Vector>>) -> bool,
    ) -> StorageResult<bool> {
        let frame = log::encode_frame(&record, self.inner.options.compression)?;
        {
            let mut state = self.inner.state.write();
            let StoreState { vectors, wal, .. } = &mut *state;
            let wal = wal.as_mut().ok_or(StorageError::Closed)?;
            if !precondition(vectors) {
                return Ok(false);
            }
            wal.append(&frame, key)?;

            let counters = &self.inner.counters;
            let (added, removed) = apply_tracked(vectors, record);
            counters.memory_bytes.fetch_add(added, Ordering::Relaxed);
            counters.memory_bytes.fetch_sub(removed, Ordering::Relaxed);
            counters.key_count.store(vectors.len(), Ordering::Relaxed);
            counters.wal_records.fetch_add(1, Ordering::Relaxed);
            counters
                .wal_bytes
                .fetch_add(frame.len() as u64, Ordering::Relaxed);
            counters.generation.fetch_add(1, Ordering::Release);
        }
        self.maybe_schedule_compaction();
        Ok(true)
    }

    /// Returns the vector stored under `id`, or `None` if absent.
    pub fn retrieve(&self, id: &str) -> StorageResult<Option<Arc<Vector>>> {
        self.ensure_open()?;
        Ok(self.inner.state.read().vectors.get(id).cloned())
    }

    /// Looks up several IDs under one shared-lock hold. Missing IDs are
    /// omitted; results follow input order.
    pub fn retrieve_batch<S: AsRef<str>>(&self, ids: &[S]) -> StorageResult<Vec<Arc<Vector>>> {
        self.ensure_open()?;
        let state = self.inner.state.read();
        Ok(ids
            .iter()
            .filter_map(|id| state.vectors.get(id.as_ref()).cloned())
            .collect())
    }

    /// Every stored vector, ordered by ID.
    pub fn scan_all(&self) -> StorageResult<Vec<Arc<Vector>>> {
        Ok(self.snapshot()?.vectors)
    }

    /// Every stored vector plus the mutation generation it was taken at.
    pub fn snapshot(&self) -> StorageResult<StoreSnapshot> {
        self.ensure_open()?;
        let state = self.inner.state.read();
        Ok(StoreSnapshot {
            generation: self.inner.counters.generation.load(Ordering::Acquire),
            vectors: state.vectors.values().cloned().collect(),
        })
    }

    /// Ordered scan from `start` (inclusive, or the first key) up to `end`
    /// (inclusive), returning at most `limit` vectors.
    pub fn scan_range(
        &self,
        start: Option<&str>,
        end: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<Arc<Vector>>> {
        self.ensure_open()?;
        if let (Some(start), Some(end)) = (start, end)
            && start > end
        {
            return Ok(Vec::new());
        }
        let lower = start.map_or(Bound::Unbounded, Bound::Included);
        let upper = end.map_or(Bound::Unbounded, Bound::Included);

        let state = self.inner.state.read();
        Ok(state
            .vectors
            .range::<str, _>((lower, upper))
            .take(limit)
            .map(|(_, v)| Arc::clone(v))
            .collect())
    }

    /// Ordered scan of IDs beginning with `prefix`, at most `limit` vectors.
    pub fn scan_prefix(&self, prefix: &str, limit: usize) -> StorageResult<Vec<Arc<Vector>>> {
        self.ensure_open()?;
        let state = self.inner.state.read();
        Ok(state
            .vectors
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(id, _)| id.starts_with(prefix))
            .take(limit)
            .map(|(_, v)| Arc::clone(v))
            .collect())
    }

    /// Number of stored vectors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.counters.key_count.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Monotonic counter bumped by every successful mutation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.inner.counters.generation.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn statistics(&self) -> StoreStatistics {
        let c = &self.inner.counters;
        StoreStatistics {
            key_count: c.key_count.load(Ordering::Relaxed),
            wal_records: c.wal_records.load(Ordering::Relaxed),
            wal_bytes: c.wal_bytes.load(Ordering::Relaxed),
            pending_jobs: c.pending_jobs.load(Ordering::Relaxed),
            compactions: c.compactions.load(Ordering::Relaxed),
            approximate_memory_bytes: c.memory_bytes.load(Ordering::Relaxed),
            generation: c.generation.load(Ordering::Acquire),
            disk_generation: c.disk_generation.load(Ordering::Relaxed),
        }
    }

    /// Writes a consistent point-in-time copy to `dest`, replacing anything
    /// already there. The shared lock is held only while the snapshot is cut.
    pub fn create_backup(&self, dest: impl AsRef<Path>) -> StorageResult<()> {
        let snapshot = self.snapshot()?;
        backup::write_backup(
            dest.as_ref(),
            &self.inner.dir,
            &snapshot.vectors,
            self.inner.options.compression,
        )
    }

    /// Backs up into `base/backup_YYYYMMDD_HHMMSS` and returns that path.
    pub fn create_timestamped_backup(&self, base: impl AsRef<Path>) -> StorageResult<PathBuf> {
        let dest = base.as_ref().join(backup::timestamped_backup_name());
        self.create_backup(&dest)?;
        Ok(dest)
    }

    /// Folds the WAL into a fresh snapshot now, on the calling thread.
    pub fn compact(&self) -> StorageResult<()> {
        self.ensure_open()?;
        self.inner.compact()
    }

    fn maybe_schedule_compaction(&self) {
        let counters = &self.inner.counters;
        if counters.wal_records.load(Ordering::Relaxed) < self.inner.options.compaction_threshold
            || self.is_closed()
        {
            return;
        }
        // One queued job at a time is enough: it snapshots everything.
        if counters
            .pending_jobs
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }

        let inner = Arc::clone(&self.inner);
        self.jobs.spawn(move || {
            if !inner.closed.load(Ordering::Acquire)
                && let Err(e) = inner.compact()
            {
                tracing::warn!(path = %inner.dir.display(), "background compaction failed: {e}");
            }
            inner.counters.pending_jobs.fetch_sub(1, Ordering::AcqRel);
        });
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Flushes the WAL and releases file handles. Idempotent; every later
    /// operation fails with [`StorageError::Closed`].
    pub fn close(&self) -> StorageResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let _compaction = self.inner.compaction.lock();
        let mut state = self.inner.state.write();
        if let Some(mut wal) = state.wal.take() {
            wal.sync()?;
        }
        tracing::info!(path = %self.inner.dir.display(), "closed vector store");
        Ok(())
    }
}

impl Drop for VectorStore {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(path = %self.inner.dir.display(), "error while closing store: {e}");
        }
    }
}

impl StoreInner {
    fn compact(&self) -> StorageResult<()> {
        let _guard = self.compaction.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(StorageError::Closed);
        }

        let (vectors, generation) = {
            let mut state = self.state.write();
            let next = state.disk_generation + 1;
            let wal = state.wal.as_mut().ok_or(StorageError::Closed)?;
            wal.sync()?;
            state.wal = Some(WalWriter::open(
                log::wal_path(&self.dir, next),
                self.options.durability,
            )?);
            state.disk_generation = next;
            self.counters.wal_records.store(0, Ordering::Relaxed);
            self.counters.wal_bytes.store(0, Ordering::Relaxed);
            self.counters.disk_generation.store(next, Ordering::Relaxed);
            (
                state.vectors.values().cloned().collect::<Vec<_>>(),
                next,
            )
        };

        let bytes = log::write_snapshot(&self.dir, generation, &vectors, self.options.compression)?;
        log::write_current(&self.dir, generation)?;

        for (_, old, path) in log::list_generation_files(&self.dir)? {
            if old < generation
                && let Err(e) = std::fs::remove_file(&path)
            {
                tracing::warn!(path = %path.display(), "failed to remove compacted file: {e}");
            }
        }

        self.counters.compactions.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            path = %self.dir.display(),
            generation,
            keys = vectors.len(),
            snapshot_bytes = bytes,
            "compacted vector store"
        );
        Ok(())
    }
}

fn apply(vectors: &mut BTreeMap<String, Arc<Vector>>, record: LogRecord) {
    apply_tracked(vectors, record);
}

/// Applies a record and returns the approximate bytes added and removed.
fn apply_tracked(vectors: &mut BTreeMap<String, Arc<Vector>>, record: LogRecord) -> (u64, u64) {
    let puts = match record {
        LogRecord::Put { vector } => vec![vector],
        LogRecord::Batch { vectors: batch } => batch,
        LogRecord::Delete { id } => {
            let removed = vectors.remove(&id).map_or(0, |old| approximate_size(&old));
            return (0, removed);
        }
    };

    let mut added = 0;
    let mut removed = 0;
    for vector in puts {
        added += approximate_size(&vector);
        if let Some(old) = vectors.insert(vector.id.clone(), vector) {
            removed += approximate_size(&old);
        }
    }
    (added, removed)
}
