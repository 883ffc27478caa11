//! Storage engine: WAL + memtable + immutable segments.
//!
//! All writes go through the WAL first (for durability), then into the
//! active memtable. A dedicated flush thread periodically swaps a full
//! memtable into the flushing slot and writes it out as a new segment.
//! Reads consult the active memtable, then the flushing snapshot, then every
//! segment, and the entry with the largest timestamp wins.
//!
//! Lock order is always WAL, then memtables. Puts hold the WAL lock from the
//! staleness check through the memtable insert and the flush swap takes both, so every WAL record
//! before the recorded boundary belongs to the swapped-out snapshot.

use crate::memtable::Memtable;
use crate::segment::{self, Segment, SegmentError, SegmentWriter};
use crate::wal::{FsyncPolicy, Wal, WalError};
use parking_lot::{Mutex, RwLock};
use ringkv_common::Item;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const WAL_FILE: &str = "wal.log";
pub const SEGMENTS_DIR: &str = "segments";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),
    #[error("segment error: {0}")]
    Segment(#[from] SegmentError),
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunables for a storage engine instance.
#[derive(Debug, Clone)]
pub struct StorageOptions {
    pub fsync: FsyncPolicy,
    /// Active memtable size that triggers a flush.
    pub flush_threshold_bytes: usize,
    /// How often the flush thread wakes up.
    pub flush_interval: Duration,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            fsync: FsyncPolicy::Batch,
            flush_threshold_bytes: 4 * 1024 * 1024,
            flush_interval: Duration::from_millis(500),
        }
    }
}

/// What a put did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// No live value existed for the key.
    Inserted,
    /// A live value was replaced.
    Updated,
    /// A newer entry already exists; nothing was written.
    Superseded,
}

/// Point-in-time counters for logging and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageStats {
    pub memtable_keys: usize,
    pub memtable_bytes: usize,
    pub flush_pending: bool,
    pub segments: usize,
}

#[derive(Debug, Default)]
struct Memtables {
    active: Memtable,
    /// Snapshot being written to a segment; immutable and still readable.
    flushing: Option<Arc<Memtable>>,
    /// WAL offset at which `flushing` was swapped out.
    flush_boundary: u64,
}

#[derive(Debug)]
struct EngineShared {
    data_dir: PathBuf,
    segments_dir: PathBuf,
    options: StorageOptions,
    wal: Mutex<Wal>,
    memtables: RwLock<Memtables>,
    segments: RwLock<Vec<Arc<Segment>>>,
    /// Serializes flush cycles (background thread and `flush_now`).
    flush_lock: Mutex<()>,
    clock: AtomicU64,
}

#[derive(Debug)]
struct FlushWorker {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// The storage engine. Operations are synchronous and internally locked;
/// share it behind an `Arc`.
#[derive(Debug)]
pub struct StorageEngine {
    shared: Arc<EngineShared>,
    worker: Option<FlushWorker>,
}

impl StorageEngine {
    /// Open or create a storage engine at the given directory and start its
    /// flush thread.
    pub fn open(data_dir: &Path, options: StorageOptions) -> Result<Self, StorageError> {
        std::fs::create_dir_all(data_dir)?;
        let wal_path = data_dir.join(WAL_FILE);
        let segments_dir = data_dir.join(SEGMENTS_DIR);

        let segments = segment::load_segments(&segments_dir)?;
        let (wal, items) = Wal::recover(&wal_path, options.fsync)?;

        let mut max_ts = 0u64;
        for segment in &segments {
            for item in segment.items()? {
                max_ts = max_ts.max(item.timestamp);
            }
        }

        let mut active = Memtable::new();
        for item in items {
            max_ts = max_ts.max(item.timestamp);
            active.insert(item);
        }

        tracing::info!(
            "storage engine opened at {:?}: {} keys recovered from WAL, {} segment(s)",
            data_dir,
            active.len(),
            segments.len()
        );

        let shared = Arc::new(EngineShared {
            data_dir: data_dir.to_path_buf(),
            segments_dir,
            options,
            wal: Mutex::new(wal),
            memtables: RwLock::new(Memtables {
                active,
                ..Memtables::default()
            }),
            segments: RwLock::new(segments.into_iter().map(Arc::new).collect()),
            flush_lock: Mutex::new(()),
            clock: AtomicU64::new(max_ts),
        });

        let worker = spawn_flush_worker(shared.clone())?;
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// The directory this engine persists to.
    pub fn data_dir(&self) -> &Path {
        &self.shared.data_dir
    }

    /// Give `item` a timestamp from the engine clock if it has none, so the
    /// caller can forward exactly what gets stored.
    pub fn assign_timestamp(&self, item: &mut Item) {
        if item.timestamp == 0 {
            item.timestamp = self.shared.next_timestamp();
        } else {
            self.shared.clock.fetch_max(item.timestamp, Ordering::AcqRel);
        }
    }

    /// Write an item. A zero timestamp is replaced by the engine clock;
    /// an explicit timestamp older than the stored entry is ignored.
    pub fn put(&self, mut item: Item) -> Result<PutOutcome, StorageError> {
        self.assign_timestamp(&mut item);

        let mut wal = self.shared.wal.lock();
        let existing = self.shared.lookup(&item.key)?;
        let outcome = match &existing {
            Some(current) if current.timestamp > item.timestamp => {
                tracing::debug!(
                    "ignoring stale write for {:?} ({} < {})",
                    item.key,
                    item.timestamp,
                    current.timestamp
                );
                return Ok(PutOutcome::Superseded);
            }
            Some(current) if !current.is_tombstone() => PutOutcome::Updated,
            _ => PutOutcome::Inserted,
        };

        wal.append(&item)?;
        let mut tables = self.shared.memtables.write();
        tables.active.insert(item);
        Ok(outcome)
    }

    /// Write a tombstone for `key`.
    pub fn delete(&self, key: &str) -> Result<PutOutcome, StorageError> {
        self.put(Item::tombstone(key))
    }

    /// The live value for a key, or `None` if absent or deleted.
    pub fn get(&self, key: &str) -> Result<Option<Item>, StorageError> {
        Ok(self
            .shared
            .lookup(key)?
            .filter(|item| !item.is_tombstone()))
    }

    /// Live items whose key contains `pattern`, in key order.
    pub fn scan(&self, pattern: &str) -> Result<Vec<Item>, StorageError> {
        Ok(self
            .shared
            .merged(pattern)?
            .into_values()
            .filter(|item| !item.is_tombstone())
            .collect())
    }

    /// The newest entry for every key, tombstones included, in key order.
    pub fn entries(&self) -> Result<Vec<Item>, StorageError> {
        Ok(self.shared.merged("")?.into_values().collect())
    }

    /// Flush the active memtable now, regardless of the size threshold.
    /// Returns whether a segment was written.
    pub fn flush_now(&self) -> Result<bool, StorageError> {
        self.shared.flush(true)
    }

    /// Sync the WAL to disk (for batch fsync mode).
    pub fn sync(&self) -> Result<(), StorageError> {
        self.shared.wal.lock().sync()?;
        Ok(())
    }

    pub fn stats(&self) -> StorageStats {
        let tables = self.shared.memtables.read();
        StorageStats {
            memtable_keys: tables.active.len(),
            memtable_bytes: tables.active.size_bytes(),
            flush_pending: tables.flushing.is_some(),
            segments: self.shared.segments.read().len(),
        }
    }
}

impl Drop for StorageEngine {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop.send(());
            if worker.handle.join().is_err() {
                tracing::error!("flush thread panicked");
            }
        }
    }
}

impl EngineShared {
    fn next_timestamp(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64;
        let mut last = self.clock.load(Ordering::Acquire);
        loop {
            let next = now.max(last.saturating_add(1));
            match self
                .clock
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }

    /// Newest entry for a key across all levels, tombstones included.
    fn lookup(&self, key: &str) -> Result<Option<Item>, StorageError> {
        {
            let tables = self.memtables.read();
            let active = tables.active.get(key);
            let flushing = tables.flushing.as_ref().and_then(|f| f.get(key));
            let newest = match (active, flushing) {
                (Some(a), Some(f)) if f.timestamp > a.timestamp => Some(f),
                (Some(a), _) => Some(a),
                (None, f) => f,
            };
            if let Some(item) = newest {
                return Ok(Some(item.clone()));
            }
        }

        let segments = self.segments.read().clone();
        let mut newest: Option<Item> = None;
        for segment in &segments {
            if let Some(found) = segment.get(key)? {
                if newest
                    .as_ref()
                    .map_or(true, |n| found.timestamp > n.timestamp)
                {
                    newest = Some(found);
                }
            }
        }
        Ok(newest)
    }

    /// Newest entry per key (tombstones included) for keys containing `pattern`.
    fn merged(&self, pattern: &str) -> Result<BTreeMap<String, Item>, StorageError> {
        fn keep_newest(out: &mut BTreeMap<String, Item>, item: Item) {
            match out.get(&item.key) {
                Some(existing) if existing.timestamp >= item.timestamp => {}
                _ => {
                    out.insert(item.key.clone(), item);
                }
            }
        }

        // Memtables first so that a concurrent flush publishing its segment
        // can only make data visible twice, never zero times.
        let (active, flushing): (Vec<Item>, Vec<Item>) = {
            let tables = self.memtables.read();
            (
                tables.active.matching(pattern).cloned().collect(),
                tables
                    .flushing
                    .as_ref()
                    .map(|f| f.matching(pattern).cloned().collect())
                    .unwrap_or_default(),
            )
        };

        let mut out = BTreeMap::new();
        let segments = self.segments.read().clone();
        for segment in &segments {
            for item in segment.matching(pattern)? {
                keep_newest(&mut out, item);
            }
        }
        for item in flushing.into_iter().chain(active) {
            keep_newest(&mut out, item);
        }
        Ok(out)
    }

    /// Move the active memtable into the flushing slot if it qualifies.
    fn swap(&self, force: bool) -> Option<(Arc<Memtable>, u64)> {
        let wal = self.wal.lock();
        let mut tables = self.memtables.write();
        if tables.active.is_empty()
            || (!force && tables.active.size_bytes() < self.options.flush_threshold_bytes)
        {
            return None;
        }
        let snapshot = Arc::new(std::mem::take(&mut tables.active));
        tables.flushing = Some(snapshot.clone());
        tables.flush_boundary = wal.len();
        Some((snapshot, tables.flush_boundary))
    }

    /// One flush cycle. A snapshot left behind by a failed cycle is retried
    /// before a new one is swapped in.
    fn flush(&self, force: bool) -> Result<bool, StorageError> {
        let _serial = self.flush_lock.lock();

        let pending = {
            let tables = self.memtables.read();
            tables
                .flushing
                .clone()
                .map(|snapshot| (snapshot, tables.flush_boundary))
        };
        let (snapshot, boundary) = match pending.or_else(|| self.swap(force)) {
            Some(p) => p,
            None => return Ok(false),
        };

        let segment = self.write_segment(&snapshot)?;
        tracing::info!(
            "flushed {} entries into segment {}",
            segment.len(),
            segment.id()
        );

        self.segments.write().push(Arc::new(segment));
        self.memtables.write().flushing = None;
        self.wal.lock().append_flush_marker(boundary)?;
        Ok(true)
    }

    fn write_segment(&self, snapshot: &Memtable) -> Result<Segment, StorageError> {
        let mut writer = SegmentWriter::create(&self.segments_dir)?;
        for item in snapshot.iter() {
            if let Err(e) = writer.append(item) {
                writer.abandon();
                return Err(e.into());
            }
        }
        Ok(writer.finish()?)
    }
}

fn spawn_flush_worker(shared: Arc<EngineShared>) -> Result<FlushWorker, std::io::Error> {
    let (stop, stop_rx) = mpsc::channel::<()>();
    let interval = shared.options.flush_interval;

    let handle = std::thread::Builder::new()
        .name("ringkv-flush".into())
        .spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }

            if shared.options.fsync == FsyncPolicy::Batch {
                if let Err(e) = shared.wal.lock().sync() {
                    tracing::warn!("WAL sync failed: {}", e);
                }
            }
            if let Err(e) = shared.flush(false) {
                tracing::error!("memtable flush failed, retrying next cycle: {}", e);
            }
        })?;

    Ok(FlushWorker { stop, handle })
}
