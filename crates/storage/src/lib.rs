//! Storage engine for ringkv: WAL + memtable + immutable segments.
//!
//! Records are `{key, value, timestamp}` with a missing value meaning
//! tombstone. The WAL provides durability, the memtable absorbs recent
//! writes, and a background thread flushes full memtables into segments.

pub mod engine;
pub mod memtable;
pub mod record;
pub mod segment;
pub mod wal;

pub use engine::{PutOutcome, StorageEngine, StorageError, StorageOptions, StorageStats};
pub use wal::FsyncPolicy;
