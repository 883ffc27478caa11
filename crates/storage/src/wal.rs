//! Write-Ahead Log (WAL) for durability.
//!
//! Entries use the data record format from [`crate::record`]. A flush marker
//! records the byte offset up to which everything already lives in a segment;
//! on recovery only items at or after the last marker's boundary are replayed.
//! A torn or corrupt tail is truncated away before appending resumes.

use crate::record::{self, RecordError, WalRecord, DATA_HEADER_LEN};
use ringkv_common::Item;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("WAL I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("WAL record error: {0}")]
    Record(#[from] RecordError),
}

/// Fsync policy for the WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsyncPolicy {
    /// Fsync after every write.
    Always,
    /// Fsync periodically (caller controls).
    Batch,
    /// Never explicitly fsync (OS decides).
    None,
}

impl FsyncPolicy {
    pub fn from_str_config(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "always" => Self::Always,
            "none" => Self::None,
            _ => Self::Batch,
        }
    }
}

/// Result of scanning a WAL file.
#[derive(Debug, Default)]
pub struct WalReplay {
    /// Items written after the last flush boundary, in log order.
    pub items: Vec<Item>,
    /// Number of flush markers seen.
    pub markers: usize,
    /// Length of the well-formed prefix of the file.
    pub valid_len: u64,
}

/// An append-only write-ahead log.
#[derive(Debug)]
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    fsync: FsyncPolicy,
    len: u64,
    entries_written: u64,
}

impl Wal {
    /// Open or create a WAL file at the given path, appending at its end.
    pub fn open(path: &Path, fsync: FsyncPolicy) -> Result<Self, WalError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            fsync,
            len,
            entries_written: 0,
        })
    }

    /// Replay the WAL, cut off any torn tail, and open it for appending.
    pub fn recover(path: &Path, fsync: FsyncPolicy) -> Result<(Self, Vec<Item>), WalError> {
        let replay = Self::replay(path)?;
        if let Ok(meta) = std::fs::metadata(path) {
            if meta.len() > replay.valid_len {
                tracing::warn!(
                    "truncating WAL {:?} from {} to {} bytes",
                    path,
                    meta.len(),
                    replay.valid_len
                );
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(replay.valid_len)?;
                file.sync_all()?;
            }
        }
        let wal = Self::open(path, fsync)?;
        Ok((wal, replay.items))
    }

    /// Append an item. Returns the byte offset the record starts at.
    pub fn append(&mut self, item: &Item) -> Result<u64, WalError> {
        let mut buf = Vec::with_capacity(record::encoded_len(item));
        record::encode_item(item, &mut buf);
        self.write_entry(&buf)
    }

    /// Append a flush marker declaring everything before `boundary` flushed.
    pub fn append_flush_marker(&mut self, boundary: u64) -> Result<u64, WalError> {
        let mut buf = Vec::with_capacity(DATA_HEADER_LEN);
        record::encode_flush_marker(boundary, &mut buf);
        self.write_entry(&buf)
    }

    fn write_entry(&mut self, buf: &[u8]) -> Result<u64, WalError> {
        let offset = self.len;
        self.writer.write_all(buf)?;
        self.writer.flush()?;

        if self.fsync == FsyncPolicy::Always {
            self.writer.get_ref().sync_all()?;
        }

        self.len += buf.len() as u64;
        self.entries_written += 1;
        Ok(offset)
    }

    /// Explicitly fsync the WAL (for batch mode).
    pub fn sync(&mut self) -> Result<(), WalError> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Current length of the log in bytes, i.e. the offset of the next entry.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of entries written since open.
    pub fn entries_written(&self) -> u64 {
        self.entries_written
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Scan a WAL file. Stops at the first torn or corrupt entry.
    pub fn replay(path: &Path) -> Result<WalReplay, WalError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(WalReplay::default()),
            Err(e) => return Err(WalError::Io(e)),
        };

        let mut reader = BufReader::new(file);
        let mut entries: Vec<(u64, Item)> = Vec::new();
        let mut boundary = 0u64;
        let mut markers = 0usize;
        let mut offset = 0u64;

        loop {
            match record::decode_record(&mut reader) {
                Ok(None) => break,
                Ok(Some(WalRecord::Item(item))) => {
                    let len = record::encoded_len(&item) as u64;
                    entries.push((offset, item));
                    offset += len;
                }
                Ok(Some(WalRecord::FlushMarker { boundary: b })) => {
                    boundary = b;
                    markers += 1;
                    offset += DATA_HEADER_LEN as u64;
                }
                Err(RecordError::Io(e)) => return Err(WalError::Io(e)),
                Err(e) => {
                    tracing::warn!(
                        "WAL entry at offset {} unreadable ({}); stopping replay",
                        offset,
                        e
                    );
                    break;
                }
            }
        }

        let items = entries
            .into_iter()
            .filter(|(at, _)| *at >= boundary)
            .map(|(_, item)| item)
            .collect();

        Ok(WalReplay {
            items,
            markers,
            valid_len: offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_item(key: &str, value: &str, ts: u64) -> Item {
        Item::put(key, value).with_timestamp(ts)
    }

    #[test]
    fn test_wal_write_and_replay() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("test.wal");

        {
            let mut wal = Wal::open(&wal_path, FsyncPolicy::Always).unwrap();
            wal.append(&test_item("k1", "v1", 1)).unwrap();
            wal.append(&test_item("k2", "v2", 2)).unwrap();
            wal.append(&test_item("k3", "v3", 3)).unwrap();
            assert_eq!(wal.entries_written(), 3);
        }

        let replay = Wal::replay(&wal_path).unwrap();
        assert_eq!(replay.items.len(), 3);
        assert_eq!(replay.items[0].key, "k1");
        assert_eq!(replay.items[2].key, "k3");
        assert_eq!(replay.items[0].value.as_deref(), Some(&b"v1"[..]));
        assert_eq!(replay.markers, 0);
    }

    #[test]
    fn test_wal_replay_missing_file() {
        let dir = TempDir::new().unwrap();
        let replay = Wal::replay(&dir.path().join("empty.wal")).unwrap();
        assert!(replay.items.is_empty());
        assert_eq!(replay.valid_len, 0);
    }

    #[test]
    fn test_wal_replay_skips_flushed_prefix() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("marker.wal");

        {
            let mut wal = Wal::open(&wal_path, FsyncPolicy::None).unwrap();
            wal.append(&test_item("old1", "v", 1)).unwrap();
            wal.append(&test_item("old2", "v", 2)).unwrap();
            let boundary = wal.len();
            // Written after the swap but before the marker: must survive.
            wal.append(&test_item("new1", "v", 3)).unwrap();
            wal.append_flush_marker(boundary).unwrap();
            wal.append(&test_item("new2", "v", 4)).unwrap();
        }

        let replay = Wal::replay(&wal_path).unwrap();
        let keys: Vec<&str> = replay.items.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["new1", "new2"]);
        assert_eq!(replay.markers, 1);
    }

    #[test]
    fn test_wal_recover_truncates_torn_tail() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("trunc.wal");

        {
            let mut wal = Wal::open(&wal_path, FsyncPolicy::Always).unwrap();
            wal.append(&test_item("k1", "v1", 1)).unwrap();
            wal.append(&test_item("k2", "v2", 2)).unwrap();
            wal.append(&test_item("k3", "v3", 3)).unwrap();
        }
        {
            let file = OpenOptions::new().write(true).open(&wal_path).unwrap();
            let len = file.metadata().unwrap().len();
            file.set_len(len - 5).unwrap();
        }

        let (mut wal, items) = Wal::recover(&wal_path, FsyncPolicy::Always).unwrap();
        assert_eq!(items.len(), 2, "should recover 2 of 3 entries");
        wal.append(&test_item("k4", "v4", 4)).unwrap();
        drop(wal);

        let replay = Wal::replay(&wal_path).unwrap();
        let keys: Vec<&str> = replay.items.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["k1", "k2", "k4"]);
    }

    #[test]
    fn test_wal_tombstone_record() {
        let dir = TempDir::new().unwrap();
        let wal_path = dir.path().join("tomb.wal");

        {
            let mut wal = Wal::open(&wal_path, FsyncPolicy::Always).unwrap();
            wal.append(&Item::tombstone("k1").with_timestamp(9)).unwrap();
        }

        let replay = Wal::replay(&wal_path).unwrap();
        assert_eq!(replay.items.len(), 1);
        assert!(replay.items[0].is_tombstone());
        assert_eq!(replay.items[0].timestamp, 9);
    }
}
