//! Immutable on-disk segments produced by memtable flushes.
//!
//! A segment is a directory named by a random identifier holding an index file
//! (fixed-width `key -> data offset` records, strictly increasing keys) and a
//! data file (data records in the same order). Segments are built under a
//! `.tmp` name and renamed into place once both files are synced, so a crash
//! mid-flush never leaves a half-written segment visible.

use crate::record::{self, RecordError, WalRecord, INDEX_RECORD_LEN};
use ringkv_common::Item;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub const INDEX_FILE: &str = "index.seg";
pub const DATA_FILE: &str = "data.seg";
pub const TMP_SUFFIX: &str = ".tmp";

#[derive(Debug, thiserror::Error)]
pub enum SegmentError {
    #[error("segment I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("segment record error: {0}")]
    Record(#[from] RecordError),
    #[error("corrupt segment {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Builds a new segment. Keys must be appended in strictly increasing order.
#[derive(Debug)]
pub struct SegmentWriter {
    id: String,
    root: PathBuf,
    tmp_dir: PathBuf,
    index: BufWriter<File>,
    data: BufWriter<File>,
    data_offset: u64,
    last_key: Option<String>,
    entries: u64,
}

impl SegmentWriter {
    /// Start a segment with a fresh random identifier under `root`.
    pub fn create(root: &Path) -> Result<Self, SegmentError> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let tmp_dir = root.join(format!("{}{}", id, TMP_SUFFIX));
        fs::create_dir_all(&tmp_dir)?;

        let open = |name: &str| {
            OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(tmp_dir.join(name))
        };
        let index = BufWriter::new(open(INDEX_FILE)?);
        let data = BufWriter::new(open(DATA_FILE)?);

        Ok(Self {
            id,
            root: root.to_path_buf(),
            tmp_dir,
            index,
            data,
            data_offset: 0,
            last_key: None,
            entries: 0,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Append an item. Returns `Ok(false)` and writes nothing if the key does
    /// not sort strictly after the previously appended key.
    pub fn append(&mut self, item: &Item) -> Result<bool, SegmentError> {
        if let Some(last) = &self.last_key {
            if item.key.as_str() <= last.as_str() {
                tracing::error!(
                    segment = %self.id,
                    "refusing out-of-order append: {:?} after {:?}",
                    item.key,
                    last
                );
                return Ok(false);
            }
        }

        let mut buf = Vec::with_capacity(record::encoded_len(item));
        record::encode_item(item, &mut buf);
        self.data.write_all(&buf)?;
        self.index
            .write_all(&record::encode_index_entry(&item.key, self.data_offset))?;

        self.data_offset += buf.len() as u64;
        self.last_key = Some(item.key.clone());
        self.entries += 1;
        Ok(true)
    }

    /// Number of records appended so far.
    pub fn len(&self) -> u64 {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Sync both files and move the segment into place.
    pub fn finish(mut self) -> Result<Segment, SegmentError> {
        self.index.flush()?;
        self.data.flush()?;
        self.index.get_ref().sync_all()?;
        self.data.get_ref().sync_all()?;

        let final_dir = self.root.join(&self.id);
        fs::rename(&self.tmp_dir, &final_dir)?;
        Segment::open(&final_dir)
    }

    /// Remove the partially written segment.
    pub fn abandon(self) {
        let dir = self.tmp_dir.clone();
        drop(self);
        if let Err(e) = fs::remove_dir_all(&dir) {
            tracing::warn!("failed to remove abandoned segment {:?}: {}", dir, e);
        }
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// A closed, immutable segment.
#[derive(Debug, Clone)]
pub struct Segment {
    id: String,
    dir: PathBuf,
    entries: u64,
}

impl Segment {
    /// Open a finished segment directory.
    pub fn open(dir: &Path) -> Result<Self, SegmentError> {
        let id = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let index_len = fs::metadata(dir.join(INDEX_FILE))?.len();
        if index_len % INDEX_RECORD_LEN as u64 != 0 {
            return Err(SegmentError::Corrupt {
                id,
                reason: format!("index length {} is not a whole number of records", index_len),
            });
        }
        // The data file must exist too.
        fs::metadata(dir.join(DATA_FILE))?;

        Ok(Self {
            id,
            dir: dir.to_path_buf(),
            entries: index_len / INDEX_RECORD_LEN as u64,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of records in the segment.
    pub fn len(&self) -> u64 {
        self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    fn read_index_entry(&self, index: &mut File, pos: u64) -> Result<(String, u64), SegmentError> {
        let mut raw = [0u8; INDEX_RECORD_LEN];
        index.seek(SeekFrom::Start(pos * INDEX_RECORD_LEN as u64))?;
        index.read_exact(&mut raw)?;
        Ok(record::decode_index_entry(&raw)?)
    }

    fn read_item(&self, data: &mut File, offset: u64) -> Result<Item, SegmentError> {
        data.seek(SeekFrom::Start(offset))?;
        match record::decode_record(&mut BufReader::new(data))? {
            Some(WalRecord::Item(item)) => Ok(item),
            other => Err(SegmentError::Corrupt {
                id: self.id.clone(),
                reason: format!("expected item at offset {}, found {:?}", offset, other),
            }),
        }
    }

    /// Look up a key (tombstones included) by binary search over the index.
    pub fn get(&self, key: &str) -> Result<Option<Item>, SegmentError> {
        if self.entries == 0 {
            return Ok(None);
        }
        let mut index = File::open(self.dir.join(INDEX_FILE))?;

        let (mut lo, mut hi) = (0u64, self.entries);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let (mid_key, offset) = self.read_index_entry(&mut index, mid)?;
            match mid_key.as_str().cmp(key) {
                std::cmp::Ordering::Equal => {
                    let mut data = File::open(self.dir.join(DATA_FILE))?;
                    return self.read_item(&mut data, offset).map(Some);
                }
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        Ok(None)
    }

    /// All entries (tombstones included) whose key contains `pattern`, in key order.
    pub fn matching(&self, pattern: &str) -> Result<Vec<Item>, SegmentError> {
        let mut index = BufReader::new(File::open(self.dir.join(INDEX_FILE))?);
        let mut data = File::open(self.dir.join(DATA_FILE))?;
        let mut out = Vec::new();

        let mut raw = [0u8; INDEX_RECORD_LEN];
        for _ in 0..self.entries {
            index.read_exact(&mut raw)?;
            let (key, offset) = record::decode_index_entry(&raw)?;
            if key.contains(pattern) {
                out.push(self.read_item(&mut data, offset)?);
            }
        }
        Ok(out)
    }

    /// Every entry in the segment, in key order.
    pub fn items(&self) -> Result<Vec<Item>, SegmentError> {
        let mut data = BufReader::new(File::open(self.dir.join(DATA_FILE))?);
        let mut out = Vec::with_capacity(self.entries as usize);
        while let Some(record) = record::decode_record(&mut data)? {
            match record {
                WalRecord::Item(item) => out.push(item),
                WalRecord::FlushMarker { .. } => {
                    return Err(SegmentError::Corrupt {
                        id: self.id.clone(),
                        reason: "flush marker inside segment".into(),
                    })
                }
            }
        }
        Ok(out)
    }
}

/// Open every finished segment under `root`, discarding leftovers of
/// interrupted flushes.
pub fn load_segments(root: &Path) -> Result<Vec<Segment>, SegmentError> {
    fs::create_dir_all(root)?;
    let mut segments = Vec::new();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let path = entry.path();
        if path.to_string_lossy().ends_with(TMP_SUFFIX) {
            tracing::warn!("removing incomplete segment {:?}", path);
            fs::remove_dir_all(&path)?;
            continue;
        }
        segments.push(Segment::open(&path)?);
    }
    Ok(segments)
}
