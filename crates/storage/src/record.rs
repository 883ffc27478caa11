//! On-disk record format shared by the WAL and segment data files.
//!
//! Data record: `[20B zero-padded key][8B key length][8B timestamp][8B value length][value]`,
//! all integers big-endian. A tombstone stores `u64::MAX` as its value length
//! and no value bytes.
//!
//! Index record: `[20B zero-padded key][8B key length][8B data offset]`.
//!
//! The WAL additionally carries flush markers: a data record whose key field is
//! twenty `0xFF` bytes (never valid UTF-8, so never a real key). Its timestamp
//! field holds the WAL byte offset of the flush boundary.

use ringkv_common::{Item, MAX_KEY_LEN, MAX_VALUE_LEN};
use std::io::{self, Read};

/// Width of the padded key field.
pub const KEY_FIELD_LEN: usize = MAX_KEY_LEN;

/// Fixed header size of a data record (everything but the value bytes).
pub const DATA_HEADER_LEN: usize = KEY_FIELD_LEN + 8 + 8 + 8;

/// Fixed size of an index record.
pub const INDEX_RECORD_LEN: usize = KEY_FIELD_LEN + 8 + 8;

/// Reserved key field marking a flush boundary in the WAL.
pub const FLUSH_MARKER_KEY: [u8; KEY_FIELD_LEN] = [0xFF; KEY_FIELD_LEN];

const TOMBSTONE_LEN: u64 = u64::MAX;

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("record I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("record truncated")]
    Truncated,
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// A decoded WAL entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    Item(Item),
    /// Everything in the WAL before byte offset `boundary` lives in a segment.
    FlushMarker { boundary: u64 },
}

fn pad_key(key: &[u8]) -> [u8; KEY_FIELD_LEN] {
    let mut field = [0u8; KEY_FIELD_LEN];
    field[..key.len()].copy_from_slice(key);
    field
}

/// Serialized size of an item's data record.
pub fn encoded_len(item: &Item) -> usize {
    DATA_HEADER_LEN + item.value.as_ref().map_or(0, Vec::len)
}

/// Append an item's data record to `buf`.
///
/// The key must already satisfy the ingress bounds.
pub fn encode_item(item: &Item, buf: &mut Vec<u8>) {
    let key = item.key.as_bytes();
    debug_assert!(key.len() <= KEY_FIELD_LEN);
    buf.extend_from_slice(&pad_key(key));
    buf.extend_from_slice(&(key.len() as u64).to_be_bytes());
    buf.extend_from_slice(&item.timestamp.to_be_bytes());
    match &item.value {
        Some(value) => {
            buf.extend_from_slice(&(value.len() as u64).to_be_bytes());
            buf.extend_from_slice(value);
        }
        None => buf.extend_from_slice(&TOMBSTONE_LEN.to_be_bytes()),
    }
}

/// Append a flush marker to `buf`.
pub fn encode_flush_marker(boundary: u64, buf: &mut Vec<u8>) {
    buf.extend_from_slice(&FLUSH_MARKER_KEY);
    buf.extend_from_slice(&(KEY_FIELD_LEN as u64).to_be_bytes());
    buf.extend_from_slice(&boundary.to_be_bytes());
    buf.extend_from_slice(&0u64.to_be_bytes());
}

/// Read the first field of a record, distinguishing a clean EOF (no bytes)
/// from a record cut off mid-field.
fn read_leading<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool, RecordError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => return Err(RecordError::Truncated),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

fn read_field<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), RecordError> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => RecordError::Truncated,
        _ => RecordError::Io(e),
    })
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64, RecordError> {
    let mut buf = [0u8; 8];
    read_field(reader, &mut buf)?;
    Ok(u64::from_be_bytes(buf))
}

/// Decode one data record (or flush marker). Returns `Ok(None)` on clean EOF.
pub fn decode_record<R: Read>(reader: &mut R) -> Result<Option<WalRecord>, RecordError> {
    let mut key_field = [0u8; KEY_FIELD_LEN];
    if !read_leading(reader, &mut key_field)? {
        return Ok(None);
    }
    let key_len = read_u64(reader)?;
    let timestamp = read_u64(reader)?;
    let value_len = read_u64(reader)?;

    if key_field == FLUSH_MARKER_KEY {
        return Ok(Some(WalRecord::FlushMarker {
            boundary: timestamp,
        }));
    }

    let key = decode_key(&key_field, key_len)?;
    let value = match value_len {
        TOMBSTONE_LEN => None,
        len if len as usize > MAX_VALUE_LEN => {
            return Err(RecordError::Corrupt(format!(
                "value length {} exceeds limit",
                len
            )))
        }
        len => {
            let mut value = vec![0u8; len as usize];
            read_field(reader, &mut value)?;
            Some(value)
        }
    };

    Ok(Some(WalRecord::Item(Item {
        key,
        value,
        timestamp,
    })))
}

/// Recover the key string from a padded key field.
pub fn decode_key(field: &[u8; KEY_FIELD_LEN], key_len: u64) -> Result<String, RecordError> {
    if key_len == 0 || key_len as usize > KEY_FIELD_LEN {
        return Err(RecordError::Corrupt(format!("key length {}", key_len)));
    }
    String::from_utf8(field[..key_len as usize].to_vec())
        .map_err(|_| RecordError::Corrupt("key is not UTF-8".into()))
}

/// Encode an index record pointing at `offset` in the data file.
pub fn encode_index_entry(key: &str, offset: u64) -> [u8; INDEX_RECORD_LEN] {
    let mut out = [0u8; INDEX_RECORD_LEN];
    out[..KEY_FIELD_LEN].copy_from_slice(&pad_key(key.as_bytes()));
    out[KEY_FIELD_LEN..KEY_FIELD_LEN + 8].copy_from_slice(&(key.len() as u64).to_be_bytes());
    out[KEY_FIELD_LEN + 8..].copy_from_slice(&offset.to_be_bytes());
    out
}

/// Decode an index record into `(key, data offset)`.
pub fn decode_index_entry(raw: &[u8; INDEX_RECORD_LEN]) -> Result<(String, u64), RecordError> {
    let mut field = [0u8; KEY_FIELD_LEN];
    field.copy_from_slice(&raw[..KEY_FIELD_LEN]);
    let mut len = [0u8; 8];
    len.copy_from_slice(&raw[KEY_FIELD_LEN..KEY_FIELD_LEN + 8]);
    let mut offset = [0u8; 8];
    offset.copy_from_slice(&raw[KEY_FIELD_LEN + 8..]);
    let key = decode_key(&field, u64::from_be_bytes(len))?;
    Ok((key, u64::from_be_bytes(offset)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_data_record_layout() {
        let item = Item::put("ab", "xyz").with_timestamp(0x0102);
        let mut buf = Vec::new();
        encode_item(&item, &mut buf);

        assert_eq!(buf.len(), DATA_HEADER_LEN + 3);
        assert_eq!(&buf[..2], b"ab");
        assert!(buf[2..KEY_FIELD_LEN].iter().all(|b| *b == 0));
        assert_eq!(&buf[20..28], &2u64.to_be_bytes());
        assert_eq!(&buf[28..36], &0x0102u64.to_be_bytes());
        assert_eq!(&buf[36..44], &3u64.to_be_bytes());
        assert_eq!(&buf[44..], b"xyz");
        assert_eq!(encoded_len(&item), buf.len());
    }

    #[test]
    fn test_decode_sequence_with_marker_and_tombstone() {
        let mut buf = Vec::new();
        encode_item(&Item::put("k1", "v1").with_timestamp(1), &mut buf);
        encode_flush_marker(99, &mut buf);
        encode_item(&Item::tombstone("k1").with_timestamp(2), &mut buf);

        let mut cursor = Cursor::new(buf);
        let first = decode_record(&mut cursor).unwrap().unwrap();
        assert_eq!(
            first,
            WalRecord::Item(Item::put("k1", "v1").with_timestamp(1))
        );
        assert_eq!(
            decode_record(&mut cursor).unwrap().unwrap(),
            WalRecord::FlushMarker { boundary: 99 }
        );
        match decode_record(&mut cursor).unwrap().unwrap() {
            WalRecord::Item(item) => assert!(item.is_tombstone()),
            other => panic!("unexpected record {:?}", other),
        }
        assert!(decode_record(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn test_decode_truncated() {
        let mut buf = Vec::new();
        encode_item(&Item::put("key", "value").with_timestamp(5), &mut buf);
        buf.truncate(buf.len() - 2);
        let result = decode_record(&mut Cursor::new(buf));
        assert!(matches!(result, Err(RecordError::Truncated)));
    }

    #[test]
    fn test_index_entry() {
        let raw = encode_index_entry("user", 4096);
        assert_eq!(raw.len(), INDEX_RECORD_LEN);
        assert_eq!(&raw[28..], &4096u64.to_be_bytes());
        let (key, offset) = decode_index_entry(&raw).unwrap();
        assert_eq!(key, "user");
        assert_eq!(offset, 4096);
    }

    #[test]
    fn test_decode_rejects_bad_key_length() {
        let mut raw = encode_index_entry("user", 1);
        raw[KEY_FIELD_LEN..KEY_FIELD_LEN + 8].copy_from_slice(&21u64.to_be_bytes());
        assert!(matches!(
            decode_index_entry(&raw),
            Err(RecordError::Corrupt(_))
        ));
    }
}
