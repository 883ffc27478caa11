//! ringkv-common: shared types for the ringkv project.
//!
//! Provides the [`Item`] record that flows through storage, replication
//! and handoff, the ingress bounds that guard it, the node lifecycle
//! [`ServerStatus`], and the coordinator reply types shared by the node
//! and coordinator crates.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum key length in bytes.
pub const MAX_KEY_LEN: usize = 20;

/// Maximum value length in bytes.
pub const MAX_VALUE_LEN: usize = 120_000;

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

/// A single key/value mutation.
///
/// `value == None` is a tombstone. `timestamp == 0` means "not yet assigned";
/// the storage engine stamps it on write. Replicated and handed-off items keep
/// the timestamp of the node that originally accepted the write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub key: String,
    pub value: Option<Vec<u8>>,
    pub timestamp: u64,
}

impl Item {
    /// A live put with an unassigned timestamp.
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
            timestamp: 0,
        }
    }

    /// A tombstone with an unassigned timestamp.
    pub fn tombstone(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
            timestamp: 0,
        }
    }

    /// Builder-style timestamp override.
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Approximate in-memory footprint, used for memtable sizing.
    pub fn size_bytes(&self) -> usize {
        self.key.len() + self.value.as_ref().map_or(0, Vec::len) + 8
    }

    /// Check ingress bounds. Nothing is mutated on failure.
    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_key(&self.key)?;
        if let Some(value) = &self.value {
            if value.len() > MAX_VALUE_LEN {
                return Err(ValidationError::ValueTooLarge {
                    len: value.len(),
                    max: MAX_VALUE_LEN,
                });
            }
        }
        Ok(())
    }
}

/// Validate a bare key (used by get/delete which carry no value).
pub fn validate_key(key: &str) -> Result<(), ValidationError> {
    if key.is_empty() {
        return Err(ValidationError::EmptyKey);
    }
    if key.len() > MAX_KEY_LEN {
        return Err(ValidationError::KeyTooLong {
            len: key.len(),
            max: MAX_KEY_LEN,
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Node lifecycle
// ---------------------------------------------------------------------------

/// Lifecycle of a storage node as driven by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerStatus {
    /// Registered (or registering) but no ring received yet. Serves nothing.
    Bootstrapping,
    /// Serving reads and writes for its range.
    Active,
    /// Write-locked while a handoff narrows its range. Serves reads only.
    Balancing,
    /// Handed off and released by the coordinator. Serves nothing.
    Shutdown,
}

impl ServerStatus {
    /// Whether client requests should be answered with "server stopped".
    pub fn is_stopped(self) -> bool {
        matches!(self, Self::Bootstrapping | Self::Shutdown)
    }
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Bootstrapping => "BOOTSTRAPPING",
            Self::Active => "ACTIVE",
            Self::Balancing => "BALANCING",
            Self::Shutdown => "SHUTDOWN",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Coordinator replies
// ---------------------------------------------------------------------------

/// A serialized ring together with the coordinator's version counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingUpdate {
    pub version: u64,
    pub keyrange: String,
}

/// Reply to a node's `finish` notification after handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReply {
    /// The node is still a member; its write lock is released.
    ReleaseLock,
    /// The node has left the ring and may exit.
    Bye,
}

/// Reply to a node's graceful `shutdown` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutdownReply {
    /// Hand off everything according to this ring (which no longer contains the node).
    Handoff(RingUpdate),
    /// No nodes remain; exit immediately.
    Bye,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("key must not be empty")]
    EmptyKey,

    #[error("key is {len} bytes, limit is {max}")]
    KeyTooLong { len: usize, max: usize },

    #[error("value is {len} bytes, limit is {max}")]
    ValueTooLarge { len: usize, max: usize },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_constructors() {
        let put = Item::put("k", "v");
        assert_eq!(put.value.as_deref(), Some(&b"v"[..]));
        assert_eq!(put.timestamp, 0);
        assert!(!put.is_tombstone());

        let del = Item::tombstone("k").with_timestamp(7);
        assert!(del.is_tombstone());
        assert_eq!(del.timestamp, 7);
    }

    #[test]
    fn test_validate_bounds() {
        assert!(Item::put("a", "1").validate().is_ok());
        assert!(Item::put("x".repeat(MAX_KEY_LEN), "1").validate().is_ok());
        assert_eq!(
            Item::put("", "1").validate(),
            Err(ValidationError::EmptyKey)
        );
        assert!(matches!(
            Item::put("x".repeat(MAX_KEY_LEN + 1), "1").validate(),
            Err(ValidationError::KeyTooLong { len: 21, .. })
        ));
        assert!(matches!(
            Item::put("k", vec![0u8; MAX_VALUE_LEN + 1]).validate(),
            Err(ValidationError::ValueTooLarge { .. })
        ));
        // Tombstones carry no value and only need a valid key.
        assert!(Item::tombstone("k").validate().is_ok());
    }

    #[test]
    fn test_status_stopped() {
        assert!(ServerStatus::Bootstrapping.is_stopped());
        assert!(ServerStatus::Shutdown.is_stopped());
        assert!(!ServerStatus::Active.is_stopped());
        assert!(!ServerStatus::Balancing.is_stopped());
        assert_eq!(ServerStatus::Balancing.to_string(), "BALANCING");
    }

    #[test]
    fn test_serde_roundtrip() {
        let item = Item::put("k", "v").with_timestamp(42);
        let json = serde_json::to_string(&item).unwrap();
        let back: Item = serde_json::from_str(&json).unwrap();
        assert_eq!(item, back);
    }
}
