//! In-memory sorted buffer of recent writes.
//!
//! Holds exactly one entry per key: the one with the largest timestamp.
//! Tombstones are kept as entries so they can shadow older segment data.

use ringkv_common::Item;
use std::collections::BTreeMap;

/// Sorted in-memory table keyed by item key.
#[derive(Debug, Default)]
pub struct Memtable {
    data: BTreeMap<String, Item>,
    size_bytes: usize,
}

impl Memtable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current entry for a key, tombstones included.
    pub fn get(&self, key: &str) -> Option<&Item> {
        self.data.get(key)
    }

    /// Insert an item unless a newer entry for the key is already present.
    /// Returns whether the item was applied.
    pub fn insert(&mut self, item: Item) -> bool {
        if let Some(existing) = self.data.get(&item.key) {
            if existing.timestamp > item.timestamp {
                return false;
            }
            self.size_bytes -= existing.size_bytes();
        }
        self.size_bytes += item.size_bytes();
        self.data.insert(item.key.clone(), item);
        true
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Approximate payload size, compared against the flush threshold.
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    /// Entries in ascending key order.
    pub fn iter(&self) -> impl Iterator<Item = &Item> {
        self.data.values()
    }

    /// Entries (tombstones included) whose key contains `pattern`.
    pub fn matching<'a>(&'a self, pattern: &'a str) -> impl Iterator<Item = &'a Item> + 'a {
        self.data.values().filter(move |item| item.key.contains(pattern))
    }
}
