//! Versioned ring snapshots.
//!
//! The coordinator stamps every ring it publishes with a monotonically
//! increasing version. Nodes keep the newest snapshot in a [`SharedRing`] and
//! replace it wholesale; readers clone the `Arc` and never observe a partially
//! updated ring.

use crate::{HashRing, RingError};
use parking_lot::RwLock;
use ringkv_common::RingUpdate;
use std::sync::Arc;

/// A ring together with the coordinator version it was published under.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RingSnapshot {
    pub version: u64,
    pub ring: HashRing,
}

impl RingSnapshot {
    pub fn new(version: u64, ring: HashRing) -> Self {
        Self { version, ring }
    }

    /// Parse a coordinator update.
    pub fn from_update(update: &RingUpdate) -> Result<Self, RingError> {
        Ok(Self {
            version: update.version,
            ring: HashRing::deserialize(&update.keyrange)?,
        })
    }

    pub fn to_update(&self) -> RingUpdate {
        RingUpdate {
            version: self.version,
            keyrange: self.ring.serialize(),
        }
    }
}

/// The node's current ring. Starts empty at version 0.
#[derive(Debug, Default)]
pub struct SharedRing {
    current: RwLock<Arc<RingSnapshot>>,
}

impl SharedRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current snapshot.
    pub fn load(&self) -> Arc<RingSnapshot> {
        self.current.read().clone()
    }

    /// Install `next` if it is newer than the current snapshot.
    ///
    /// Returns the replaced snapshot, or `None` if `next` was stale.
    pub fn publish(&self, next: impl Into<Arc<RingSnapshot>>) -> Option<Arc<RingSnapshot>> {
        let next = next.into();
        let mut current = self.current.write();
        if next.version <= current.version {
            tracing::debug!(
                "ignoring ring version {} (have {})",
                next.version,
                current.version
            );
            return None;
        }
        Some(std::mem::replace(&mut *current, next))
    }
}
