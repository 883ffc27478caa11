//! The coordinator's authoritative membership state.
//!
//! Pure bookkeeping with no I/O: the ring, its version counter, the
//! data ⇄ control address maps and the set of write-locked nodes. Every
//! method that changes the ring bumps the version exactly once.

use crate::CoordinatorError;
use ringkv_common::{FinishReply, RingUpdate, ShutdownReply};
use ringkv_ring::{digest, HashRing};
use std::collections::{HashMap, HashSet};

/// Result of registering a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// The ring to hand back to the new node.
    pub update: RingUpdate,
    /// Control address of the node whose range shrank, now write-locked.
    pub shrinking: Option<String>,
}

#[derive(Debug, Default)]
pub struct Membership {
    ring: HashRing,
    version: u64,
    control_by_data: HashMap<String, String>,
    data_by_control: HashMap<String, String>,
    /// Control addresses of write-locked nodes.
    locked: HashSet<String>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ring(&self) -> &HashRing {
        &self.ring
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn current(&self) -> RingUpdate {
        RingUpdate {
            version: self.version,
            keyrange: self.ring.serialize(),
        }
    }

    pub fn is_locked(&self, control_addr: &str) -> bool {
        self.locked.contains(control_addr)
    }

    /// `(data, control)` pairs of every ring member, in ring order.
    pub fn members(&self) -> Vec<(String, String)> {
        self.ring
            .nodes()
            .filter_map(|data| {
                let control = self.control_by_data.get(data)?;
                Some((data.to_string(), control.clone()))
            })
            .collect()
    }

    pub fn control_of(&self, data_addr: &str) -> Option<&str> {
        self.control_by_data.get(data_addr).map(String::as_str)
    }

    pub fn data_of(&self, control_addr: &str) -> Option<&str> {
        self.data_by_control.get(control_addr).map(String::as_str)
    }

    /// Add a node to the ring.
    ///
    /// Registering an existing member again returns the current ring without
    /// a version bump. Otherwise the node that owned the newcomer's position
    /// loses part of its range; it is write-locked and reported back so the
    /// caller can notify it.
    pub fn join(&mut self, data_addr: &str, control_addr: &str) -> Result<JoinOutcome, CoordinatorError> {
        validate_addr(data_addr)?;
        validate_addr(control_addr)?;

        if self.ring.contains(data_addr) {
            self.map(data_addr, control_addr);
            return Ok(JoinOutcome {
                update: self.current(),
                shrinking: None,
            });
        }

        let shrinking = self
            .ring
            .owner_of(&digest(data_addr))
            .filter(|owner| *owner != data_addr)
            .and_then(|owner| self.control_by_data.get(owner))
            .cloned();

        self.map(data_addr, control_addr);
        self.ring.put(data_addr);
        self.version += 1;
        if let Some(control) = &shrinking {
            self.locked.insert(control.clone());
        }

        Ok(JoinOutcome {
            update: self.current(),
            shrinking,
        })
    }

    /// A node reports its handoff as done.
    ///
    /// Members get their lock released. Nodes that already left are forgotten
    /// and told goodbye.
    pub fn finish(&mut self, control_addr: &str) -> Result<FinishReply, CoordinatorError> {
        let data_addr = self
            .data_of(control_addr)
            .ok_or_else(|| CoordinatorError::UnknownNode(control_addr.to_string()))?
            .to_string();

        self.locked.remove(control_addr);
        if self.ring.contains(&data_addr) {
            Ok(FinishReply::ReleaseLock)
        } else {
            self.forget(&data_addr);
            Ok(FinishReply::Bye)
        }
    }

    /// A node asks to leave.
    ///
    /// It is removed from the ring immediately. The reply carries the ring
    /// without it (so everything it holds must move), or `Bye` when no nodes
    /// remain. Address mappings are kept until `finish` so peers can still
    /// reach it during handoff.
    pub fn leave(&mut self, control_addr: &str) -> Result<ShutdownReply, CoordinatorError> {
        let data_addr = self
            .data_of(control_addr)
            .ok_or_else(|| CoordinatorError::UnknownNode(control_addr.to_string()))?
            .to_string();

        if self.ring.remove(&data_addr) {
            self.version += 1;
        }
        if self.ring.is_empty() {
            self.forget(&data_addr);
            return Ok(ShutdownReply::Bye);
        }
        Ok(ShutdownReply::Handoff(self.current()))
    }

    /// Drop a node that stopped answering heartbeats. Returns whether the
    /// ring changed.
    pub fn remove_failed(&mut self, data_addr: &str) -> bool {
        let removed = self.ring.remove(data_addr);
        if removed {
            self.version += 1;
        }
        self.forget(data_addr);
        removed
    }

    fn map(&mut self, data_addr: &str, control_addr: &str) {
        if let Some(old) = self
            .control_by_data
            .insert(data_addr.to_string(), control_addr.to_string())
        {
            if old != control_addr {
                self.data_by_control.remove(&old);
                self.locked.remove(&old);
            }
        }
        self.data_by_control
            .insert(control_addr.to_string(), data_addr.to_string());
    }

    fn forget(&mut self, data_addr: &str) {
        if let Some(control) = self.control_by_data.remove(data_addr) {
            self.data_by_control.remove(&control);
            self.locked.remove(&control);
        }
    }
}

/// Addresses end up inside keyrange strings, so they must be `host:port`
/// without the separators the format uses.
fn validate_addr(addr: &str) -> Result<(), CoordinatorError> {
    let valid = !addr.is_empty()
        && !addr.contains([',', ';'])
        && addr
            .rsplit_once(':')
            .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
    if valid {
        Ok(())
    } else {
        Err(CoordinatorError::InvalidAddress(addr.to_string()))
    }
}
