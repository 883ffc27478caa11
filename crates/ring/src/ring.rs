//! The consistent-hash ring and its canonical keyrange form.
//!
//! A node at digest `d` owns the keys in `(pred(d), d]`, where `pred(d)` is
//! the previous node position, wrapping around the top of the ring. The
//! keyrange string lists one `start,end,addr;` triple per node, sorted by
//! `start`, with both digests as lower-case hex.

use crate::hash::{digest, RingDigest};
use crate::RingError;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::ops::Bound::{Excluded, Unbounded};

/// Ordered map from ring position to node data address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HashRing {
    nodes: BTreeMap<RingDigest, String>,
}

impl HashRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a ring from a list of node addresses.
    pub fn from_nodes<I, S>(addrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ring = Self::new();
        for addr in addrs {
            ring.put(addr);
        }
        ring
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, addr: &str) -> bool {
        self.nodes.get(&digest(addr)).is_some_and(|a| a == addr)
    }

    /// Node addresses in ring order.
    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.nodes.values().map(String::as_str)
    }

    /// Insert a node. Returns `false` if it was already present.
    pub fn put(&mut self, addr: impl Into<String>) -> bool {
        let addr = addr.into();
        let d = digest(&addr);
        self.nodes.insert(d, addr).is_none()
    }

    /// Remove a node. Returns `false` if it was not present.
    pub fn remove(&mut self, addr: &str) -> bool {
        self.nodes.remove(&digest(addr)).is_some()
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    /// The node responsible for `key`.
    pub fn owner(&self, key: &str) -> Option<&str> {
        self.owner_of(&digest(key))
    }

    /// The node at the smallest position `>= d`, wrapping to the first.
    pub fn owner_of(&self, d: &RingDigest) -> Option<&str> {
        self.nodes
            .range(d..)
            .next()
            .or_else(|| self.nodes.iter().next())
            .map(|(_, addr)| addr.as_str())
    }

    /// The node at the largest position strictly below `addr`'s, wrapping to
    /// the last. On a one-node ring this is the node itself.
    pub fn predecessor(&self, addr: &str) -> Option<&str> {
        let d = digest(addr);
        self.nodes
            .range(..d)
            .next_back()
            .or_else(|| self.nodes.iter().next_back())
            .map(|(_, addr)| addr.as_str())
    }

    /// The node at the smallest position strictly above `addr`'s, wrapping.
    pub fn successor(&self, addr: &str) -> Option<&str> {
        let d = digest(addr);
        self.nodes
            .range((Excluded(d), Unbounded))
            .next()
            .or_else(|| self.nodes.iter().next())
            .map(|(_, addr)| addr.as_str())
    }

    /// Walk clockwise from the owner of `key`, collecting up to `n` distinct
    /// nodes. The first entry is the owner.
    pub fn successors(&self, key: &str, n: usize) -> Vec<String> {
        let d = digest(key);
        self.nodes
            .range(d..)
            .chain(self.nodes.range(..d))
            .take(n)
            .map(|(_, addr)| addr.clone())
            .collect()
    }

    /// The nodes holding replicas of the data `addr` owns: the `n - 1`
    /// distinct nodes following it clockwise.
    pub fn replica_peers(&self, addr: &str, n: usize) -> Vec<String> {
        let d = digest(addr);
        self.nodes
            .range((Excluded(d), Unbounded))
            .chain(self.nodes.range(..d))
            .take(n.saturating_sub(1))
            .map(|(_, addr)| addr.clone())
            .collect()
    }

    /// `(start, end)` of the range owned by `addr`: keys with digest in
    /// `(start, end]`. When `start == end` the node owns the whole ring.
    pub fn range_of(&self, addr: &str) -> Option<(RingDigest, RingDigest)> {
        if !self.contains(addr) {
            return None;
        }
        let pred = self.predecessor(addr)?;
        Some((digest(pred), digest(addr)))
    }

    /// Whether `addr` accepts writes for `key`.
    pub fn is_responsible(&self, addr: &str, key: &str) -> bool {
        self.owner(key) == Some(addr)
    }

    /// Whether `addr` holds a copy of `key` with `n` total copies.
    pub fn is_read_responsible(&self, addr: &str, key: &str, n: usize) -> bool {
        self.successors(key, n).iter().any(|a| a == addr)
    }

    // -----------------------------------------------------------------------
    // Keyrange strings
    // -----------------------------------------------------------------------

    /// Canonical keyrange string of the write ranges.
    pub fn serialize(&self) -> String {
        self.render(1)
    }

    /// Keyrange string of the read ranges with `n` total copies: each node's
    /// range extended backwards over its `n - 1` predecessors.
    pub fn serialize_read_ranges(&self, n: usize) -> String {
        self.render(n.max(1))
    }

    /// One triple per node whose start lies `back` positions behind it.
    fn render(&self, back: usize) -> String {
        let positions: Vec<(&RingDigest, &String)> = self.nodes.iter().collect();
        let len = positions.len();
        if len == 0 {
            return String::new();
        }
        let back = back.min(len);

        let mut triples: Vec<(&RingDigest, &RingDigest, &str)> = positions
            .iter()
            .enumerate()
            .map(|(i, (end, addr))| {
                let (start, _) = positions[(i + len - back) % len];
                (start, *end, addr.as_str())
            })
            .collect();
        triples.sort_by(|a, b| a.0.cmp(b.0).then_with(|| a.1.cmp(b.1)));

        let mut out = String::with_capacity(len * 80);
        for (start, end, addr) in triples {
            let _ = write!(out, "{},{},{};", start, end, addr);
        }
        out
    }

    /// Parse a canonical keyrange string. The empty string is the empty ring.
    ///
    /// The ring is rebuilt from the listed addresses and re-serialized; any
    /// difference from the input (order, digests, separators) is rejected.
    pub fn deserialize(s: &str) -> Result<Self, RingError> {
        let mut ring = Self::new();
        for triple in s.split_terminator(';') {
            let mut parts = triple.splitn(3, ',');
            let (start, end, addr) = match (parts.next(), parts.next(), parts.next()) {
                (Some(start), Some(end), Some(addr)) => (start, end, addr),
                _ => return Err(RingError::Malformed(format!("bad triple {:?}", triple))),
            };
            RingDigest::from_hex(start)?;
            RingDigest::from_hex(end)?;
            if addr.is_empty() {
                return Err(RingError::Malformed(format!(
                    "missing address in {:?}",
                    triple
                )));
            }
            if !ring.put(addr) {
                return Err(RingError::Malformed(format!("duplicate node {}", addr)));
            }
        }

        if ring.serialize() != s {
            return Err(RingError::NotCanonical);
        }
        Ok(ring)
    }
}
