//! ringkv-ring: consistent-hash ring.
//!
//! Every node occupies exactly one position on a 128-bit MD5 ring, derived
//! from its data address. A key belongs to the first node at or after the
//! key's digest (wrapping), and its replica set continues clockwise from
//! there. The ring has a canonical string form that is exchanged between the
//! coordinator and the nodes.

pub mod hash;
pub mod ring;
pub mod snapshot;

pub use hash::{digest, RingDigest};
pub use ring::HashRing;
pub use snapshot::{RingSnapshot, SharedRing};

/// Errors parsing a ring description.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    #[error("malformed keyrange: {0}")]
    Malformed(String),
    #[error("keyrange is not in canonical form")]
    NotCanonical,
}
