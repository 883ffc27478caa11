//! Ring positions.

use std::fmt;

/// Number of bytes in a ring digest.
pub const DIGEST_BYTES: usize = 16;

/// A 128-bit position on the ring.
///
/// Ordering is big-endian byte order, which is also the ordering of the
/// lower-case hex rendering.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RingDigest(pub [u8; DIGEST_BYTES]);

impl RingDigest {
    /// Parse a 32-character lower-case hex digest.
    pub fn from_hex(s: &str) -> Result<Self, crate::RingError> {
        if s.len() != DIGEST_BYTES * 2 || s.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(crate::RingError::Malformed(format!("bad digest {:?}", s)));
        }
        let bytes = hex::decode(s)
            .map_err(|e| crate::RingError::Malformed(format!("bad digest {:?}: {}", s, e)))?;
        let mut out = [0u8; DIGEST_BYTES];
        out.copy_from_slice(&bytes);
        Ok(Self(out))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for RingDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for RingDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RingDigest({})", self.to_hex())
    }
}

/// Ring position of a node address or a key.
pub fn digest(s: &str) -> RingDigest {
    RingDigest(md5::compute(s.as_bytes()).0)
}
