//! Keys, node identity, and message UIDs.
//!
//! The key space is the circle of 256-bit unsigned integers; a `Key` compares
//! as its big-endian value, so the derived lexicographic ordering of the byte
//! array is already the ring ordering.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// A 32-byte value on the 256-bit circular key space.
///
/// Used both for storage keys and for node ids; the ring places nodes and
/// keys on the same circle.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Key(pub [u8; 32]);

impl Key {
    /// SHA-256 of arbitrary bytes. Client-supplied keys are rehashed through
    /// this before they touch the store, isolating client naming from ring
    /// placement.
    pub fn hash_of(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        Key(digest.into())
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Key(arr))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// True iff `self` lies on the circular arc `(lo, hi]`.
    ///
    /// `lo == hi` is the full ring and matches every key.
    pub fn between(&self, lo: &Key, hi: &Key) -> bool {
        if lo == hi {
            true
        } else if lo < hi {
            lo < self && self <= hi
        } else {
            self > lo || self <= hi
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Full hex is unwieldy in logs; eight leading bytes identify a node.
        write!(f, "{}..", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.to_hex())
    }
}

/// Node id: SHA-256 over the node's IP (big-endian octets) followed by its
/// port (little-endian u16). Every address maps to a stable ring position.
pub fn node_id(addr: &SocketAddr) -> Key {
    let mut hasher = Sha256::new();
    match addr.ip() {
        IpAddr::V4(ip) => hasher.update(ip.octets()),
        IpAddr::V6(ip) => hasher.update(ip.octets()),
    }
    hasher.update(addr.port().to_le_bytes());
    Key(hasher.finalize().into())
}

/// 16-byte request identifier: `ip(4, BE) || port(2, LE) || rand(2, LE) ||
/// unix_millis(8, LE)`. Doubles as the idempotency token for the reply cache.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct Uid(pub [u8; 16]);

impl Uid {
    pub fn generate(local: &SocketAddr) -> Self {
        let mut buf = [0u8; 16];
        match local.ip() {
            IpAddr::V4(ip) => buf[..4].copy_from_slice(&ip.octets()),
            // Only four octets fit; the random half-word and millis keep
            // truncated v6 senders distinct.
            IpAddr::V6(ip) => buf[..4].copy_from_slice(&ip.octets()[..4]),
        }
        buf[4..6].copy_from_slice(&local.port().to_le_bytes());
        let r: u16 = rand::random();
        buf[6..8].copy_from_slice(&r.to_le_bytes());
        buf[8..16].copy_from_slice(&now_millis().to_le_bytes());
        Uid(buf)
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uid({})", hex::encode(self.0))
    }
}

/// Milliseconds since the unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
