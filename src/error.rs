//! Error taxonomy for the node runtime.

use crate::types::Uid;
use std::net::SocketAddr;
use thiserror::Error;

/// Network-level failures from the UDP transport.
#[derive(Debug, Error)]
pub enum NetError {
    /// All retries exhausted without a matching reply.
    #[error("timeout waiting for reply from {peer}")]
    Timeout { peer: SocketAddr },

    #[error("udp i/o: {0}")]
    Io(#[from] std::io::Error),

    /// The peer answered with a non-OK response code.
    #[error("error response 0x{code:02x} from peer")]
    ErrorResponse { code: u8 },

    /// A reply decoded but its payload did not.
    #[error("malformed reply payload: {0}")]
    BadPayload(#[from] serde_json::Error),

    #[error("value exceeds the {} byte wire limit", crate::net::MAX_VALUE_SIZE)]
    ValueTooLarge,
}

impl NetError {
    /// Peer timeouts are the one failure the cluster protocol recovers from
    /// (offline-marking, failure gossip, client retry); callers branch on it.
    pub fn is_timeout(&self) -> bool {
        matches!(self, NetError::Timeout { .. })
    }
}

/// Datagram decode failures. Where the header survived, the codec can still
/// synthesize a well-formed error reply carrying the original UID.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("datagram shorter than the fixed header")]
    TooShort,

    #[error("unrecognized command 0x{command:02x}")]
    UnknownCommand { uid: Uid, command: u8 },

    #[error("malformed payload for command 0x{command:02x}")]
    Malformed { uid: Uid, command: u8 },
}

/// Local store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no value for key")]
    NoValue,
}
