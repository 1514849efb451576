//! UDP wire protocol: codec, transport, payload schemas, receive loop.

pub mod client;
pub mod message;
pub mod payload;
pub mod receiver;
pub mod transport;
pub mod types;

pub use message::{Datagram, parse_request, parse_response};
pub use payload::{AddrJson, KvMap, PeerList, StoreValJson};
pub use transport::{send, send_recv};
pub use types::{
    INITIAL_TIMEOUT_MS, MAX_DATAGRAM_SIZE, MAX_VALUE_SIZE, RETRY_COUNT, Shape, request_shape,
    response_shape,
};
