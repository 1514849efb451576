//! Wire protocol constants.
//!
//! Command and response codes are bit-exact protocol surface; changing any
//! value breaks interoperability with deployed nodes.

/// Hard ceiling on a single datagram.
pub const MAX_DATAGRAM_SIZE: usize = 16_000;

/// Ceiling on the value field of Value/KeyValue datagrams (signed 16-bit
/// length prefix on the wire).
pub const MAX_VALUE_SIZE: usize = 15_000;

/// Fixed header: uid[16] || command[1].
pub const HEADER_SIZE: usize = 17;

/// Attempts per send-recv exchange.
pub const RETRY_COUNT: u32 = 3;

/// First receive deadline in millis; doubles after each timeout, so a full
/// exchange gives up after roughly 100 + 200 + 400 ms.
pub const INITIAL_TIMEOUT_MS: u64 = 100;

// Client-facing commands.
pub const CMD_PUT: u8 = 0x01;
pub const CMD_GET: u8 = 0x02;
pub const CMD_REMOVE: u8 = 0x03;
pub const CMD_SHUTDOWN: u8 = 0x04;

// Intra-cluster store commands. Keys arrive pre-hashed.
pub const CMD_INTRA_PUT: u8 = 0x06;
pub const CMD_INTRA_GET: u8 = 0x07;
pub const CMD_INTRA_REMOVE: u8 = 0x08;

// Status collection.
pub const CMD_STATUS_UPDATE: u8 = 0x21;
pub const CMD_ADHOC_UPDATE: u8 = 0x22;

// Membership and anti-entropy.
pub const CMD_MEMBERSHIP: u8 = 0x23;
pub const CMD_MEMBERSHIP_EXCHANGE: u8 = 0x25;
pub const CMD_MEMBERSHIP_QUERY: u8 = 0x27;
pub const CMD_MEMBERSHIP_FAILURE: u8 = 0x28;
pub const CMD_MEMBERSHIP_FAILURE_GOSSIP: u8 = 0x29;
pub const CMD_STORE_PUSH: u8 = 0x2A;
pub const CMD_GET_TIMESTAMP: u8 = 0x2B;

// Response codes.
pub const RESP_OK: u8 = 0x00;
pub const RESP_INVALID_KEY: u8 = 0x01;
pub const RESP_OUT_OF_SPACE: u8 = 0x02;
pub const RESP_SYS_OVERLOAD: u8 = 0x03;
pub const RESP_INTERNAL_ERROR: u8 = 0x04;
pub const RESP_UNKNOWN_COMMAND: u8 = 0x05;
pub const RESP_STATUS_UPDATE_FAIL: u8 = 0x06;
pub const RESP_STATUS_UPDATE_OK: u8 = 0x07;
pub const RESP_ADHOC_UPDATE_OK: u8 = 0x08;
pub const RESP_MALFORMED_DATAGRAM: u8 = 0x09;
pub const RESP_INVALID_NODE: u8 = 0x0A;
pub const RESP_OK_TIMESTAMP: u8 = 0x0B;

/// Payload layout following the fixed header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Shape {
    Base,
    Key,
    Value,
    KeyValue,
}

/// Payload shape of each request command; `None` means the command is
/// unknown and the codec answers `RESP_UNKNOWN_COMMAND`.
pub fn request_shape(command: u8) -> Option<Shape> {
    match command {
        CMD_PUT => Some(Shape::KeyValue),
        CMD_GET => Some(Shape::Key),
        CMD_REMOVE => Some(Shape::Key),
        CMD_SHUTDOWN => Some(Shape::Base),
        CMD_INTRA_PUT => Some(Shape::KeyValue),
        CMD_INTRA_GET => Some(Shape::Key),
        CMD_INTRA_REMOVE => Some(Shape::KeyValue),
        CMD_STATUS_UPDATE => Some(Shape::KeyValue),
        CMD_ADHOC_UPDATE => Some(Shape::KeyValue),
        CMD_MEMBERSHIP => Some(Shape::KeyValue),
        CMD_MEMBERSHIP_EXCHANGE => Some(Shape::KeyValue),
        CMD_MEMBERSHIP_QUERY => Some(Shape::Base),
        CMD_MEMBERSHIP_FAILURE => Some(Shape::KeyValue),
        CMD_MEMBERSHIP_FAILURE_GOSSIP => Some(Shape::KeyValue),
        CMD_STORE_PUSH => Some(Shape::Value),
        CMD_GET_TIMESTAMP => Some(Shape::Key),
        _ => None,
    }
}

/// Payload shape of each response code, for the send-recv reply parser.
pub fn response_shape(code: u8) -> Option<Shape> {
    match code {
        RESP_OK => Some(Shape::Value),
        RESP_OK_TIMESTAMP => Some(Shape::Value),
        RESP_STATUS_UPDATE_OK => Some(Shape::Value),
        RESP_STATUS_UPDATE_FAIL => Some(Shape::Value),
        RESP_ADHOC_UPDATE_OK => Some(Shape::Value),
        RESP_INVALID_KEY
        | RESP_OUT_OF_SPACE
        | RESP_SYS_OVERLOAD
        | RESP_INTERNAL_ERROR
        | RESP_UNKNOWN_COMMAND
        | RESP_MALFORMED_DATAGRAM
        | RESP_INVALID_NODE => Some(Shape::Base),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_codes_are_bit_exact() {
        assert_eq!(CMD_PUT, 0x01);
        assert_eq!(CMD_GET, 0x02);
        assert_eq!(CMD_REMOVE, 0x03);
        assert_eq!(CMD_SHUTDOWN, 0x04);
        assert_eq!(CMD_INTRA_PUT, 0x06);
        assert_eq!(CMD_INTRA_GET, 0x07);
        assert_eq!(CMD_INTRA_REMOVE, 0x08);
        assert_eq!(CMD_STATUS_UPDATE, 0x21);
        assert_eq!(CMD_ADHOC_UPDATE, 0x22);
        assert_eq!(CMD_MEMBERSHIP, 0x23);
        assert_eq!(CMD_MEMBERSHIP_EXCHANGE, 0x25);
        assert_eq!(CMD_MEMBERSHIP_QUERY, 0x27);
        assert_eq!(CMD_MEMBERSHIP_FAILURE, 0x28);
        assert_eq!(CMD_MEMBERSHIP_FAILURE_GOSSIP, 0x29);
        assert_eq!(CMD_STORE_PUSH, 0x2A);
        assert_eq!(CMD_GET_TIMESTAMP, 0x2B);
    }

    #[test]
    fn response_codes_are_bit_exact() {
        assert_eq!(RESP_OK, 0x00);
        assert_eq!(RESP_INVALID_KEY, 0x01);
        assert_eq!(RESP_OUT_OF_SPACE, 0x02);
        assert_eq!(RESP_SYS_OVERLOAD, 0x03);
        assert_eq!(RESP_INTERNAL_ERROR, 0x04);
        assert_eq!(RESP_UNKNOWN_COMMAND, 0x05);
        assert_eq!(RESP_STATUS_UPDATE_FAIL, 0x06);
        assert_eq!(RESP_STATUS_UPDATE_OK, 0x07);
        assert_eq!(RESP_ADHOC_UPDATE_OK, 0x08);
        assert_eq!(RESP_MALFORMED_DATAGRAM, 0x09);
        assert_eq!(RESP_INVALID_NODE, 0x0A);
        assert_eq!(RESP_OK_TIMESTAMP, 0x0B);
    }

    #[test]
    fn every_command_has_a_shape() {
        for cmd in [
            CMD_PUT,
            CMD_GET,
            CMD_REMOVE,
            CMD_SHUTDOWN,
            CMD_INTRA_PUT,
            CMD_INTRA_GET,
            CMD_INTRA_REMOVE,
            CMD_STATUS_UPDATE,
            CMD_ADHOC_UPDATE,
            CMD_MEMBERSHIP,
            CMD_MEMBERSHIP_EXCHANGE,
            CMD_MEMBERSHIP_QUERY,
            CMD_MEMBERSHIP_FAILURE,
            CMD_MEMBERSHIP_FAILURE_GOSSIP,
            CMD_STORE_PUSH,
            CMD_GET_TIMESTAMP,
        ] {
            assert!(request_shape(cmd).is_some(), "command 0x{cmd:02x}");
        }
        assert!(request_shape(0x09).is_none());
        assert!(request_shape(0xFF).is_none());
    }
}
