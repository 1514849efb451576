//! Datagram codec.
//!
//! Every message is one UDP datagram with a fixed header (uid[16] ||
//! command[1]) followed by one of four payload shapes. The shape is a
//! function of the command byte, so parsing is table-driven and handlers
//! match on the decoded variant instead of downcasting.
//!
//! Wire layout (little-endian value length, big-endian IPs inside the UID):
//!
//! ```text
//! Base:     uid[16] cmd[1]
//! Key:      uid[16] cmd[1] key[32]
//! Value:    uid[16] cmd[1] len[i16 LE] bytes[len]
//! KeyValue: uid[16] cmd[1] key[32] len[i16 LE] bytes[len]
//! ```

use super::types::{self, HEADER_SIZE, Shape};
use crate::error::ParseError;
use crate::types::{Key, Uid};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    Base { uid: Uid, command: u8 },
    Key { uid: Uid, command: u8, key: Key },
    Value { uid: Uid, command: u8, value: Vec<u8> },
    KeyValue { uid: Uid, command: u8, key: Key, value: Vec<u8> },
}

impl Datagram {
    pub fn base(uid: Uid, command: u8) -> Self {
        Datagram::Base { uid, command }
    }

    pub fn key(uid: Uid, command: u8, key: Key) -> Self {
        Datagram::Key { uid, command, key }
    }

    pub fn value(uid: Uid, command: u8, value: Vec<u8>) -> Self {
        Datagram::Value { uid, command, value }
    }

    pub fn key_value(uid: Uid, command: u8, key: Key, value: Vec<u8>) -> Self {
        Datagram::KeyValue { uid, command, key, value }
    }

    pub fn uid(&self) -> Uid {
        match self {
            Datagram::Base { uid, .. }
            | Datagram::Key { uid, .. }
            | Datagram::Value { uid, .. }
            | Datagram::KeyValue { uid, .. } => *uid,
        }
    }

    pub fn command(&self) -> u8 {
        match self {
            Datagram::Base { command, .. }
            | Datagram::Key { command, .. }
            | Datagram::Value { command, .. }
            | Datagram::KeyValue { command, .. } => *command,
        }
    }

    pub fn msg_key(&self) -> Option<Key> {
        match self {
            Datagram::Key { key, .. } | Datagram::KeyValue { key, .. } => Some(*key),
            _ => None,
        }
    }

    pub fn msg_value(&self) -> Option<&[u8]> {
        match self {
            Datagram::Value { value, .. } | Datagram::KeyValue { value, .. } => {
                Some(value.as_slice())
            }
            _ => None,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + 34);
        buf.extend_from_slice(&self.uid().0);
        buf.push(self.command());
        match self {
            Datagram::Base { .. } => {}
            Datagram::Key { key, .. } => buf.extend_from_slice(&key.0),
            Datagram::Value { value, .. } => write_value(&mut buf, value),
            Datagram::KeyValue { key, value, .. } => {
                buf.extend_from_slice(&key.0);
                write_value(&mut buf, value);
            }
        }
        buf
    }
}

fn write_value(buf: &mut Vec<u8>, value: &[u8]) {
    buf.extend_from_slice(&(value.len() as i16).to_le_bytes());
    buf.extend_from_slice(value);
}

/// Parse an incoming request. Unknown commands and malformed payloads
/// surface as `ParseError`s that still carry the UID, so the receive loop
/// can answer with the matching protocol error reply.
pub fn parse_request(dgram: &[u8]) -> Result<Datagram, ParseError> {
    parse(dgram, types::request_shape)
}

/// Parse a reply on the send-recv path. No error replies are synthesized
/// here; malformed replies are simply discarded by the caller.
pub fn parse_response(dgram: &[u8]) -> Result<Datagram, ParseError> {
    parse(dgram, types::response_shape)
}

fn parse(dgram: &[u8], shape_of: fn(u8) -> Option<Shape>) -> Result<Datagram, ParseError> {
    if dgram.len() < HEADER_SIZE {
        return Err(ParseError::TooShort);
    }
    let mut uid = [0u8; 16];
    uid.copy_from_slice(&dgram[..16]);
    let uid = Uid(uid);
    let command = dgram[16];
    let payload = &dgram[HEADER_SIZE..];

    let shape = shape_of(command).ok_or(ParseError::UnknownCommand { uid, command })?;
    let malformed = || ParseError::Malformed { uid, command };

    match shape {
        Shape::Base => Ok(Datagram::base(uid, command)),
        Shape::Key => {
            let key = parse_key(payload).ok_or_else(malformed)?;
            Ok(Datagram::key(uid, command, key))
        }
        Shape::Value => {
            let value = parse_value(payload).ok_or_else(malformed)?;
            Ok(Datagram::value(uid, command, value))
        }
        Shape::KeyValue => {
            let key = parse_key(payload).ok_or_else(malformed)?;
            let value = parse_value(&payload[32..]).ok_or_else(malformed)?;
            Ok(Datagram::key_value(uid, command, key, value))
        }
    }
}

fn parse_key(payload: &[u8]) -> Option<Key> {
    let bytes: [u8; 32] = payload.get(..32)?.try_into().ok()?;
    Some(Key(bytes))
}

fn parse_value(payload: &[u8]) -> Option<Vec<u8>> {
    let len_bytes: [u8; 2] = payload.get(..2)?.try_into().ok()?;
    let len = i16::from_le_bytes(len_bytes);
    if len < 0 {
        return None;
    }
    let value = payload.get(2..2 + len as usize)?;
    Some(value.to_vec())
}

impl ParseError {
    /// The error reply owed to the sender, when the header survived.
    pub fn reply(&self) -> Option<Datagram> {
        match self {
            ParseError::TooShort => None,
            ParseError::UnknownCommand { uid, .. } => {
                Some(Datagram::base(*uid, types::RESP_UNKNOWN_COMMAND))
            }
            ParseError::Malformed { uid, .. } => {
                Some(Datagram::base(*uid, types::RESP_MALFORMED_DATAGRAM))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::types::{
        CMD_GET, CMD_MEMBERSHIP_QUERY, CMD_PUT, CMD_STORE_PUSH, RESP_MALFORMED_DATAGRAM,
        RESP_UNKNOWN_COMMAND,
    };

    fn uid(n: u8) -> Uid {
        Uid([n; 16])
    }

    fn key(n: u8) -> Key {
        Key([n; 32])
    }

    #[test]
    fn base_round_trip() {
        let d = Datagram::base(uid(1), CMD_MEMBERSHIP_QUERY);
        let parsed = parse_request(&d.to_bytes()).unwrap();
        assert_eq!(parsed, d);
        assert_eq!(d.to_bytes().len(), 17);
    }

    #[test]
    fn key_round_trip() {
        let d = Datagram::key(uid(2), CMD_GET, key(7));
        let parsed = parse_request(&d.to_bytes()).unwrap();
        assert_eq!(parsed.msg_key(), Some(key(7)));
        assert_eq!(parsed, d);
        assert_eq!(d.to_bytes().len(), 17 + 32);
    }

    #[test]
    fn value_round_trip() {
        let d = Datagram::value(uid(3), CMD_STORE_PUSH, b"payload".to_vec());
        let bytes = d.to_bytes();
        // len prefix is little-endian i16
        assert_eq!(&bytes[17..19], &7i16.to_le_bytes());
        assert_eq!(parse_request(&bytes).unwrap(), d);
    }

    #[test]
    fn key_value_round_trip() {
        let d = Datagram::key_value(uid(4), CMD_PUT, key(9), b"hello".to_vec());
        let parsed = parse_request(&d.to_bytes()).unwrap();
        assert_eq!(parsed.msg_key(), Some(key(9)));
        assert_eq!(parsed.msg_value(), Some(&b"hello"[..]));
    }

    #[test]
    fn empty_value_is_legal() {
        let d = Datagram::value(uid(5), CMD_STORE_PUSH, Vec::new());
        assert_eq!(parse_request(&d.to_bytes()).unwrap().msg_value(), Some(&[][..]));
    }

    #[test]
    fn unknown_command_yields_reply_with_original_uid() {
        let bytes = Datagram::base(uid(6), 0x7F).to_bytes();
        let err = parse_request(&bytes).unwrap_err();
        let reply = err.reply().unwrap();
        assert_eq!(reply.command(), RESP_UNKNOWN_COMMAND);
        assert_eq!(reply.uid(), uid(6));
    }

    #[test]
    fn truncated_payload_yields_malformed_reply() {
        let full = Datagram::key_value(uid(7), CMD_PUT, key(1), b"abcdef".to_vec()).to_bytes();
        let err = parse_request(&full[..full.len() - 3]).unwrap_err();
        let reply = err.reply().unwrap();
        assert_eq!(reply.command(), RESP_MALFORMED_DATAGRAM);
        assert_eq!(reply.uid(), uid(7));
    }

    #[test]
    fn negative_value_length_is_malformed() {
        let mut bytes = Datagram::value(uid(8), CMD_STORE_PUSH, b"x".to_vec()).to_bytes();
        bytes[17..19].copy_from_slice(&(-2i16).to_le_bytes());
        assert!(matches!(
            parse_request(&bytes),
            Err(ParseError::Malformed { .. })
        ));
    }

    #[test]
    fn sub_header_datagram_has_no_reply() {
        let err = parse_request(&[0u8; 16]).unwrap_err();
        assert!(err.reply().is_none());
    }

    #[test]
    fn response_and_request_tables_differ() {
        // 0x02 is CmdGet as a request but RespOutOfSpace as a reply.
        let bytes = Datagram::base(uid(9), 0x02).to_bytes();
        assert!(parse_request(&bytes).is_err(), "get without key is malformed");
        assert!(parse_response(&bytes).is_ok(), "base out-of-space reply parses");
    }
}
