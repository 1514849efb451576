//! Client-side operations against a node.
//!
//! Each call is one send-recv exchange with the full retry/backoff
//! discipline. Keys given here are client keys; the receiving node rehashes
//! them before storage.

use super::message::Datagram;
use super::payload::PeerList;
use super::transport::send_recv;
use super::types::{
    CMD_GET, CMD_MEMBERSHIP_QUERY, CMD_PUT, CMD_REMOVE, CMD_SHUTDOWN, CMD_STATUS_UPDATE,
    MAX_VALUE_SIZE, RESP_OK,
};
use crate::error::NetError;
use crate::ring::Peer;
use crate::types::{Key, Uid};
use std::collections::HashMap;
use std::net::SocketAddr;

fn check(reply: Datagram) -> Result<Datagram, NetError> {
    match reply.command() {
        RESP_OK => Ok(reply),
        code => Err(NetError::ErrorResponse { code }),
    }
}

pub async fn get(server: SocketAddr, key: Key) -> Result<Vec<u8>, NetError> {
    let reply = send_recv(server, |local| {
        Datagram::key(Uid::generate(&local), CMD_GET, key)
    })
    .await?;
    let reply = check(reply)?;
    Ok(reply.msg_value().unwrap_or_default().to_vec())
}

pub async fn put(server: SocketAddr, key: Key, value: Vec<u8>) -> Result<(), NetError> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(NetError::ValueTooLarge);
    }
    let reply = send_recv(server, |local| {
        Datagram::key_value(Uid::generate(&local), CMD_PUT, key, value)
    })
    .await?;
    check(reply).map(|_| ())
}

pub async fn remove(server: SocketAddr, key: Key) -> Result<(), NetError> {
    let reply = send_recv(server, |local| {
        Datagram::key(Uid::generate(&local), CMD_REMOVE, key)
    })
    .await?;
    check(reply).map(|_| ())
}

pub async fn shutdown(server: SocketAddr) -> Result<(), NetError> {
    let reply = send_recv(server, |local| {
        Datagram::base(Uid::generate(&local), CMD_SHUTDOWN)
    })
    .await?;
    check(reply).map(|_| ())
}

/// Fetch a node's membership view (itself included).
pub async fn membership_query(server: SocketAddr) -> Result<HashMap<Key, Peer>, NetError> {
    let reply = send_recv(server, |local| {
        Datagram::base(Uid::generate(&local), CMD_MEMBERSHIP_QUERY)
    })
    .await?;
    let reply = check(reply)?;
    let list: PeerList = serde_json::from_slice(reply.msg_value().unwrap_or_default())?;
    Ok(list.into_peers())
}

/// Seed a status round at `server` with the given round key; the probe
/// reports travel to the cluster's status server, not back to us.
pub async fn status_update(
    server: SocketAddr,
    round: Key,
    command: Vec<u8>,
) -> Result<(), NetError> {
    let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
    let local = socket.local_addr()?;
    let dgram = Datagram::key_value(Uid::generate(&local), CMD_STATUS_UPDATE, round, command);
    socket.send_to(&dgram.to_bytes(), server).await?;
    Ok(())
}
