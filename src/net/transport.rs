//! UDP send and send-recv primitives.
//!
//! `send` is fire-and-forget on the node's shared socket. `send_recv` opens
//! an ephemeral socket, stamps the request with a fresh UID, and retries
//! with exponential backoff until a reply arrives from the right address
//! bearing the same UID; everything else that lands on the socket is
//! discarded without consuming the attempt.

use super::message::{Datagram, parse_response};
use super::types::{INITIAL_TIMEOUT_MS, MAX_DATAGRAM_SIZE, RETRY_COUNT};
use crate::error::NetError;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;
use tokio::time::{Duration, Instant, timeout};
use tracing::trace;

pub async fn send(socket: &UdpSocket, dgram: &Datagram, addr: SocketAddr) -> std::io::Result<()> {
    socket.send_to(&dgram.to_bytes(), addr).await?;
    Ok(())
}

/// One request/reply exchange against `target`. The builder receives the
/// ephemeral socket's local address so it can mint an address-derived UID.
pub async fn send_recv<F>(target: SocketAddr, build: F) -> Result<Datagram, NetError>
where
    F: FnOnce(SocketAddr) -> Datagram,
{
    let bind_ip: IpAddr = if target.ip().is_loopback() {
        Ipv4Addr::LOCALHOST.into()
    } else {
        Ipv4Addr::UNSPECIFIED.into()
    };
    let socket = UdpSocket::bind((bind_ip, 0)).await?;
    let local = socket.local_addr()?;

    let request = build(local);
    let uid = request.uid();
    let bytes = request.to_bytes();

    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut wait = Duration::from_millis(INITIAL_TIMEOUT_MS);

    for attempt in 0..RETRY_COUNT {
        socket.send_to(&bytes, target).await?;
        let deadline = Instant::now() + wait;

        // One attempt may see any number of stray datagrams; only the
        // deadline ends it.
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let (n, from) = match timeout(remaining, socket.recv_from(&mut buf)).await {
                Err(_) => break,
                Ok(recv) => recv?,
            };
            if from != target {
                trace!("discarding reply from unexpected sender {from}");
                continue;
            }
            match parse_response(&buf[..n]) {
                Ok(reply) if reply.uid() == uid => return Ok(reply),
                Ok(reply) => trace!("discarding reply with foreign uid {}", reply.uid()),
                Err(e) => trace!("discarding malformed reply: {e}"),
            }
        }

        trace!(
            "no reply from {target} within {wait:?} (attempt {}/{RETRY_COUNT})",
            attempt + 1
        );
        wait *= 2;
    }

    Err(NetError::Timeout { peer: target })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::types::{CMD_MEMBERSHIP_QUERY, RESP_OK};
    use crate::types::Uid;

    async fn echo_server(reply_uid: Option<Uid>) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM_SIZE];
            loop {
                let (n, from) = socket.recv_from(&mut buf).await.unwrap();
                assert!(n >= 16);
                let mut req_uid = [0u8; 16];
                req_uid.copy_from_slice(&buf[..16]);
                let uid = reply_uid.unwrap_or(Uid(req_uid));
                let reply = Datagram::value(uid, RESP_OK, b"pong".to_vec());
                socket.send_to(&reply.to_bytes(), from).await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn send_recv_matches_uid() {
        let server = echo_server(None).await;
        let reply = send_recv(server, |local| {
            Datagram::base(Uid::generate(&local), CMD_MEMBERSHIP_QUERY)
        })
        .await
        .unwrap();
        assert_eq!(reply.command(), RESP_OK);
        assert_eq!(reply.msg_value(), Some(&b"pong"[..]));
    }

    #[tokio::test]
    async fn wrong_uid_replies_time_out() {
        let server = echo_server(Some(Uid([0xAB; 16]))).await;
        let err = send_recv(server, |local| {
            Datagram::base(Uid::generate(&local), CMD_MEMBERSHIP_QUERY)
        })
        .await
        .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn dead_peer_times_out_after_retries() {
        // Bind-then-drop gives an address nobody answers on.
        let dead = {
            let s = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            s.local_addr().unwrap()
        };
        let started = Instant::now();
        let err = send_recv(dead, |local| {
            Datagram::base(Uid::generate(&local), CMD_MEMBERSHIP_QUERY)
        })
        .await
        .unwrap_err();
        assert!(err.is_timeout());
        // 100 + 200 + 400 ms of backoff
        assert!(started.elapsed() >= Duration::from_millis(650));
    }
}
