//! UDP receive loop.
//!
//! Single consumer of the node's socket: decode, answer codec errors, and
//! spawn one handler task per datagram so a slow quorum never blocks the
//! next request.

use super::message::parse_request;
use super::types::MAX_DATAGRAM_SIZE;
use crate::handler;
use crate::node::NodeRuntime;
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, warn};

pub async fn run(node: Arc<NodeRuntime>) -> std::io::Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (n, from) = node.socket.recv_from(&mut buf).await?;

        // Test knob: simulate a lossy network before any processing.
        if node.loss_percent > 0
            && rand::thread_rng().gen_range(0..100) < node.loss_percent
        {
            debug!("dropping datagram from {from} (loss injection)");
            continue;
        }

        match parse_request(&buf[..n]) {
            Ok(dgram) => {
                debug!("received command 0x{:02x} from {from}", dgram.command());
                let node = node.clone();
                tokio::spawn(async move {
                    handler::dispatch(node, dgram, from).await;
                });
            }
            Err(e) => {
                warn!("unparseable datagram from {from}: {e}");
                if let Some(reply) = e.reply() {
                    if let Err(e) = node.socket.send_to(&reply.to_bytes(), from).await {
                        warn!("sending protocol error reply: {e}");
                    }
                }
            }
        }
    }
}
