//! Per-command message handling.
//!
//! The receive loop hands each decoded datagram to `dispatch`, which runs in
//! its own task. Client mutations pass through the de-duplication cache
//! before touching the coordinator; intra-node commands operate on the local
//! store with pre-hashed keys.

use crate::coordinator;
use crate::gossip;
use crate::net::message::Datagram;
use crate::net::payload::{KvMap, PeerList, StoreValJson};
use crate::net::transport;
use crate::net::types::*;
use crate::node::NodeRuntime;
use crate::probe;
use crate::ring::Peer;
use crate::store::StoreVal;
use crate::types::Key;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub async fn dispatch(node: Arc<NodeRuntime>, dgram: Datagram, from: SocketAddr) {
    let command = dgram.command();

    // At-most-once guard for the non-idempotent commands. A repeat UID
    // either replays the stashed reply bytes or, mid-execution, stays
    // silent and lets the client retry again.
    if matches!(command, CMD_PUT | CMD_REMOVE | CMD_INTRA_PUT | CMD_INTRA_REMOVE) {
        let (seen, cached) = node.cache.store_and_get_reply(dgram.uid()).await;
        if seen {
            debug!("duplicate request {}", dgram.uid());
            if let Some(bytes) = cached {
                if let Err(e) = node.cache.resend(&node.socket, &bytes, from).await {
                    warn!("replaying cached reply: {e}");
                }
            }
            return;
        }
    }

    match command {
        CMD_PUT => {
            let (Some(client_key), Some(value)) = (dgram.msg_key(), dgram.msg_value()) else {
                return;
            };
            let key = Key::hash_of(&client_key.0);
            coordinator::handle_put(&node, dgram.uid(), key, value.to_vec(), from).await;
        }
        CMD_GET => {
            let Some(client_key) = dgram.msg_key() else { return };
            let key = Key::hash_of(&client_key.0);
            coordinator::handle_get(&node, dgram.uid(), key, from).await;
        }
        CMD_REMOVE => {
            let Some(client_key) = dgram.msg_key() else { return };
            let key = Key::hash_of(&client_key.0);
            coordinator::handle_remove(&node, dgram.uid(), key, from).await;
        }
        CMD_SHUTDOWN => handle_shutdown(&node, &dgram, from).await,

        CMD_INTRA_GET => handle_intra_get(&node, &dgram, from).await,
        CMD_INTRA_PUT | CMD_INTRA_REMOVE => handle_intra_write(&node, &dgram, from).await,
        CMD_GET_TIMESTAMP => handle_get_timestamp(&node, &dgram, from).await,

        CMD_STATUS_UPDATE => handle_status(&node, &dgram, false).await,
        CMD_ADHOC_UPDATE => handle_status(&node, &dgram, true).await,

        CMD_MEMBERSHIP_EXCHANGE => handle_membership(&node, &dgram, from, true).await,
        CMD_MEMBERSHIP => handle_membership(&node, &dgram, from, false).await,
        CMD_MEMBERSHIP_QUERY => handle_membership_query(&node, &dgram, from).await,
        CMD_MEMBERSHIP_FAILURE => handle_failure(&node, &dgram, false).await,
        CMD_MEMBERSHIP_FAILURE_GOSSIP => handle_failure(&node, &dgram, true).await,
        CMD_STORE_PUSH => handle_store_push(&node, &dgram, from).await,

        other => {
            // Parse table and dispatch disagree; answer like the codec would.
            warn!("no handler for command 0x{other:02x}");
            let reply = Datagram::base(dgram.uid(), RESP_UNKNOWN_COMMAND);
            let _ = transport::send(&node.socket, &reply, from).await;
        }
    }
}

async fn handle_shutdown(node: &Arc<NodeRuntime>, dgram: &Datagram, from: SocketAddr) {
    info!("shutdown requested by {from}");
    let reply = Datagram::value(dgram.uid(), RESP_OK, Vec::new());
    let _ = transport::send(&node.socket, &reply, from).await;
    std::process::exit(0);
}

async fn handle_intra_get(node: &Arc<NodeRuntime>, dgram: &Datagram, from: SocketAddr) {
    let Some(key) = dgram.msg_key() else { return };
    let reply = match node.store.get(&key).await {
        Some(val) => match serde_json::to_vec(&StoreValJson::from(val)) {
            Ok(payload) => Datagram::value(dgram.uid(), RESP_OK, payload),
            Err(e) => {
                warn!("serializing store value: {e}");
                Datagram::base(dgram.uid(), RESP_INTERNAL_ERROR)
            }
        },
        None => Datagram::base(dgram.uid(), RESP_INVALID_KEY),
    };
    if let Err(e) = node.cache.send_reply(&node.socket, &reply, from).await {
        warn!("sending intra-get reply: {e}");
    }
}

/// Apply a replicated write. Timestamp zero is the primary path (assign the
/// next logical timestamp); anything else is the follower path (gated
/// upsert, replay-safe).
async fn handle_intra_write(node: &Arc<NodeRuntime>, dgram: &Datagram, from: SocketAddr) {
    let (Some(key), Some(value)) = (dgram.msg_key(), dgram.msg_value()) else {
        return;
    };
    let cell: StoreVal = match serde_json::from_slice::<StoreValJson>(value) {
        Ok(v) => v.into(),
        Err(e) => {
            // Intra-cluster only; the de-dup cache stops reprocessing and
            // the sender's quorum logic covers the gap.
            warn!("dropping intra-write with bad payload from {from}: {e}");
            return;
        }
    };

    let reply = if cell.timestamp == 0 {
        match node.store.write_inc(key, cell.val, cell.active).await {
            Ok(ts) => {
                debug!("write_inc {key} -> timestamp {ts}");
                Datagram::value(dgram.uid(), RESP_OK, Vec::new())
            }
            Err(_) => Datagram::base(dgram.uid(), RESP_INVALID_KEY),
        }
    } else {
        node.store.write_if_newer(key, cell).await;
        Datagram::value(dgram.uid(), RESP_OK, Vec::new())
    };
    if let Err(e) = node.cache.send_reply(&node.socket, &reply, from).await {
        warn!("sending intra-write reply: {e}");
    }
}

async fn handle_get_timestamp(node: &Arc<NodeRuntime>, dgram: &Datagram, from: SocketAddr) {
    let Some(key) = dgram.msg_key() else { return };
    // Absent keys answer timestamp zero so the coordinator's T+1 starts a
    // fresh key at one.
    let cell = node.store.get(&key).await.unwrap_or_else(StoreVal::absent);
    let reply = match serde_json::to_vec(&StoreValJson::from(cell)) {
        Ok(payload) => Datagram::value(dgram.uid(), RESP_OK_TIMESTAMP, payload),
        Err(e) => {
            warn!("serializing timestamp reply: {e}");
            Datagram::base(dgram.uid(), RESP_INTERNAL_ERROR)
        }
    };
    if let Err(e) = node.cache.send_reply(&node.socket, &reply, from).await {
        warn!("sending timestamp reply: {e}");
    }
}

/// Status and ad-hoc probe rounds. The first sighting runs the probes and
/// reports to the configured status server; every sighting forwards the
/// round until the bounded-gossip coin retires it.
async fn handle_status(node: &Arc<NodeRuntime>, dgram: &Datagram, adhoc: bool) {
    let Some(round) = dgram.msg_key() else { return };
    let value = dgram.msg_value().unwrap_or_default();

    let (first_time, should_forward) = node.gossip.observe(round, node.config.k).await;
    if first_time {
        if let Some(server) = node.config.status_server_addr() {
            let (ok, report) = if adhoc {
                probe::run_command(&String::from_utf8_lossy(value)).await
            } else {
                probe::status_report().await
            };
            let code = match (ok, adhoc) {
                (false, _) => RESP_STATUS_UPDATE_FAIL,
                (true, false) => RESP_STATUS_UPDATE_OK,
                (true, true) => RESP_ADHOC_UPDATE_OK,
            };
            let mut report = report.into_bytes();
            report.truncate(MAX_VALUE_SIZE);
            let reply = Datagram::value(dgram.uid(), code, report);
            if let Err(e) = transport::send(&node.socket, &reply, server).await {
                warn!("reporting status to {server}: {e}");
            }
        }
    }
    if should_forward {
        gossip::forward(node, dgram.command(), round, value).await;
    }
}

/// Merge a peer list; on the exchange variant, answer with our own list so
/// both sides converge.
async fn handle_membership(
    node: &Arc<NodeRuntime>,
    dgram: &Datagram,
    from: SocketAddr,
    reply: bool,
) {
    let (Some(sender_id), Some(value)) = (dgram.msg_key(), dgram.msg_value()) else {
        return;
    };
    let list: PeerList = match serde_json::from_slice(value) {
        Ok(l) => l,
        Err(e) => {
            warn!("dropping membership list with bad payload from {from}: {e}");
            return;
        }
    };

    let pushes = node.membership.update_peers(list.into_peers(), sender_id, from).await;
    for push in pushes {
        let node = node.clone();
        tokio::spawn(async move {
            gossip::execute_push(&node, push).await;
        });
    }

    if reply {
        if let Err(e) = gossip::send_peer_list(node, CMD_MEMBERSHIP, from).await {
            warn!("replying to membership exchange: {e}");
        }
    }
}

async fn handle_membership_query(node: &Arc<NodeRuntime>, dgram: &Datagram, from: SocketAddr) {
    let mut peers = node.membership.peers_snapshot().await;
    peers.insert(node.id, Peer::seen_now(node.addr));
    let reply = match serde_json::to_vec(&PeerList::from_peers(peers.iter())) {
        Ok(payload) => Datagram::value(dgram.uid(), RESP_OK, payload),
        Err(e) => {
            warn!("serializing membership query reply: {e}");
            Datagram::base(dgram.uid(), RESP_INTERNAL_ERROR)
        }
    };
    if let Err(e) = node.cache.send_reply(&node.socket, &reply, from).await {
        warn!("sending membership query reply: {e}");
    }
}

/// A failure announcement downs every peer the list marks offline. The
/// gossip variant re-forwards under the bounded stop rule.
async fn handle_failure(node: &Arc<NodeRuntime>, dgram: &Datagram, propagate: bool) {
    let (Some(round), Some(value)) = (dgram.msg_key(), dgram.msg_value()) else {
        return;
    };
    let list: PeerList = match serde_json::from_slice(value) {
        Ok(l) => l,
        Err(e) => {
            warn!("dropping failure announcement with bad payload: {e}");
            return;
        }
    };
    let failed: Vec<Key> =
        list.into_peers().into_iter().filter(|(_, p)| !p.online).map(|(id, _)| id).collect();
    if !failed.is_empty() {
        node.membership.merge_failures(failed).await;
    }

    if propagate {
        let (_, should_forward) = node.gossip.observe(round, node.config.k).await;
        if should_forward {
            gossip::forward(node, CMD_MEMBERSHIP_FAILURE_GOSSIP, round, value).await;
        }
    }
}

/// Integrate a pushed key range from the node that held it before us.
async fn handle_store_push(node: &Arc<NodeRuntime>, dgram: &Datagram, from: SocketAddr) {
    let Some(value) = dgram.msg_value() else { return };
    let map: KvMap = match serde_json::from_slice(value) {
        Ok(m) => m,
        Err(e) => {
            warn!("dropping store push with bad payload from {from}: {e}");
            return;
        }
    };
    let entries = map.into_entries();
    let mut applied = 0usize;
    let total = entries.len();
    for (key, val) in entries {
        if node.store.write_if_newer(key, val).await {
            applied += 1;
        }
    }
    info!("store push from {from}: applied {applied}/{total} keys");
    let reply = Datagram::value(dgram.uid(), RESP_OK, Vec::new());
    if let Err(e) = node.cache.send_reply(&node.socket, &reply, from).await {
        warn!("acknowledging store push: {e}");
    }
}
