//! Quorum read/write coordination.
//!
//! Every client operation fans out to the key's replica set, one task per
//! replica, and resolves once a majority (`min_ok = floor(N/2) + 1`) has
//! answered. Reads pick the highest logical timestamp; writes discover the
//! highest timestamp first, then replicate `T + 1`. A quorum that cannot be
//! reached produces a deliberate non-reply: the client's retry is the
//! recovery path.
//!
//! Replying at `min_ok` leaves the remaining replica tasks running; their
//! late writes are timestamp-gated no-ops or the catch-up replication for
//! stragglers.

use crate::gossip;
use crate::net::message::Datagram;
use crate::net::payload::StoreValJson;
use crate::net::transport;
use crate::net::types::{
    CMD_GET_TIMESTAMP, CMD_INTRA_GET, CMD_INTRA_PUT, CMD_INTRA_REMOVE, RESP_INVALID_KEY, RESP_OK,
    RESP_OK_TIMESTAMP,
};
use crate::node::NodeRuntime;
use crate::ring::Replica;
use crate::store::StoreVal;
use crate::types::{Key, Uid};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub fn min_ok(replica_count: usize) -> usize {
    replica_count / 2 + 1
}

/// One intra-node exchange. A timeout marks the peer offline and announces
/// the failure; any failure yields `None` and counts against the quorum.
pub(crate) async fn intra_rpc<F>(
    node: &Arc<NodeRuntime>,
    peer_id: Key,
    addr: SocketAddr,
    build: F,
) -> Option<Datagram>
where
    F: FnOnce(SocketAddr) -> Datagram,
{
    match transport::send_recv(addr, build).await {
        Ok(reply) => Some(reply),
        Err(e) if e.is_timeout() => {
            warn!("peer {peer_id} timed out, marking offline");
            node.membership.set_peer_offline(&peer_id).await;
            gossip::announce_failure(node, peer_id).await;
            None
        }
        Err(e) => {
            warn!("rpc to peer {peer_id} failed: {e}");
            None
        }
    }
}

async fn replica_get(node: Arc<NodeRuntime>, replica: Replica, key: Key) -> Option<StoreVal> {
    match replica.addr {
        None => Some(node.store.get(&key).await.unwrap_or_else(StoreVal::absent)),
        Some(addr) => {
            let reply = intra_rpc(&node, replica.id, addr, |local| {
                Datagram::key(Uid::generate(&local), CMD_INTRA_GET, key)
            })
            .await?;
            match reply.command() {
                RESP_OK => serde_json::from_slice::<StoreValJson>(reply.msg_value()?)
                    .map(StoreVal::from)
                    .map_err(|e| warn!("bad intra-get payload from {}: {e}", replica.id))
                    .ok(),
                // Absence is data, not failure; timestamp zero loses every
                // comparison against a real write.
                RESP_INVALID_KEY => Some(StoreVal::absent()),
                code => {
                    warn!("unexpected intra-get response 0x{code:02x} from {}", replica.id);
                    None
                }
            }
        }
    }
}

async fn replica_timestamp(node: Arc<NodeRuntime>, replica: Replica, key: Key) -> Option<i64> {
    match replica.addr {
        None => Some(node.store.get(&key).await.map_or(0, |v| v.timestamp)),
        Some(addr) => {
            let reply = intra_rpc(&node, replica.id, addr, |local| {
                Datagram::key(Uid::generate(&local), CMD_GET_TIMESTAMP, key)
            })
            .await?;
            match reply.command() {
                RESP_OK_TIMESTAMP => serde_json::from_slice::<StoreValJson>(reply.msg_value()?)
                    .map(|v| v.timestamp)
                    .map_err(|e| warn!("bad timestamp payload from {}: {e}", replica.id))
                    .ok(),
                code => {
                    warn!("unexpected timestamp response 0x{code:02x} from {}", replica.id);
                    None
                }
            }
        }
    }
}

async fn replica_write(
    node: Arc<NodeRuntime>,
    replica: Replica,
    key: Key,
    cell: StoreVal,
) -> bool {
    match replica.addr {
        None => {
            // Applied-or-superseded both count: the replica answered, and a
            // no-op just means a newer write already landed.
            node.store.write_if_newer(key, cell).await;
            true
        }
        Some(addr) => {
            let command = if cell.active { CMD_INTRA_PUT } else { CMD_INTRA_REMOVE };
            let payload = match serde_json::to_vec(&StoreValJson::from(cell)) {
                Ok(p) => p,
                Err(e) => {
                    warn!("serializing intra-write: {e}");
                    return false;
                }
            };
            let reply = intra_rpc(&node, replica.id, addr, |local| {
                Datagram::key_value(Uid::generate(&local), command, key, payload)
            })
            .await;
            matches!(reply, Some(r) if r.command() == RESP_OK)
        }
    }
}

/// Quorum read. Replies `RespOk(value)` for a live value, `RespInvalidKey`
/// for a tombstone or an everywhere-absent key, and nothing at all when
/// fewer than `min_ok` replicas answer.
pub async fn handle_get(node: &Arc<NodeRuntime>, uid: Uid, key: Key, from: SocketAddr) {
    let replicas = node.membership.replica_set(&key).await;
    let need = min_ok(replicas.len());

    let (tx, mut rx) = mpsc::channel(replicas.len());
    for replica in replicas {
        let node = node.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(replica_get(node, replica, key).await).await;
        });
    }
    drop(tx);

    let mut successes = 0;
    let mut best: Option<StoreVal> = None;
    while let Some(result) = rx.recv().await {
        let Some(val) = result else { continue };
        successes += 1;
        // Highest timestamp wins; ties keep the earlier arrival.
        if best.as_ref().is_none_or(|b| val.timestamp > b.timestamp) {
            best = Some(val);
        }
        if successes >= need {
            break;
        }
    }

    let Some(best) = best.filter(|_| successes >= need) else {
        warn!("get quorum failed ({successes}/{need}), withholding reply");
        return;
    };

    let reply = if best.active {
        Datagram::value(uid, RESP_OK, best.val)
    } else {
        Datagram::base(uid, RESP_INVALID_KEY)
    };
    if let Err(e) = node.cache.send_reply(&node.socket, &reply, from).await {
        warn!("sending get reply: {e}");
    }
}

pub async fn handle_put(
    node: &Arc<NodeRuntime>,
    uid: Uid,
    key: Key,
    value: Vec<u8>,
    from: SocketAddr,
) {
    two_phase_write(node, uid, key, Some(value), from).await;
}

pub async fn handle_remove(node: &Arc<NodeRuntime>, uid: Uid, key: Key, from: SocketAddr) {
    two_phase_write(node, uid, key, None, from).await;
}

/// Phase 1 discovers the highest timestamp a majority has seen; phase 2
/// replicates the write at `T + 1`. `value == None` writes a tombstone.
async fn two_phase_write(
    node: &Arc<NodeRuntime>,
    uid: Uid,
    key: Key,
    value: Option<Vec<u8>>,
    from: SocketAddr,
) {
    let replicas = node.membership.replica_set(&key).await;
    let need = min_ok(replicas.len());

    let (tx, mut rx) = mpsc::channel(replicas.len());
    for replica in replicas.clone() {
        let node = node.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(replica_timestamp(node, replica, key).await).await;
        });
    }
    drop(tx);

    let mut successes = 0;
    let mut highest = 0i64;
    while let Some(result) = rx.recv().await {
        let Some(ts) = result else { continue };
        successes += 1;
        highest = highest.max(ts);
        if successes >= need {
            break;
        }
    }
    if successes < need {
        warn!("timestamp quorum failed ({successes}/{need}), withholding reply");
        return;
    }

    // Removing a key no replica has ever seen is a client error, not a
    // tombstone birth.
    if value.is_none() && highest == 0 {
        let reply = Datagram::base(uid, RESP_INVALID_KEY);
        if let Err(e) = node.cache.send_reply(&node.socket, &reply, from).await {
            warn!("sending remove reply: {e}");
        }
        return;
    }

    let cell = StoreVal {
        active: value.is_some(),
        val: value.unwrap_or_default(),
        timestamp: highest + 1,
    };
    debug!("writing {key} at timestamp {}", cell.timestamp);

    let (tx, mut rx) = mpsc::channel(replicas.len());
    for replica in replicas {
        let node = node.clone();
        let tx = tx.clone();
        let cell = cell.clone();
        tokio::spawn(async move {
            let _ = tx.send(replica_write(node, replica, key, cell).await).await;
        });
    }
    drop(tx);

    let mut successes = 0;
    while let Some(ok) = rx.recv().await {
        if ok {
            successes += 1;
            if successes >= need {
                break;
            }
        }
    }
    if successes < need {
        warn!("write quorum failed ({successes}/{need}), withholding reply");
        return;
    }

    let reply = Datagram::value(uid, RESP_OK, Vec::new());
    if let Err(e) = node.cache.send_reply(&node.socket, &reply, from).await {
        warn!("sending write reply: {e}");
    }
}
