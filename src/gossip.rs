//! Bounded gossip, membership anti-entropy, and key-range hand-off.
//!
//! Gossip rounds are identified by the 32-byte key carried in the datagram:
//! a fresh round is processed and forwarded to `NotifyCount` peers; a
//! re-seen round keeps forwarding until a `1/K` coin flip retires it, which
//! bounds cluster-wide fan-out without global coordination.

use crate::coordinator;
use crate::net::message::Datagram;
use crate::net::payload::{KvMap, PeerList};
use crate::net::transport;
use crate::net::types::{
    CMD_MEMBERSHIP, CMD_MEMBERSHIP_EXCHANGE, CMD_MEMBERSHIP_FAILURE_GOSSIP, CMD_STORE_PUSH,
    RESP_OK,
};
use crate::node::NodeRuntime;
use crate::ring::{Peer, StorePush};
use crate::types::{Key, Uid};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant, interval};
use tracing::{debug, info, warn};

/// How long a retired round id is remembered; after this a re-announcement
/// (say, a peer failing twice) starts a fresh round.
pub const GOSSIP_ROUND_LIFE: Duration = Duration::from_secs(30);

struct Round {
    propagating: bool,
    started: Instant,
}

/// Per-node memory of gossip rounds in flight.
#[derive(Default)]
pub struct GossipState {
    rounds: Mutex<HashMap<Key, Round>>,
}

impl GossipState {
    pub fn new() -> Self {
        GossipState { rounds: Mutex::new(HashMap::new()) }
    }

    /// Record a sighting of `round`. Returns `(first_time, forward)`; a
    /// repeat sighting stops propagation with probability `1/k`.
    pub async fn observe(&self, round: Key, k: u32) -> (bool, bool) {
        let k = k.max(1);
        let mut rounds = self.rounds.lock().await;
        rounds.retain(|_, r| r.started.elapsed() < GOSSIP_ROUND_LIFE);
        match rounds.get_mut(&round) {
            None => {
                rounds.insert(round, Round { propagating: true, started: Instant::now() });
                (true, true)
            }
            Some(r) => {
                if r.propagating && rand::thread_rng().next_u32() % k == k - 1 {
                    debug!("retiring gossip round {round}");
                    r.propagating = false;
                }
                (false, r.propagating)
            }
        }
    }
}

/// Forward a round verbatim to `NotifyCount` random online peers, each copy
/// under a fresh UID.
pub async fn forward(node: &Arc<NodeRuntime>, command: u8, round_key: Key, value: &[u8]) {
    let targets = node.membership.gossip_targets(node.config.notify_count).await;
    for target in targets {
        let dgram =
            Datagram::key_value(Uid::generate(&node.addr), command, round_key, value.to_vec());
        if let Err(e) = transport::send(&node.socket, &dgram, target.addr).await {
            warn!("gossip to {} failed: {e}", target.addr);
        }
    }
}

/// Announce a failed peer: a single-entry offline peer list under the
/// failed node's id, gossiped with the bounded stop rule.
pub async fn announce_failure(node: &Arc<NodeRuntime>, failed_id: Key) {
    let Some(peer) = node.membership.peer(&failed_id).await else {
        return;
    };
    let entry = Peer { online: false, ..peer };
    let payload = match serde_json::to_vec(&PeerList::single(failed_id, &entry)) {
        Ok(p) => p,
        Err(e) => {
            warn!("serializing failure announcement: {e}");
            return;
        }
    };
    // Seed our own round memory so reflected copies obey the stop rule.
    node.gossip.observe(failed_id, node.config.k).await;
    info!("gossiping failure of {failed_id}");
    forward(node, CMD_MEMBERSHIP_FAILURE_GOSSIP, failed_id, &payload).await;
}

/// Periodic anti-entropy: swap peer lists with one random peer (or a
/// well-known bootstrap node while nobody is online yet).
pub async fn membership_exchange_loop(node: Arc<NodeRuntime>) {
    let mut tick = interval(Duration::from_millis(node.config.membership_frequency.max(1)));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let Some(contact) = node.membership.random_peer().await else {
            continue;
        };
        if let Err(e) = send_peer_list(&node, CMD_MEMBERSHIP_EXCHANGE, contact.addr).await {
            warn!("membership exchange with {} failed: {e}", contact.addr);
        }
    }
}

/// Send our peer list (without self; the receiver learns us as the sender).
pub async fn send_peer_list(
    node: &Arc<NodeRuntime>,
    command: u8,
    to: std::net::SocketAddr,
) -> std::io::Result<()> {
    debug_assert!(command == CMD_MEMBERSHIP || command == CMD_MEMBERSHIP_EXCHANGE);
    let peers = node.membership.peers_snapshot().await;
    let payload = serde_json::to_vec(&PeerList::from_peers(peers.iter()))
        .map_err(std::io::Error::other)?;
    let dgram =
        Datagram::key_value(Uid::generate(&node.addr), command, node.id, payload);
    transport::send(&node.socket, &dgram, to).await
}

/// Periodic status seeding: start a fresh probe round across the cluster
/// whenever a status server is configured.
pub async fn status_push_loop(node: Arc<NodeRuntime>) {
    if node.config.status_server_addr().is_none() {
        return;
    }
    let mut tick = interval(Duration::from_millis(node.config.update_frequency.max(1)));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        let Some(contact) = node.membership.random_peer().await else {
            continue;
        };
        let mut round = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut round);
        let dgram = Datagram::key_value(
            Uid::generate(&node.addr),
            crate::net::types::CMD_STATUS_UPDATE,
            Key(round),
            Vec::new(),
        );
        if let Err(e) = transport::send(&node.socket, &dgram, contact.addr).await {
            warn!("status push to {} failed: {e}", contact.addr);
        }
    }
}

/// Periodic reply-cache sweep.
pub async fn cache_gc_loop(node: Arc<NodeRuntime>) {
    let mut tick = interval(crate::cache::GC_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tick.tick().await;
        node.cache.clean().await;
    }
}

/// Hand the keys on `(range_lo, range_hi]` to a node that just became
/// responsible for them. Chunked so each datagram stays under the wire cap;
/// the receiver merges with `write_if_newer`, so replays are harmless.
pub async fn execute_push(node: &Arc<NodeRuntime>, push: StorePush) {
    let entries = node.store.entries_in_range(&push.range_lo, &push.range_hi).await;
    if entries.is_empty() {
        return;
    }
    info!("pushing {} keys to {}", entries.len(), push.target_id);

    // Greedy chunking by serialized size.
    let mut chunk: Vec<(Key, crate::store::StoreVal)> = Vec::new();
    let mut chunk_bytes = 0usize;
    let mut batches = Vec::new();
    for (key, val) in entries {
        // hex key + base64 value + field framing, over-estimated
        let entry_bytes = 64 + 16 + val.val.len() * 4 / 3 + 64;
        if !chunk.is_empty() && chunk_bytes + entry_bytes > crate::net::types::MAX_VALUE_SIZE {
            batches.push(std::mem::take(&mut chunk));
            chunk_bytes = 0;
        }
        chunk_bytes += entry_bytes;
        chunk.push((key, val));
    }
    if !chunk.is_empty() {
        batches.push(chunk);
    }

    for batch in batches {
        let payload = match serde_json::to_vec(&KvMap::from_entries(batch)) {
            Ok(p) => p,
            Err(e) => {
                warn!("serializing store push: {e}");
                continue;
            }
        };
        let reply = coordinator::intra_rpc(node, push.target_id, push.target_addr, |local| {
            Datagram::value(Uid::generate(&local), CMD_STORE_PUSH, payload)
        })
        .await;
        match reply {
            Some(r) if r.command() == RESP_OK => {}
            Some(r) => {
                warn!("store push rejected by {}: 0x{:02x}", push.target_id, r.command());
                return;
            }
            None => return,
        }
    }
}
