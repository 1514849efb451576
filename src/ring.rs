//! Consistent-hash ring and peer membership.
//!
//! The ring is the sorted list of node ids `{self} ∪ {online peers}`,
//! recomputed inside the membership lock after every mutation. Key
//! responsibility walks clockwise to the first id at or past the key;
//! replica sets walk counter-clockwise from there.

use crate::types::Key;
use chrono::{DateTime, Duration, Utc};
use rand::seq::SliceRandom;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// A peer is evicted once unseen for this long.
pub const TIME_TILL_MEMBER_DROP_SECS: i64 = 60;

/// Clock-skew allowance when judging a remote `last_seen` plausible.
pub const TIME_ERR_MS: i64 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    pub online: bool,
    pub last_seen: DateTime<Utc>,
    pub addr: SocketAddr,
}

impl Peer {
    pub fn seen_now(addr: SocketAddr) -> Self {
        Peer { online: true, last_seen: Utc::now(), addr }
    }
}

/// A replica slot for quorum fan-out. `addr` is `None` for the local node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replica {
    pub id: Key,
    pub addr: Option<SocketAddr>,
}

/// Somewhere to send a datagram: a known ring member or a bootstrap address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub id: Option<Key>,
    pub addr: SocketAddr,
}

/// Key-range hand-off owed to a node that just joined the arc between our
/// old predecessor and us. Emitted by `update_peers`, executed by the
/// gossip layer so the ring itself stays free of network code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePush {
    pub target_id: Key,
    pub target_addr: SocketAddr,
    /// Push every stored key on the arc `(range_lo, range_hi]`.
    pub range_lo: Key,
    pub range_hi: Key,
}

struct Inner {
    known_peers: HashMap<Key, Peer>,
    /// Sorted ids of `{self} ∪ {online peers}`.
    ring: Vec<Key>,
}

pub struct Membership {
    self_id: Key,
    self_addr: SocketAddr,
    well_known: Vec<SocketAddr>,
    max_replicas: usize,
    inner: Mutex<Inner>,
}

fn predecessor_index(i: usize, len: usize) -> usize {
    (i + len - 1) % len
}

/// Index of the first ring id `>= key`, wrapping to 0 past the top.
fn successor_position(ring: &[Key], key: &Key) -> usize {
    match ring.binary_search(key) {
        Ok(i) => i,
        Err(i) if i == ring.len() => 0,
        Err(i) => i,
    }
}

impl Membership {
    pub fn new(
        self_id: Key,
        self_addr: SocketAddr,
        well_known: Vec<SocketAddr>,
        max_replicas: usize,
    ) -> Self {
        Membership {
            self_id,
            self_addr,
            well_known,
            max_replicas,
            inner: Mutex::new(Inner { known_peers: HashMap::new(), ring: vec![self_id] }),
        }
    }

    pub fn self_id(&self) -> Key {
        self.self_id
    }

    pub fn self_addr(&self) -> SocketAddr {
        self.self_addr
    }

    fn rebuild(&self, inner: &mut Inner) {
        let mut ring: Vec<Key> = inner
            .known_peers
            .iter()
            .filter(|(_, p)| p.online)
            .map(|(id, _)| *id)
            .collect();
        ring.push(self.self_id);
        ring.sort();
        ring.dedup();
        inner.ring = ring;
    }

    pub async fn ring_snapshot(&self) -> Vec<Key> {
        self.inner.lock().await.ring.clone()
    }

    pub async fn peers_snapshot(&self) -> HashMap<Key, Peer> {
        self.inner.lock().await.known_peers.clone()
    }

    pub async fn peer(&self, id: &Key) -> Option<Peer> {
        self.inner.lock().await.known_peers.get(id).cloned()
    }

    pub async fn online_count(&self) -> usize {
        self.inner.lock().await.ring.len() - 1
    }

    /// The node owning `key`: first online id clockwise at or past it.
    pub async fn responsible_for(&self, key: &Key) -> Key {
        let inner = self.inner.lock().await;
        inner.ring[successor_position(&inner.ring, key)]
    }

    /// Up to `max_replicas` distinct ids for `key`, primary first, walking
    /// the ring counter-clockwise from the responsible node.
    pub async fn replica_set(&self, key: &Key) -> Vec<Replica> {
        let inner = self.inner.lock().await;
        let ring = &inner.ring;
        let count = self.max_replicas.min(ring.len());
        let mut pos = successor_position(ring, key);
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            let id = ring[pos];
            let addr = if id == self.self_id {
                None
            } else {
                inner.known_peers.get(&id).map(|p| p.addr)
            };
            out.push(Replica { id, addr });
            pos = predecessor_index(pos, ring.len());
        }
        out
    }

    /// Merge a remote peer list. Returns the store pushes owed to nodes
    /// that just became responsible for a slice of our range.
    pub async fn update_peers(
        &self,
        remote: HashMap<Key, Peer>,
        sender_id: Key,
        sender_addr: SocketAddr,
    ) -> Vec<StorePush> {
        let now = Utc::now();
        let plausible = now + Duration::milliseconds(TIME_ERR_MS);
        let mut inner = self.inner.lock().await;

        // The range we may owe a newcomer is bounded by our predecessor
        // before this merge.
        let self_pos = successor_position(&inner.ring, &self.self_id);
        let old_pred = inner.ring[predecessor_index(self_pos, inner.ring.len())];
        let prev_online: HashSet<Key> = inner.ring.iter().copied().collect();

        for (id, rp) in remote {
            if id == self.self_id {
                continue;
            }
            match inner.known_peers.entry(id) {
                Entry::Occupied(mut existing) => {
                    // Take the remote record only when its last_seen is not
                    // beyond our own clock (plus skew allowance).
                    if plausible >= rp.last_seen {
                        *existing.get_mut() = rp;
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(rp);
                }
            }
        }

        if sender_id != self.self_id {
            inner
                .known_peers
                .insert(sender_id, Peer { online: true, last_seen: now, addr: sender_addr });
        }

        let drop_before = now - Duration::seconds(TIME_TILL_MEMBER_DROP_SECS);
        let before = inner.known_peers.len();
        inner.known_peers.retain(|_, p| p.last_seen > drop_before);
        if inner.known_peers.len() < before {
            debug!("expired {} unseen peers", before - inner.known_peers.len());
        }

        self.rebuild(&mut inner);

        let mut pushes = Vec::new();
        let ring = inner.ring.clone();
        for id in &ring {
            if *id == self.self_id || prev_online.contains(id) {
                continue;
            }
            // Newly online. If it landed between our old predecessor and
            // us, it now owns the head of our range.
            if id.between(&old_pred, &self.self_id) {
                let pos = successor_position(&ring, id);
                let pred = ring[predecessor_index(pos, ring.len())];
                if let Some(peer) = inner.known_peers.get(id) {
                    info!("node {id} joined our arc, handing off ({pred}, {id}]");
                    pushes.push(StorePush {
                        target_id: *id,
                        target_addr: peer.addr,
                        range_lo: pred,
                        range_hi: *id,
                    });
                }
            }
        }
        pushes
    }

    /// Mark a peer offline without forgetting it; it may come back before
    /// the membership drop deadline.
    pub async fn set_peer_offline(&self, id: &Key) {
        let mut inner = self.inner.lock().await;
        if let Some(peer) = inner.known_peers.get_mut(id) {
            if peer.online {
                info!("marking peer {id} offline");
                peer.online = false;
            }
        }
        self.rebuild(&mut inner);
    }

    /// Apply a failure announcement: every listed id goes offline. Unknown
    /// ids are ignored; there is nothing to mark.
    pub async fn merge_failures(&self, failed: impl IntoIterator<Item = Key>) {
        let mut inner = self.inner.lock().await;
        for id in failed {
            if id == self.self_id {
                continue;
            }
            if let Some(peer) = inner.known_peers.get_mut(&id) {
                peer.online = false;
            }
        }
        self.rebuild(&mut inner);
    }

    /// A uniformly random online peer, falling back to a well-known
    /// bootstrap address when nobody is online yet.
    pub async fn random_peer(&self) -> Option<Contact> {
        let inner = self.inner.lock().await;
        let online: Vec<(Key, SocketAddr)> = inner
            .known_peers
            .iter()
            .filter(|(_, p)| p.online)
            .map(|(id, p)| (*id, p.addr))
            .collect();
        drop(inner);

        let mut rng = rand::thread_rng();
        if let Some((id, addr)) = online.choose(&mut rng) {
            return Some(Contact { id: Some(*id), addr: *addr });
        }
        self.well_known
            .choose(&mut rng)
            .map(|addr| Contact { id: None, addr: *addr })
    }

    /// Up to `n` distinct online peers for gossip fan-out.
    pub async fn gossip_targets(&self, n: usize) -> Vec<Contact> {
        let inner = self.inner.lock().await;
        let mut online: Vec<Contact> = inner
            .known_peers
            .iter()
            .filter(|(_, p)| p.online)
            .map(|(id, p)| Contact { id: Some(*id), addr: p.addr })
            .collect();
        drop(inner);
        online.shuffle(&mut rand::thread_rng());
        online.truncate(n);
        online
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u8) -> Key {
        let mut b = [0u8; 32];
        b[0] = n;
        Key(b)
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn online_peer(port: u16) -> Peer {
        Peer::seen_now(addr(port))
    }

    fn membership(self_n: u8) -> Membership {
        Membership::new(key(self_n), addr(5000 + self_n as u16), Vec::new(), 3)
    }

    async fn seed(m: &Membership, peers: &[(u8, u16)]) {
        let remote: HashMap<Key, Peer> =
            peers.iter().map(|(n, port)| (key(*n), online_peer(*port))).collect();
        // Seed from the first peer so the sender refresh does not add
        // anything beyond the list itself.
        let (sender_n, sender_port) = peers[0];
        m.update_peers(remote, key(sender_n), addr(sender_port)).await;
    }

    #[test]
    fn predecessor_is_modular() {
        assert_eq!(predecessor_index(0, 5), 4);
        assert_eq!(predecessor_index(3, 5), 2);
        assert_eq!(predecessor_index(1, 5), 0);
        assert_eq!(predecessor_index(0, 1), 0);
    }

    #[tokio::test]
    async fn ring_is_sorted_and_holds_self_plus_online() {
        let m = membership(50);
        seed(&m, &[(10, 6010), (90, 6090), (30, 6030)]).await;

        let ring = m.ring_snapshot().await;
        assert_eq!(ring, vec![key(10), key(30), key(50), key(90)]);

        m.set_peer_offline(&key(30)).await;
        assert_eq!(m.ring_snapshot().await, vec![key(10), key(50), key(90)]);
        // still known, just offline
        assert!(!m.peer(&key(30)).await.unwrap().online);
    }

    #[tokio::test]
    async fn responsible_for_walks_clockwise_and_wraps() {
        let m = membership(50);
        seed(&m, &[(10, 6010), (90, 6090)]).await;

        assert_eq!(m.responsible_for(&key(5)).await, key(10));
        assert_eq!(m.responsible_for(&key(10)).await, key(10));
        assert_eq!(m.responsible_for(&key(11)).await, key(50));
        assert_eq!(m.responsible_for(&key(60)).await, key(90));
        // past the top id, wrap to the smallest
        assert_eq!(m.responsible_for(&key(200)).await, key(10));
    }

    #[tokio::test]
    async fn replica_set_walks_counter_clockwise() {
        let m = membership(50);
        seed(&m, &[(10, 6010), (30, 6030), (90, 6090)]).await;
        // ring: 10 30 50 90; key 25 -> primary 30, then predecessors 10, 90
        let replicas = m.replica_set(&key(25)).await;
        let ids: Vec<Key> = replicas.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![key(30), key(10), key(90)]);
        // local slot has no addr
        assert!(replicas.iter().all(|r| (r.id == key(50)) == r.addr.is_none()));
    }

    #[tokio::test]
    async fn replica_set_capped_by_ring_size_and_distinct() {
        let m = membership(50);
        seed(&m, &[(10, 6010)]).await;
        let replicas = m.replica_set(&key(1)).await;
        assert_eq!(replicas.len(), 2);
        let ids: HashSet<Key> = replicas.iter().map(|r| r.id).collect();
        assert_eq!(ids.len(), 2);
    }

    #[tokio::test]
    async fn update_peers_refreshes_sender_and_evicts_stale() {
        let m = membership(50);
        let stale = Peer {
            online: true,
            last_seen: Utc::now() - Duration::seconds(TIME_TILL_MEMBER_DROP_SECS + 5),
            addr: addr(6070),
        };
        let remote = HashMap::from([(key(70), stale)]);
        m.update_peers(remote, key(10), addr(6010)).await;

        // The stale entry was dropped on arrival; the sender was inserted.
        let peers = m.peers_snapshot().await;
        assert!(!peers.contains_key(&key(70)));
        assert!(peers[&key(10)].online);
        assert_eq!(m.ring_snapshot().await, vec![key(10), key(50)]);
    }

    #[tokio::test]
    async fn update_peers_rejects_future_timestamps_for_known_peers() {
        let m = membership(50);
        seed(&m, &[(10, 6010)]).await;
        let seen = m.peer(&key(10)).await.unwrap();

        // A record claiming to be from the future must not overwrite.
        let future = Peer {
            online: false,
            last_seen: Utc::now() + Duration::seconds(30),
            addr: addr(6010),
        };
        m.update_peers(HashMap::from([(key(10), future)]), key(90), addr(6090)).await;
        let after = m.peer(&key(10)).await.unwrap();
        assert!(after.online);
        assert!(after.last_seen >= seen.last_seen);
    }

    #[tokio::test]
    async fn joining_node_in_our_arc_triggers_store_push() {
        let m = membership(50);
        seed(&m, &[(90, 6090)]).await;
        // ring: 50(self), 90. Our arc is (90, 50]. A node at 20 joins it.
        let pushes =
            m.update_peers(HashMap::from([(key(20), online_peer(6020))]), key(90), addr(6090)).await;
        assert_eq!(pushes.len(), 1);
        let push = &pushes[0];
        assert_eq!(push.target_id, key(20));
        assert_eq!(push.target_addr, addr(6020));
        // new ring: 20 50 90 -> predecessor of 20 is 90
        assert_eq!(push.range_lo, key(90));
        assert_eq!(push.range_hi, key(20));
    }

    #[tokio::test]
    async fn joining_node_outside_our_arc_triggers_nothing() {
        let m = membership(50);
        seed(&m, &[(90, 6090)]).await;
        // 60 lands in (50, 90], which 90 owns, not us.
        let pushes =
            m.update_peers(HashMap::from([(key(60), online_peer(6060))]), key(90), addr(6090)).await;
        assert!(pushes.is_empty());
    }

    #[tokio::test]
    async fn first_contact_hands_off_from_a_singleton_ring() {
        let m = membership(50);
        // Alone, we own everything; the first joiner takes its slice.
        let pushes = m
            .update_peers(HashMap::from([(key(90), online_peer(6090))]), key(90), addr(6090))
            .await;
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].range_hi, key(90));
        assert_eq!(pushes[0].range_lo, key(50));
    }

    #[tokio::test]
    async fn merge_failures_downs_listed_peers() {
        let m = membership(50);
        seed(&m, &[(10, 6010), (90, 6090)]).await;
        m.merge_failures([key(10), key(200)]).await;
        assert!(!m.peer(&key(10)).await.unwrap().online);
        assert_eq!(m.ring_snapshot().await, vec![key(50), key(90)]);
    }

    #[tokio::test]
    async fn random_peer_prefers_online_falls_back_to_well_known() {
        let bootstrap = vec![addr(7000)];
        let m = Membership::new(key(50), addr(5050), bootstrap, 3);
        let contact = m.random_peer().await.unwrap();
        assert_eq!(contact.addr, addr(7000));
        assert!(contact.id.is_none());

        seed(&m, &[(10, 6010)]).await;
        let contact = m.random_peer().await.unwrap();
        assert_eq!(contact.id, Some(key(10)));
    }

    #[tokio::test]
    async fn offline_peer_can_return() {
        let m = membership(50);
        seed(&m, &[(10, 6010)]).await;
        m.set_peer_offline(&key(10)).await;
        assert_eq!(m.ring_snapshot().await, vec![key(50)]);

        // A fresh exchange from the peer resurrects it and re-triggers the
        // hand-off for its arc.
        let pushes =
            m.update_peers(HashMap::new(), key(10), addr(6010)).await;
        assert_eq!(m.ring_snapshot().await, vec![key(10), key(50)]);
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].target_id, key(10));
    }
}
