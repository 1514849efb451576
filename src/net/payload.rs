//! JSON payloads carried inside intra-cluster datagrams.
//!
//! Field names and encodings (hex map keys, base64 values, RFC3339
//! timestamps) are wire surface shared with every deployed node; keep them
//! stable.

use crate::ring::Peer;
use crate::store::StoreVal;
use crate::types::Key;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use tracing::warn;

/// UDP address as `{"IP": ..., "Port": ..., "Zone": ""}`. The zone field is
/// always empty here but stays in the schema for interop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddrJson {
    #[serde(rename = "IP")]
    pub ip: IpAddr,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "Zone", default)]
    pub zone: String,
}

impl From<SocketAddr> for AddrJson {
    fn from(addr: SocketAddr) -> Self {
        AddrJson { ip: addr.ip(), port: addr.port(), zone: String::new() }
    }
}

impl From<&AddrJson> for SocketAddr {
    fn from(a: &AddrJson) -> Self {
        SocketAddr::new(a.ip, a.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerJson {
    #[serde(rename = "Online")]
    pub online: bool,
    #[serde(rename = "LastSeen")]
    pub last_seen: DateTime<Utc>,
    #[serde(rename = "Addr")]
    pub addr: AddrJson,
}

/// Membership list: hex node id → peer record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerList {
    #[serde(rename = "Peers")]
    pub peers: HashMap<String, PeerJson>,
}

impl PeerList {
    pub fn from_peers<'a>(peers: impl IntoIterator<Item = (&'a Key, &'a Peer)>) -> Self {
        let peers = peers
            .into_iter()
            .map(|(id, p)| {
                (
                    id.to_hex(),
                    PeerJson { online: p.online, last_seen: p.last_seen, addr: p.addr.into() },
                )
            })
            .collect();
        PeerList { peers }
    }

    pub fn single(id: Key, peer: &Peer) -> Self {
        PeerList::from_peers([(&id, peer)])
    }

    /// Decode back into runtime peers, dropping entries whose id is not a
    /// well-formed 32-byte hex key.
    pub fn into_peers(self) -> HashMap<Key, Peer> {
        let mut out = HashMap::with_capacity(self.peers.len());
        for (hexkey, p) in self.peers {
            match Key::from_hex(&hexkey) {
                Some(id) => {
                    out.insert(
                        id,
                        Peer {
                            online: p.online,
                            last_seen: p.last_seen,
                            addr: SocketAddr::from(&p.addr),
                        },
                    );
                }
                None => warn!("discarding peer entry with bad id {hexkey}"),
            }
        }
        out
    }
}

/// `{"Val": base64, "Active": bool, "Timestamp": int}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreValJson {
    #[serde(rename = "Val", with = "b64")]
    pub val: Vec<u8>,
    #[serde(rename = "Active")]
    pub active: bool,
    #[serde(rename = "Timestamp")]
    pub timestamp: i64,
}

impl From<StoreVal> for StoreValJson {
    fn from(v: StoreVal) -> Self {
        StoreValJson { val: v.val, active: v.active, timestamp: v.timestamp }
    }
}

impl From<StoreValJson> for StoreVal {
    fn from(v: StoreValJson) -> Self {
        StoreVal { val: v.val, active: v.active, timestamp: v.timestamp }
    }
}

/// Store-push payload: hex storage key → value cell.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KvMap {
    #[serde(rename = "M")]
    pub m: HashMap<String, StoreValJson>,
}

impl KvMap {
    pub fn from_entries(entries: impl IntoIterator<Item = (Key, StoreVal)>) -> Self {
        let m = entries.into_iter().map(|(k, v)| (k.to_hex(), v.into())).collect();
        KvMap { m }
    }

    pub fn into_entries(self) -> Vec<(Key, StoreVal)> {
        self.m
            .into_iter()
            .filter_map(|(hexkey, v)| match Key::from_hex(&hexkey) {
                Some(k) => Some((k, v.into())),
                None => {
                    warn!("discarding pushed entry with bad key {hexkey}");
                    None
                }
            })
            .collect()
    }
}

mod b64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&base64::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        base64::decode(&s).map_err(serde::de::Error::custom)
    }
}
