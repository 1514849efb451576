//! Cluster configuration, loaded from a JSON file.
//!
//! Unknown keys are ignored; absent keys fall back to the defaults below, so
//! a partial config file is valid.

use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("parsing config file: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct Config {
    /// Gossip fan-out: peers each gossip round is forwarded to.
    pub notify_count: usize,
    /// Bounded-gossip stop parameter: a node re-seeing a round stops
    /// propagating it with probability 1/K.
    pub k: u32,
    /// Replica-set size ceiling.
    pub max_replicas: usize,
    /// Bootstrap hostnames tried when no peer is online yet.
    pub peer_list: Vec<String>,
    /// Port assumed for bootstrap peers (and for the loopback well-known
    /// node).
    pub default_localhost_port: u16,
    pub status_server: Option<String>,
    pub status_server_port: u16,
    pub status_server_http_port: u16,
    /// Millis between periodic status pushes.
    pub update_frequency: u64,
    /// Millis a peer RPC may take before the dialer gives up on the node.
    pub node_timeout: u64,
    /// Millis between membership exchanges.
    pub membership_frequency: u64,
    /// Millis allowed for resolving/dialing a bootstrap address.
    pub dial_timeout: u64,
    /// Host on 127.0.0.1 instead of the outward interface.
    pub use_loopback: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            notify_count: 2,
            k: 8,
            max_replicas: 3,
            peer_list: Vec::new(),
            default_localhost_port: 5555,
            status_server: None,
            status_server_port: 5066,
            status_server_http_port: 8080,
            update_frequency: 10_000,
            node_timeout: 700,
            membership_frequency: 5_000,
            dial_timeout: 1_000,
            use_loopback: false,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Load `path` if it exists, defaults otherwise. A present-but-broken
    /// file is still an error; silent fallback would mask typos.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            warn!("config file {} not found, using defaults", path.display());
            Ok(Config::default())
        }
    }

    /// Bootstrap addresses, excluding our own. In loopback mode the single
    /// well-known node is `localhost:DefaultLocalhostPort`; otherwise each
    /// `PeerList` hostname resolves against the same default port.
    pub fn well_known_addrs(&self, own: &SocketAddr) -> Vec<SocketAddr> {
        let mut out = Vec::new();
        if self.use_loopback {
            let candidate = ("127.0.0.1", self.default_localhost_port);
            if let Ok(addrs) = candidate.to_socket_addrs() {
                out.extend(addrs.filter(|a| a != own));
            }
        } else {
            for host in &self.peer_list {
                match (host.as_str(), self.default_localhost_port).to_socket_addrs() {
                    Ok(addrs) => out.extend(addrs.filter(|a| a.is_ipv4() && a != own)),
                    Err(e) => warn!("cannot resolve bootstrap peer {host}: {e}"),
                }
            }
        }
        out
    }

    pub fn status_server_addr(&self) -> Option<SocketAddr> {
        let host = self.status_server.as_deref()?;
        let mut addrs = (host, self.status_server_port).to_socket_addrs().ok()?;
        addrs.find(|a| a.is_ipv4())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_keys() {
        let cfg: Config = serde_json::from_str(r#"{"NotifyCount": 4, "K": 16}"#).unwrap();
        assert_eq!(cfg.notify_count, 4);
        assert_eq!(cfg.k, 16);
        assert_eq!(cfg.max_replicas, 3);
        assert_eq!(cfg.default_localhost_port, 5555);
        assert!(!cfg.use_loopback);
    }

    #[test]
    fn recognized_keys_parse() {
        let cfg: Config = serde_json::from_str(
            r#"{
                "MaxReplicas": 5,
                "PeerList": ["kv1.example.com", "kv2.example.com"],
                "DefaultLocalhostPort": 6000,
                "StatusServer": "status.example.com",
                "StatusServerPort": 5066,
                "StatusServerHttpPort": 8081,
                "UpdateFrequency": 30000,
                "NodeTimeout": 500,
                "MembershipFrequency": 2000,
                "DialTimeout": 750,
                "UseLoopback": true
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.max_replicas, 5);
        assert_eq!(cfg.peer_list.len(), 2);
        assert_eq!(cfg.membership_frequency, 2000);
        assert!(cfg.use_loopback);
    }

    #[test]
    fn loopback_well_known_excludes_self() {
        let cfg = Config { use_loopback: true, default_localhost_port: 5555, ..Config::default() };
        let own: SocketAddr = "127.0.0.1:5555".parse().unwrap();
        assert!(cfg.well_known_addrs(&own).is_empty());

        let other: SocketAddr = "127.0.0.1:5556".parse().unwrap();
        let peers = cfg.well_known_addrs(&other);
        assert_eq!(peers, vec!["127.0.0.1:5555".parse::<SocketAddr>().unwrap()]);
    }
}
