//! The node runtime.
//!
//! One explicitly constructed object owns the socket, store, ring, reply
//! cache, and gossip state; handlers receive it by `Arc` instead of going
//! through process-global state.

use crate::cache::ReplyCache;
use crate::config::Config;
use crate::gossip::{self, GossipState};
use crate::net::receiver;
use crate::net::types::MAX_DATAGRAM_SIZE;
use crate::ring::Membership;
use crate::store::Store;
use crate::types::{Key, node_id};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub struct NodeRuntime {
    pub id: Key,
    /// The address this node advertises; the ring id derives from it.
    pub addr: SocketAddr,
    pub config: Config,
    pub socket: Arc<UdpSocket>,
    pub store: Store,
    pub membership: Membership,
    pub cache: ReplyCache,
    pub gossip: GossipState,
    /// Inbound packet-drop percentage, test knob only.
    pub loss_percent: u8,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NodeRuntime {
    /// Bind the node socket and assemble the runtime. `port` zero asks the
    /// OS for an ephemeral port.
    pub async fn bind(
        config: Config,
        port: u16,
        loopback: bool,
        loss_percent: u8,
    ) -> std::io::Result<Arc<Self>> {
        let bind_ip: IpAddr = if loopback {
            Ipv4Addr::LOCALHOST.into()
        } else {
            Ipv4Addr::UNSPECIFIED.into()
        };
        let socket = UdpSocket::bind((bind_ip, port)).await?;
        let bound = socket.local_addr()?;

        // An unspecified bind address cannot name this node on the ring;
        // advertise the interface that routes outward instead.
        let advertise_ip = if bound.ip().is_unspecified() {
            discover_external_ip().await.unwrap_or(bound.ip())
        } else {
            bound.ip()
        };
        let addr = SocketAddr::new(advertise_ip, bound.port());
        let id = node_id(&addr);

        let well_known = config.well_known_addrs(&addr);
        if well_known.is_empty() {
            info!("no well-known peers; acting as a bootstrap node");
        }
        let max_replicas = config.max_replicas.max(1);

        Ok(Arc::new(NodeRuntime {
            id,
            addr,
            membership: Membership::new(id, addr, well_known, max_replicas),
            config,
            socket: Arc::new(socket),
            store: Store::new(),
            cache: ReplyCache::new(),
            gossip: GossipState::new(),
            loss_percent: loss_percent.min(100),
            tasks: Mutex::new(Vec::new()),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Spawn the receive loop and the periodic tasks: membership exchange,
    /// reply-cache GC, and status pushes when a status server is configured.
    pub async fn start(self: &Arc<Self>) {
        info!("node {} listening on {}", self.id, self.addr);
        let mut tasks = self.tasks.lock().await;

        let node = self.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = receiver::run(node).await {
                error!("receive loop terminated: {e}");
                std::process::exit(2);
            }
        }));

        let node = self.clone();
        tasks.push(tokio::spawn(gossip::membership_exchange_loop(node)));

        let node = self.clone();
        tasks.push(tokio::spawn(gossip::cache_gc_loop(node)));

        let node = self.clone();
        tasks.push(tokio::spawn(gossip::status_push_loop(node)));
    }

    /// Abort the background tasks. The socket stays bound until the last
    /// `Arc` drops, so in-flight senders see silence, not errors.
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!("node {} stopped", self.id);
    }
}

async fn discover_external_ip() -> Option<IpAddr> {
    // Connecting a UDP socket selects the outward route without sending
    // anything.
    let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.connect("8.8.8.8:53").await.ok()?;
    let ip = socket.local_addr().ok()?.ip();
    if ip.is_unspecified() { None } else { Some(ip) }
}

/// Minimal status collector (`--statsrv`): receive probe reports and log
/// them. The HTTP dashboard that used to render these lives outside this
/// crate.
pub async fn run_status_server(config: &Config) -> std::io::Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", config.status_server_port)).await?;
    info!("status server listening on {}", socket.local_addr()?);
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        match crate::net::parse_response(&buf[..n]) {
            Ok(report) => {
                let body = String::from_utf8_lossy(report.msg_value().unwrap_or_default())
                    .into_owned();
                info!(
                    "status report from {from} (code 0x{:02x}):\n{body}",
                    report.command()
                );
            }
            Err(e) => warn!("undecodable status report from {from}: {e}"),
        }
    }
}
