//! Request de-duplication cache.
//!
//! At-most-once execution for non-idempotent commands: the first sighting of
//! a UID claims an entry, and the eventual successful reply is stashed so a
//! client retry inside the cache lifetime gets the identical bytes back
//! instead of a second execution.

use crate::net::message::Datagram;
use crate::net::types::RESP_OK;
use crate::types::Uid;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::debug;

/// Entry lifetime; client retries arrive well inside this.
pub const MAX_CACHE_LIFE: Duration = Duration::from_millis(5_000);

/// Sweep period for expired entries.
pub const GC_INTERVAL: Duration = Duration::from_millis(2_000);

struct CacheEntry {
    created: Instant,
    /// Raw reply bytes; resends must be byte-identical.
    reply: Option<Vec<u8>>,
}

#[derive(Default)]
pub struct ReplyCache {
    m: Mutex<HashMap<Uid, CacheEntry>>,
}

impl ReplyCache {
    pub fn new() -> Self {
        ReplyCache { m: Mutex::new(HashMap::new()) }
    }

    /// First phase: claim the UID. Returns `(already_seen, cached_reply)`;
    /// a seen UID with no reply yet means the first execution is still in
    /// flight and the retry should be dropped.
    pub async fn store_and_get_reply(&self, uid: Uid) -> (bool, Option<Vec<u8>>) {
        let mut m = self.m.lock().await;
        match m.get(&uid) {
            Some(entry) => (true, entry.reply.clone()),
            None => {
                m.insert(uid, CacheEntry { created: Instant::now(), reply: None });
                (false, None)
            }
        }
    }

    /// Second phase: transmit a reply, stashing it first when it is a
    /// successful mutation (`RespOk`) whose UID holds a claimed entry. Get
    /// replies never claimed an entry, so the stash is a no-op for them.
    pub async fn send_reply(
        &self,
        socket: &UdpSocket,
        reply: &Datagram,
        addr: SocketAddr,
    ) -> std::io::Result<()> {
        let bytes = reply.to_bytes();
        if reply.command() == RESP_OK {
            let mut m = self.m.lock().await;
            if let Some(entry) = m.get_mut(&reply.uid()) {
                entry.reply = Some(bytes.clone());
            }
        }
        socket.send_to(&bytes, addr).await?;
        Ok(())
    }

    /// Resend previously cached bytes verbatim.
    pub async fn resend(
        &self,
        socket: &UdpSocket,
        bytes: &[u8],
        addr: SocketAddr,
    ) -> std::io::Result<()> {
        socket.send_to(bytes, addr).await?;
        Ok(())
    }

    /// Drop entries older than `MAX_CACHE_LIFE`.
    pub async fn clean(&self) {
        self.clean_at(Instant::now()).await;
    }

    async fn clean_at(&self, now: Instant) {
        let mut m = self.m.lock().await;
        let before = m.len();
        m.retain(|_, entry| entry.created + MAX_CACHE_LIFE > now);
        let evicted = before - m.len();
        if evicted > 0 {
            debug!("reply cache gc evicted {evicted} entries");
        }
    }

    pub async fn len(&self) -> usize {
        self.m.lock().await.len()
    }
}
