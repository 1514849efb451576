//! Versioned in-memory store.
//!
//! Each key holds a value cell with a per-key logical clock and an active
//! flag; `active == false` is a tombstone, which keeps deletion
//! distinguishable from never-written during quorum resolution.

use crate::error::StoreError;
use crate::types::Key;
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreVal {
    pub val: Vec<u8>,
    pub active: bool,
    /// Per-key logical timestamp; non-decreasing for the key's lifetime.
    pub timestamp: i64,
}

impl StoreVal {
    /// Stand-in for an absent key: inactive, timestamp zero. Lets quorum
    /// reads treat "not found" as data rather than as a replica failure.
    pub fn absent() -> Self {
        StoreVal { val: Vec::new(), active: false, timestamp: 0 }
    }
}

#[derive(Default)]
pub struct Store {
    m: Mutex<HashMap<Key, StoreVal>>,
}

impl Store {
    pub fn new() -> Self {
        Store { m: Mutex::new(HashMap::new()) }
    }

    pub async fn get(&self, key: &Key) -> Option<StoreVal> {
        self.m.lock().await.get(key).cloned()
    }

    /// Write with an incremented logical timestamp, atomically under the
    /// store lock: reads the current timestamp and writes `timestamp + 1`
    /// (1 for a fresh key). Tombstoning a key that was never written fails.
    pub async fn write_inc(
        &self,
        key: Key,
        val: Vec<u8>,
        active: bool,
    ) -> Result<i64, StoreError> {
        let mut m = self.m.lock().await;
        let ts = match m.get(&key) {
            Some(cur) => cur.timestamp + 1,
            None if active => 1,
            None => return Err(StoreError::NoValue),
        };
        m.insert(key, StoreVal { val, active, timestamp: ts });
        Ok(ts)
    }

    /// Upsert gated on the timestamp: applies only when `timestamp` is
    /// strictly newer than the resident cell. Equal timestamps are a no-op,
    /// so replayed replications cannot regress a key.
    pub async fn write_if_newer(&self, key: Key, incoming: StoreVal) -> bool {
        let mut m = self.m.lock().await;
        match m.get(&key) {
            Some(cur) if incoming.timestamp <= cur.timestamp => false,
            _ => {
                m.insert(key, incoming);
                true
            }
        }
    }

    /// Snapshot of keys in ring order.
    pub async fn sorted_keys(&self) -> Vec<Key> {
        let mut keys: Vec<Key> = self.m.lock().await.keys().copied().collect();
        keys.sort();
        keys
    }

    /// Snapshot of the entries whose key lies on the arc `(lo, hi]`.
    /// Feeds the migration push when a joining node takes over a range.
    pub async fn entries_in_range(&self, lo: &Key, hi: &Key) -> Vec<(Key, StoreVal)> {
        self.m
            .lock()
            .await
            .iter()
            .filter(|(k, _)| k.between(lo, hi))
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.m.lock().await.len()
    }
}
