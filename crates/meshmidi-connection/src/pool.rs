//! Connection Pool: a thread-safe registry of facades keyed by remote
//! node identifier.
//!
//! Grounded on `midi-client::discovery`'s
//! `ClientState.discovered_hosts: RwLock<Vec<DiscoveredHost>>` pattern —
//! a brief lock to snapshot or mutate the map, then every further call
//! (disconnects, queries) happens after the guard is dropped. The pool's
//! own lock must never be held across a call into a facade, so that
//! worker-generated callbacks can never deadlock against a pool
//! operation.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::facade::ConnectionFacade;
use crate::worker::ConnectionState;

#[derive(Debug, Default, Clone, Copy)]
pub struct PoolStats {
    pub disconnected: usize,
    pub connecting: usize,
    pub connected: usize,
    pub failed: usize,
}

pub struct ConnectionPool {
    facades: RwLock<HashMap<u128, ConnectionFacade>>,
}

impl ConnectionPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            facades: RwLock::new(HashMap::new()),
        })
    }

    /// Add `facade`. Returns `false` without replacing anything if an
    /// entry for this node id already exists.
    pub async fn add(&self, id: u128, facade: ConnectionFacade) -> bool {
        let mut guard = self.facades.write().await;
        if guard.contains_key(&id) {
            return false;
        }
        guard.insert(id, facade);
        true
    }

    /// Gracefully disconnect and erase the entry for `id`, if any.
    pub async fn remove(&self, id: u128) -> bool {
        let facade = {
            let mut guard = self.facades.write().await;
            guard.remove(&id)
        };
        match facade {
            Some(facade) => {
                facade.shutdown().await;
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, id: u128) -> Option<ConnectionFacade> {
        self.facades.read().await.get(&id).cloned()
    }

    /// Snapshot of every pooled facade. Iteration by callers happens on
    /// this owned `Vec`, never under the pool's lock.
    pub async fn all(&self) -> Vec<ConnectionFacade> {
        self.facades.read().await.values().cloned().collect()
    }

    pub async fn by_state(&self, state: ConnectionState) -> Vec<ConnectionFacade> {
        self.facades
            .read()
            .await
            .values()
            .filter(|f| f.get_state() == state)
            .cloned()
            .collect()
    }

    /// Erase every facade whose state is `Failed`, or whose state is
    /// nominally `Connected` but `is_alive()` says otherwise.
    pub async fn remove_dead(&self) -> Vec<u128> {
        let dead_ids: Vec<u128> = {
            let guard = self.facades.read().await;
            guard
                .iter()
                .filter(|(_, f)| {
                    f.get_state() == ConnectionState::Failed
                        || (f.get_state() == ConnectionState::Connected && !f.is_alive())
                })
                .map(|(id, _)| *id)
                .collect()
        };
        for id in &dead_ids {
            self.remove(*id).await;
        }
        dead_ids
    }

    /// Disconnect and erase every pooled facade.
    pub async fn clear(&self) {
        let ids: Vec<u128> = self.facades.read().await.keys().copied().collect();
        for id in ids {
            self.remove(id).await;
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let guard = self.facades.read().await;
        let mut stats = PoolStats::default();
        for facade in guard.values() {
            match facade.get_state() {
                ConnectionState::Disconnected => stats.disconnected += 1,
                ConnectionState::Connecting => stats.connecting += 1,
                ConnectionState::Connected => stats.connected += 1,
                ConnectionState::Failed => stats.failed += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use std::net::{IpAddr, Ipv4Addr};

    fn node(id: u128) -> meshmidi_protocol::node::NodeInfo {
        meshmidi_protocol::node::NodeInfo {
            id,
            name: "peer".into(),
            hostname: "peer.local".into(),
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            control_port: 7070,
            udp_port: 1,
            protocol_version: "1".into(),
            advertised_device_count: 0,
        }
    }

    #[tokio::test]
    async fn add_rejects_duplicate_ids() {
        let pool = ConnectionPool::new();
        let (facade_a, _ev) =
            ConnectionFacade::new(node(1), node(2), ConnectionConfig::default(), None).unwrap();
        let (facade_b, _ev2) =
            ConnectionFacade::new(node(1), node(2), ConnectionConfig::default(), None).unwrap();

        assert!(pool.add(2, facade_a).await);
        assert!(!pool.add(2, facade_b).await);
        pool.clear().await;
    }

    #[tokio::test]
    async fn remove_is_graceful_and_idempotent() {
        let pool = ConnectionPool::new();
        let (facade, _ev) =
            ConnectionFacade::new(node(1), node(2), ConnectionConfig::default(), None).unwrap();
        pool.add(2, facade).await;

        assert!(pool.remove(2).await);
        assert!(!pool.remove(2).await); // already gone
        assert!(pool.get(2).await.is_none());
    }

    #[tokio::test]
    async fn stats_counts_by_state() {
        let pool = ConnectionPool::new();
        let (facade, _ev) =
            ConnectionFacade::new(node(1), node(2), ConnectionConfig::default(), None).unwrap();
        pool.add(2, facade).await;

        let stats = pool.stats().await;
        assert_eq!(stats.disconnected, 1);
        assert_eq!(stats.connected, 0);
        pool.clear().await;
    }
}
