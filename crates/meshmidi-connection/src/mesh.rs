//! Mesh Manager: the mesh-wide coordinator that owns the connection
//! pool and the heartbeat monitor, reacts to discovery events, and
//! aggregates statistics across every pooled connection.
//!
//! Grounded on `midi-host::main`'s top-level coordinator that owns a
//! registry of per-peer tasks plus one shared periodic monitor, wiring
//! each peer's event stream into a single mesh-wide event channel
//! rather than literal boxed callbacks.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};

use meshmidi_protocol::message::MidiMessage;
use meshmidi_protocol::node::NodeInfo;

use crate::config::ConnectionConfig;
use crate::error::ConnectionError;
use crate::facade::ConnectionFacade;
use crate::heartbeat::{ConnectionLost, HeartbeatMonitor};
use crate::pool::{ConnectionPool, PoolStats};
use crate::worker::{ConnectionEvent, ConnectionState};

/// Mesh-level events, the realization of spec §4.10's four named
/// callbacks (`onNodeConnected`-equivalent via `StateChanged`,
/// `onConnectionFailed`, `onNodeDisconnected`, `onConnectionLost`) plus
/// inbound MIDI, all funneled through one channel instead of per-node
/// boxed closures.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    StateChanged {
        node_id: u128,
        old: ConnectionState,
        new: ConnectionState,
    },
    DevicesReceived {
        node_id: u128,
        devices: Vec<meshmidi_protocol::node::DeviceInfo>,
    },
    MidiReceived {
        node_id: u128,
        message: MidiMessage,
    },
    ConnectionFailed {
        node_id: u128,
        reason: String,
    },
    ConnectionLost {
        node_id: u128,
        reason: String,
    },
    NodeDisconnected {
        node_id: u128,
        reason: String,
    },
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MeshStatistics {
    pub pool: PoolStats,
    pub heartbeats_sent: u64,
    pub timeouts_detected: u64,
    pub total_device_count: usize,
}

pub struct MeshManager {
    local_identity: NodeInfo,
    config: ConnectionConfig,
    pool: Arc<ConnectionPool>,
    heartbeat: HeartbeatMonitor,
    events_tx: mpsc::UnboundedSender<MeshEvent>,
    router_tx: Option<mpsc::UnboundedSender<MidiMessage>>,
}

impl MeshManager {
    /// Build a manager for `local_identity`. Returns the manager plus
    /// the single mesh-wide event stream callers should drain.
    pub fn new(
        local_identity: NodeInfo,
        config: ConnectionConfig,
        router_tx: Option<mpsc::UnboundedSender<MidiMessage>>,
    ) -> (Self, mpsc::UnboundedReceiver<MeshEvent>) {
        let pool = ConnectionPool::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (lost_tx, mut lost_rx) = mpsc::unbounded_channel::<ConnectionLost>();

        let heartbeat = HeartbeatMonitor::start(
            Arc::clone(&pool),
            Duration::from_millis(config.heartbeat_interval_ms),
            lost_tx,
        );

        {
            let events_tx = events_tx.clone();
            tokio::spawn(async move {
                while let Some(lost) = lost_rx.recv().await {
                    let _ = events_tx.send(MeshEvent::ConnectionLost {
                        node_id: lost.node_id,
                        reason: lost.reason,
                    });
                }
            });
        }

        let manager = Self {
            local_identity,
            config,
            pool,
            heartbeat,
            events_tx,
            router_tx,
        };
        (manager, events_rx)
    }

    /// React to a newly discovered peer. Idempotent: ignored if the id
    /// is our own or already pooled.
    pub async fn on_node_discovered(&self, remote: NodeInfo) {
        if remote.id == self.local_identity.id {
            return;
        }
        if self.pool.get(remote.id).await.is_some() {
            return;
        }

        let (facade, worker_events) = match ConnectionFacade::new(
            self.local_identity.clone(),
            remote.clone(),
            self.config.clone(),
            self.router_tx.clone(),
        ) {
            Ok(pair) => pair,
            Err(e) => {
                warn!(node_id = %remote.id, error = %e, "failed to construct facade for discovered node");
                let _ = self.events_tx.send(MeshEvent::ConnectionFailed {
                    node_id: remote.id,
                    reason: e.to_string(),
                });
                return;
            }
        };

        self.spawn_event_forwarder(remote.id, worker_events);
        self.pool.add(remote.id, facade.clone()).await;
        facade.connect();
        info!(node_id = %remote.id, "discovered node added to pool, connecting");
    }

    /// React to a discovery-reported removal. Tolerant of unknown ids.
    pub async fn on_node_removed(&self, id: u128) {
        if self.pool.remove(id).await {
            let _ = self.events_tx.send(MeshEvent::NodeDisconnected {
                node_id: id,
                reason: "removed from discovery".to_string(),
            });
        }
    }

    fn spawn_event_forwarder(
        &self,
        node_id: u128,
        mut worker_events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = worker_events.recv().await {
                let mesh_event = match event {
                    ConnectionEvent::StateChanged { old, new } => {
                        MeshEvent::StateChanged { node_id, old, new }
                    }
                    ConnectionEvent::DevicesReceived(devices) => {
                        MeshEvent::DevicesReceived { node_id, devices }
                    }
                    ConnectionEvent::MidiReceived(message) => {
                        MeshEvent::MidiReceived { node_id, message }
                    }
                    ConnectionEvent::Error(e) => MeshEvent::ConnectionFailed {
                        node_id,
                        reason: error_reason(&e),
                    },
                };
                let _ = events_tx.send(mesh_event);
            }
        });
    }

    /// NodeInfos for every pooled connection currently `Connected`.
    pub async fn connected_nodes(&self) -> Vec<NodeInfo> {
        let mut out = Vec::new();
        for facade in self.pool.by_state(ConnectionState::Connected).await {
            out.push(facade.remote_node_info().clone());
        }
        out
    }

    /// Sum of remote device counts across every `Connected` entry. Each
    /// facade query can take up to the configured query timeout, so
    /// this walks a pool snapshot rather than holding any lock.
    pub async fn total_device_count(&self) -> usize {
        let connected = self.pool.by_state(ConnectionState::Connected).await;
        let mut total = 0;
        for facade in connected {
            total += facade.get_remote_devices().await.len();
        }
        total
    }

    pub async fn statistics(&self) -> MeshStatistics {
        MeshStatistics {
            pool: self.pool.stats().await,
            heartbeats_sent: self.heartbeat.stats.heartbeats_sent.load(Ordering::Relaxed),
            timeouts_detected: self
                .heartbeat
                .stats
                .timeouts_detected
                .load(Ordering::Relaxed),
            total_device_count: self.total_device_count().await,
        }
    }

    pub async fn shutdown(self) {
        self.pool.clear().await;
        self.heartbeat.shutdown(Duration::from_secs(2)).await;
    }
}

fn error_reason(e: &ConnectionError) -> String {
    e.to_string()
}
