//! The Connection Facade: a thin outer handle exposing a synchronous-
//! feeling API by pushing commands and waiting on per-query completion
//! signals.
//!
//! Grounded on the request/await-reply shape of `midi-client`'s health
//! server handlers and on `midi-client::main`'s ownership of a spawned
//! task's `JoinHandle` plus a `CancellationToken`, joined with a bounded
//! timeout at shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;

use meshmidi_protocol::message::MidiMessage;
use meshmidi_protocol::node::{DeviceInfo, NodeInfo};

use crate::command::{command_queue, Command, CommandQueueHandle};
use crate::config::ConnectionConfig;
use crate::error::ConnectionError;
use crate::worker::{self, ConnectionAtomics, ConnectionEvent, ConnectionState};

/// The liveness threshold used by `is_alive()`.
const LIVENESS_THRESHOLD_MS: u64 = 3000;

/// Public handle to one peer connection. Cloning is shallow: all clones
/// share the same worker and command queue.
#[derive(Clone)]
pub struct ConnectionFacade {
    remote: NodeInfo,
    config: ConnectionConfig,
    commands: CommandQueueHandle,
    atomics: Arc<ConnectionAtomics>,
    inner: Arc<FacadeInner>,
}

struct FacadeInner {
    worker_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionFacade {
    /// Construct a facade and its worker for `remote`. Fails synchronously
    /// (before any task is spawned) if `remote` is not a valid `NodeInfo`
    /// per spec §3 — the `InvalidConfig` taxonomy entry.
    pub fn new(
        local_identity: NodeInfo,
        remote: NodeInfo,
        config: ConnectionConfig,
        router_tx: Option<mpsc::UnboundedSender<MidiMessage>>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ConnectionEvent>), ConnectionError> {
        if !remote.is_valid() {
            return Err(ConnectionError::InvalidConfig(
                "NodeInfo must have a non-null id and positive ports".into(),
            ));
        }

        let (commands, atomics, events_rx, worker_handle) =
            worker::spawn(local_identity, remote.clone(), config.clone(), router_tx);

        let facade = Self {
            remote,
            config,
            commands,
            atomics,
            inner: Arc::new(FacadeInner {
                worker_handle: std::sync::Mutex::new(Some(worker_handle)),
            }),
        };
        Ok((facade, events_rx))
    }

    pub fn connect(&self) {
        self.commands.push(Command::Connect);
    }

    pub fn disconnect(&self) {
        self.commands.push(Command::Disconnect);
    }

    pub fn send_midi(&self, device_id: u16, bytes: Vec<u8>) {
        self.commands.push(Command::SendMidi { device_id, bytes });
    }

    pub fn check_heartbeat(&self) {
        self.commands.push(Command::CheckHeartbeat);
    }

    pub fn notify_heartbeat(&self) {
        self.commands.push(Command::NotifyHeartbeat);
    }

    /// Ask the worker to send a heartbeat frame to the remote peer over
    /// its NRT channel. No-op if not connected.
    pub fn send_heartbeat_wire(&self) {
        self.commands.push(Command::SendHeartbeat);
    }

    /// Lock-free snapshot read — no command round trip, per spec §9.
    pub fn get_state(&self) -> ConnectionState {
        self.atomics.state()
    }

    /// Lock-free snapshot read — no command round trip, per spec §9.
    pub fn get_time_since_last_heartbeat(&self) -> Duration {
        self.atomics.time_since_last_heartbeat()
    }

    pub fn is_alive(&self) -> bool {
        self.get_time_since_last_heartbeat() < Duration::from_millis(LIVENESS_THRESHOLD_MS)
    }

    pub async fn get_remote_node(&self) -> Option<NodeInfo> {
        let (tx, rx) = oneshot::channel();
        self.commands.push(Command::GetRemoteNode(tx));
        self.await_query(rx, || Some(self.remote.clone())).await
    }

    pub async fn get_remote_devices(&self) -> Vec<DeviceInfo> {
        let (tx, rx) = oneshot::channel();
        self.commands.push(Command::GetDevices(tx));
        self.await_query(rx, Vec::new).await
    }

    /// Query the worker for state rather than reading the atomic
    /// snapshot directly; exists to exercise the query path in tests
    /// and for callers that want a worker-ordered read.
    pub async fn query_state(&self) -> ConnectionState {
        let (tx, rx) = oneshot::channel();
        self.commands.push(Command::GetState(tx));
        self.await_query(rx, || ConnectionState::Disconnected).await
    }

    async fn await_query<T>(&self, rx: oneshot::Receiver<T>, default: impl FnOnce() -> T) -> T {
        match tokio::time::timeout(Duration::from_millis(self.config.query_timeout_ms), rx).await {
            Ok(Ok(value)) => value,
            _ => {
                warn!(node_id = %self.remote.id, "facade query timed out, returning default");
                default()
            }
        }
    }

    /// Push `Shutdown` and join the worker task within the configured
    /// timeout. Safe to call more than once; only the first call
    /// actually joins.
    pub async fn shutdown(&self) {
        self.commands.push(Command::Shutdown);
        let handle = self.inner.worker_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let timeout = Duration::from_millis(self.config.shutdown_join_timeout_ms);
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!(node_id = %self.remote.id, "worker did not join within shutdown timeout");
            }
        }
    }

    pub fn remote_node_info(&self) -> &NodeInfo {
        &self.remote
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn node(id: u128) -> NodeInfo {
        NodeInfo {
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
    async fn rejects_invalid_node_info_synchronously() {
        let mut bad = node(0); // id 0 is invalid
        bad.id = 0;
        let result = ConnectionFacade::new(node(1), bad, ConnectionConfig::default(), None);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn fresh_facade_starts_disconnected() {
        let (facade, _events) =
            ConnectionFacade::new(node(1), node(2), ConnectionConfig::default(), None).unwrap();
        assert_eq!(facade.get_state(), ConnectionState::Disconnected);
        assert!(!facade.is_alive());
        facade.shutdown().await;
    }

    #[tokio::test]
    async fn repeated_disconnect_on_disconnected_is_idempotent_and_silent() {
        let (facade, mut events) =
            ConnectionFacade::new(node(1), node(2), ConnectionConfig::default(), None).unwrap();
        facade.disconnect();
        facade.disconnect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(facade.get_state(), ConnectionState::Disconnected);
        // No StateChanged event should have fired.
        assert!(events.try_recv().is_err());
        facade.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_joins_worker_within_timeout() {
        let (facade, _events) =
            ConnectionFacade::new(node(1), node(2), ConnectionConfig::default(), None).unwrap();
        tokio::time::timeout(Duration::from_secs(2), facade.shutdown())
            .await
            .expect("shutdown must join worker within its configured timeout");
    }
}
