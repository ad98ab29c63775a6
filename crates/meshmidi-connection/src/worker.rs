//! The Connection Worker: a single task owning all mutable state for
//! one peer connection, draining commands from its queue in arrival
//! order and dispatching them per the table below.
//!
//! Grounded on the single-task-owns-shared-state pattern used for
//! `SharedState` in `midi-host`/`midi-client`'s daemon mains, tightened
//! to this subsystem's stronger invariant: only this task ever writes
//! connection state. `tracing::info_span!` wraps the whole task
//! lifetime the same way `midi-client`'s task-pulse loops are wrapped.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, info_span, warn, Instrument};

use meshmidi_protocol::handshake::{HandshakeRequest, HandshakeResponse};
use meshmidi_protocol::message::MidiMessage;
use meshmidi_protocol::node::{DeviceInfo, NodeInfo};

use crate::classifier::{classify, MessageClass};
use crate::command::{Command, CommandQueueHandle, CommandQueueReceiver};
use crate::config::ConnectionConfig;
use crate::error::ConnectionError;
use crate::ringbuf::{ring_buffer, RtPacket, RtRingProducer};
use crate::transport::nrt::NrtTransport;
use crate::transport::rt::{bind_ephemeral, RtTransport};

/// Finite connection state. See spec §3 for the transition table; this
/// enum only carries the four values, transitions are enforced by the
/// worker's dispatch logic, not by the type itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionState {
    fn to_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Connecting => 1,
            ConnectionState::Connected => 2,
            ConnectionState::Failed => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Failed,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Events the worker emits after mutating its state. These are the
/// "callbacks" of spec §4.6/§9 — emitted from the worker task, never
/// while any lock in this subsystem is held (sending on an mpsc channel
/// takes none).
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    StateChanged {
        old: ConnectionState,
        new: ConnectionState,
    },
    DevicesReceived(Vec<DeviceInfo>),
    MidiReceived(MidiMessage),
    Error(ConnectionError),
}

/// Scalar snapshot fields safe to read lock-free from any task, per
/// spec §9's explicit allowance for atomic snapshots of scalar,
/// monotonically-useful values. Richer data (devices, remote node) still
/// goes through a query command processed by the worker.
pub struct ConnectionAtomics {
    state: AtomicU8,
    start: Instant,
    last_heartbeat_ms: AtomicU64,
}

impl ConnectionAtomics {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(ConnectionState::Disconnected.to_u8()),
            start: Instant::now(),
            last_heartbeat_ms: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, s: ConnectionState) {
        self.state.store(s.to_u8(), Ordering::Release);
    }

    fn touch_heartbeat(&self) {
        let ms = self.start.elapsed().as_millis() as u64;
        self.last_heartbeat_ms.store(ms, Ordering::Relaxed);
    }

    pub fn time_since_last_heartbeat(&self) -> Duration {
        let now_ms = self.start.elapsed().as_millis() as u64;
        let last = self.last_heartbeat_ms.load(Ordering::Relaxed);
        Duration::from_millis(now_ms.saturating_sub(last))
    }
}

fn now_us() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u32
}

async fn recv_opt<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(r) => r.recv().await,
        None => std::future::pending().await,
    }
}

struct ConnectionWorker {
    remote: NodeInfo,
    local_identity: NodeInfo,
    config: ConnectionConfig,
    rx: CommandQueueReceiver,
    atomics: Arc<ConnectionAtomics>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    router_tx: Option<mpsc::UnboundedSender<MidiMessage>>,
    devices: Vec<DeviceInfo>,
    rt_producer: Option<RtRingProducer>,
    rt_transport: Option<RtTransport>,
    nrt_transport: Option<NrtTransport>,
    inbound_rt_rx: Option<mpsc::UnboundedReceiver<meshmidi_protocol::wire::RtDatagram>>,
    inbound_nrt_rx: Option<mpsc::UnboundedReceiver<crate::transport::nrt::NrtMessage>>,
    inbound_heartbeat_rx: Option<mpsc::UnboundedReceiver<()>>,
    inbound_nrt_failure_rx: Option<mpsc::UnboundedReceiver<crate::transport::nrt::NrtSendFailure>>,
}

/// Spawn a Connection Worker task for `remote`, returning the handle the
/// Facade pushes commands through, the atomics it can read lock-free,
/// the event stream it can forward to mesh-level callbacks, and the
/// task's `JoinHandle` for bounded-join-on-destruction.
pub fn spawn(
    local_identity: NodeInfo,
    remote: NodeInfo,
    config: ConnectionConfig,
    router_tx: Option<mpsc::UnboundedSender<MidiMessage>>,
) -> (
    CommandQueueHandle,
    Arc<ConnectionAtomics>,
    mpsc::UnboundedReceiver<ConnectionEvent>,
    JoinHandle<()>,
) {
    let (cmd_tx, cmd_rx) = crate::command::command_queue();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let atomics = ConnectionAtomics::new();

    let worker = ConnectionWorker {
        remote,
        local_identity,
        config,
        rx: cmd_rx,
        atomics: Arc::clone(&atomics),
        events_tx,
        router_tx,
        devices: Vec::new(),
        rt_producer: None,
        rt_transport: None,
        nrt_transport: None,
        inbound_rt_rx: None,
        inbound_nrt_rx: None,
        inbound_heartbeat_rx: None,
        inbound_nrt_failure_rx: None,
    };

    let handle = tokio::spawn(worker.run());
    (cmd_tx, atomics, events_rx, handle)
}

impl ConnectionWorker {
    async fn run(mut self) {
        let span = info_span!("connection", node_id = %self.remote.id);
        async move {
            loop {
                let poll = Duration::from_millis(self.config.command_queue_poll_ms);
                tokio::select! {
                    cmd = self.rx.wait_and_pop(poll) => {
                        if let Some(cmd) = cmd {
                            if self.dispatch(cmd).await {
                                break;
                            }
                        }
                    }
                    Some(dg) = recv_opt(&mut self.inbound_rt_rx) => {
                        self.deliver_midi(MidiMessage {
                            device_id: dg.device_id,
                            bytes: dg.payload,
                            timestamp_us: dg.timestamp_us,
                        });
                    }
                    Some(msg) = recv_opt(&mut self.inbound_nrt_rx) => {
                        self.deliver_midi(MidiMessage {
                            device_id: msg.device_id,
                            bytes: msg.payload,
                            timestamp_us: 0,
                        });
                    }
                    Some(()) = recv_opt(&mut self.inbound_heartbeat_rx) => {
                        self.atomics.touch_heartbeat();
                    }
                    Some(failure) = recv_opt(&mut self.inbound_nrt_failure_rx) => {
                        self.emit_error(ConnectionError::NonRealTimeFailure {
                            sequence: failure.sequence,
                        });
                    }
                }
            }
            // Shutdown always tears down first via dispatch(); this is
            // a backstop for a Shutdown arriving mid-handshake.
            self.teardown_partial().await;
        }
        .instrument(span)
        .await
    }

    /// Returns `true` if the worker should exit its loop.
    async fn dispatch(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Connect => {
                self.handle_connect().await;
                false
            }
            Command::Disconnect => {
                self.handle_disconnect().await;
                false
            }
            Command::CheckHeartbeat => {
                self.handle_check_heartbeat().await;
                false
            }
            Command::NotifyHeartbeat => {
                self.atomics.touch_heartbeat();
                false
            }
            Command::SendHeartbeat => {
                self.handle_send_heartbeat();
                false
            }
            Command::SendMidi { device_id, bytes } => {
                self.handle_send_midi(device_id, bytes);
                false
            }
            Command::GetState(reply) => {
                let _ = reply.send(self.atomics.state());
                false
            }
            Command::GetRemoteNode(reply) => {
                let _ = reply.send(Some(self.remote.clone()));
                false
            }
            Command::GetDevices(reply) => {
                let _ = reply.send(self.devices.clone());
                false
            }
            Command::GetHeartbeat(reply) => {
                let _ = reply.send(self.atomics.time_since_last_heartbeat());
                false
            }
            Command::Shutdown => {
                self.handle_disconnect().await;
                true
            }
        }
    }

    async fn handle_connect(&mut self) {
        if matches!(
            self.atomics.state(),
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return;
        }
        self.transition(ConnectionState::Connecting);

        match self.do_handshake_and_setup().await {
            Ok(()) => {
                self.atomics.touch_heartbeat();
                self.transition(ConnectionState::Connected);
                info!(node_id = %self.remote.id, "connected");
            }
            Err(e) => {
                self.teardown_partial().await;
                self.transition(ConnectionState::Failed);
                self.emit_error(e);
            }
        }
    }

    async fn do_handshake_and_setup(&mut self) -> Result<(), ConnectionError> {
        let std_udp =
            bind_ephemeral().map_err(|e| ConnectionError::SocketBindFailure(e.to_string()))?;
        let local_udp_port = std_udp
            .local_addr()
            .map_err(|e| ConnectionError::SocketBindFailure(e.to_string()))?
            .port();

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(self.config.handshake_timeout_ms))
            .timeout(Duration::from_millis(self.config.handshake_timeout_ms))
            .build()
            .map_err(|e| ConnectionError::HandshakeFailure(e.to_string()))?;

        let request = HandshakeRequest {
            node_id: self.local_identity.id.to_string(),
            node_name: self.local_identity.name.clone(),
            udp_endpoint: format!("{}:{}", self.local_identity.address, local_udp_port),
            version: meshmidi_protocol::PROTOCOL_VERSION.to_string(),
        };

        let url = format!(
            "http://{}:{}/network/handshake",
            self.remote.address, self.remote.control_port
        );
        let response = client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| ConnectionError::HandshakeFailure(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ConnectionError::HandshakeFailure(format!(
                "handshake failed: status {}",
                response.status()
            )));
        }

        let body: HandshakeResponse = response
            .json()
            .await
            .map_err(|e| ConnectionError::HandshakeFailure(e.to_string()))?;

        let remote_udp_addr: SocketAddr = body
            .udp_endpoint
            .parse()
            .map_err(|_| ConnectionError::HandshakeFailure("invalid udp_endpoint".into()))?;

        self.devices = body
            .devices
            .into_iter()
            .map(|d| DeviceInfo {
                id: d.id,
                name: d.name,
                direction: d.direction,
            })
            .collect();
        let _ = self
            .events_tx
            .send(ConnectionEvent::DevicesReceived(self.devices.clone()));

        let (producer, consumer) = ring_buffer(self.config.ring_buffer_capacity);
        let (rt_in_tx, rt_in_rx) = mpsc::unbounded_channel();
        let rt_transport = RtTransport::spawn(
            std_udp,
            remote_udp_addr,
            consumer,
            self.config.rt_batch_size,
            Some(rt_in_tx),
        )
        .map_err(|e| ConnectionError::SocketBindFailure(e.to_string()))?;

        let nrt_addr: SocketAddr = format!(
            "{}:{}",
            self.remote.address,
            self.remote.control_port + 1
        )
        .parse()
        .map_err(|_| ConnectionError::HandshakeFailure("invalid remote address".into()))?;

        let stream = tokio::time::timeout(
            Duration::from_millis(self.config.handshake_timeout_ms),
            TcpStream::connect(nrt_addr),
        )
        .await
        .map_err(|_| ConnectionError::HandshakeFailure("NRT connect timed out".into()))?
        .map_err(|e| ConnectionError::HandshakeFailure(e.to_string()))?;

        let (nrt_in_tx, nrt_in_rx) = mpsc::unbounded_channel();
        let (heartbeat_tx, heartbeat_rx) = mpsc::unbounded_channel();
        let (nrt_failure_tx, nrt_failure_rx) = mpsc::unbounded_channel();
        let nrt_transport = NrtTransport::spawn(stream, nrt_in_tx, heartbeat_tx, nrt_failure_tx);

        self.rt_producer = Some(producer);
        self.rt_transport = Some(rt_transport);
        self.nrt_transport = Some(nrt_transport);
        self.inbound_rt_rx = Some(rt_in_rx);
        self.inbound_nrt_rx = Some(nrt_in_rx);
        self.inbound_heartbeat_rx = Some(heartbeat_rx);
        self.inbound_nrt_failure_rx = Some(nrt_failure_rx);

        Ok(())
    }

    async fn handle_disconnect(&mut self) {
        if self.atomics.state() == ConnectionState::Disconnected {
            return; // idempotent: no state-change callback
        }
        self.teardown_partial().await;
        self.transition(ConnectionState::Disconnected);
    }

    async fn teardown_partial(&mut self) {
        if let Some(rt) = self.rt_transport.take() {
            rt.shutdown(Duration::from_secs(1)).await;
        }
        if let Some(nrt) = self.nrt_transport.take() {
            nrt.shutdown(Duration::from_secs(1)).await;
        }
        self.rt_producer = None;
        self.inbound_rt_rx = None;
        self.inbound_nrt_rx = None;
        self.inbound_heartbeat_rx = None;
        self.inbound_nrt_failure_rx = None;
    }

    async fn handle_check_heartbeat(&mut self) {
        if self.atomics.state() != ConnectionState::Connected {
            return;
        }
        let age = self.atomics.time_since_last_heartbeat();
        if age.as_millis() as u64 > self.config.heartbeat_timeout_ms {
            // Resources are released the same way an explicit disconnect
            // releases them; nothing in the spec asks for the sockets to
            // keep running once the connection is terminal.
            self.teardown_partial().await;
            self.transition(ConnectionState::Failed);
            self.emit_error(ConnectionError::HeartbeatTimeout);
        }
    }

    /// Classify and route one outbound MIDI message. Non-real-time
    /// delivery is only *enqueued* here — the NRT Transport's writer task
    /// owns the actual fragmenting, retrying send, so this never blocks
    /// the worker's `select!` loop on a round trip. A delivery failure
    /// (retries exhausted) surfaces later as an `inbound_nrt_failure_rx`
    /// event instead of a `Result` from this function.
    fn handle_send_midi(&mut self, device_id: u16, bytes: Vec<u8>) {
        if self.atomics.state() != ConnectionState::Connected || bytes.is_empty() {
            warn!(device_id, "dropping send_midi: connection not ready");
            return;
        }
        let class = match classify(&bytes) {
            Some(c) => c,
            None => return,
        };
        match class {
            MessageClass::RealTime => {
                if bytes.len() > crate::ringbuf::MAX_PAYLOAD {
                    warn!(device_id, len = bytes.len(), "real-time message oversize, dropping");
                    return;
                }
                if let Some(producer) = &self.rt_producer {
                    producer.write(RtPacket::new(device_id, now_us(), &bytes));
                }
            }
            MessageClass::NonRealTime => {
                if let Some(nrt) = &self.nrt_transport {
                    nrt.send(
                        device_id,
                        bytes,
                        self.config.nrt_fragment_size,
                        Duration::from_millis(self.config.nrt_ack_timeout_ms),
                        self.config.nrt_max_retries,
                    );
                }
            }
        }
    }

    /// Enqueue a wire heartbeat to the remote peer over the NRT channel.
    /// No-op if not connected; the Heartbeat Monitor drives the tick.
    /// Like `handle_send_midi`, this only enqueues — the writer task owns
    /// delivery and retry.
    fn handle_send_heartbeat(&mut self) {
        if self.atomics.state() != ConnectionState::Connected {
            return;
        }
        if let Some(nrt) = &self.nrt_transport {
            nrt.send_heartbeat(
                Duration::from_millis(self.config.nrt_ack_timeout_ms),
                self.config.nrt_max_retries,
            );
        }
    }

    fn deliver_midi(&self, msg: MidiMessage) {
        if let Some(router) = &self.router_tx {
            let _ = router.send(msg.clone());
        }
        let _ = self.events_tx.send(ConnectionEvent::MidiReceived(msg));
    }

    fn transition(&self, new: ConnectionState) {
        let old = self.atomics.state();
        if old == new {
            return;
        }
        self.atomics.set_state(new);
        let _ = self
            .events_tx
            .send(ConnectionEvent::StateChanged { old, new });
    }

    fn emit_error(&self, e: ConnectionError) {
        let _ = self.events_tx.send(ConnectionEvent::Error(e));
    }
}
