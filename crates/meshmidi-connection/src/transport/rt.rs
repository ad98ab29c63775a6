//! Real-Time Transport: a dedicated sender task draining the ring
//! buffer into UDP datagrams, and an optional receiver task forwarding
//! inbound datagrams back to the worker.
//!
//! Grounded on `midi-host::broadcaster::run()`'s send-loop shape
//! (pop from a ring-buffer consumer, serialize, `send_to`, count
//! failures and continue) generalized from multicast fan-out to a
//! single unicast remote endpoint, and on the `socket2`-then-
//! `UdpSocket::from_std` non-blocking bind idiom used throughout the
//! teacher's transport code.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use meshmidi_protocol::wire::RtDatagram;

use crate::ringbuf::RtRingConsumer;

/// Lock-free atomic statistics for the RT sender.
#[derive(Debug, Default)]
pub struct RtTransportStats {
    pub sent: AtomicU64,
    pub send_failures: AtomicU64,
}

impl RtTransportStats {
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.sent.load(Ordering::Relaxed),
            self.send_failures.load(Ordering::Relaxed),
        )
    }
}

/// Bind a non-blocking UDP socket to an ephemeral local port.
pub fn bind_ephemeral() -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.bind(&"0.0.0.0:0".parse::<SocketAddr>().unwrap().into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// A running RT Transport: sender task (required) plus receiver task
/// (optional — spec §5 permits omitting an inbound UDP receiver).
pub struct RtTransport {
    socket: Arc<UdpSocket>,
    sender: JoinHandle<()>,
    receiver: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    pub stats: Arc<RtTransportStats>,
}

impl RtTransport {
    /// Start the sender (and, if `inbound_tx` is supplied, the
    /// receiver) over `std_socket`, targeting `remote_addr`.
    pub fn spawn(
        std_socket: std::net::UdpSocket,
        remote_addr: SocketAddr,
        consumer: RtRingConsumer,
        batch_size: usize,
        inbound_tx: Option<mpsc::UnboundedSender<RtDatagram>>,
    ) -> anyhow::Result<Self> {
        let socket = Arc::new(UdpSocket::from_std(std_socket)?);
        let stats = Arc::new(RtTransportStats::default());
        let cancel = CancellationToken::new();

        let sender = {
            let socket = Arc::clone(&socket);
            let stats = Arc::clone(&stats);
            let cancel = cancel.clone();
            tokio::spawn(run_sender(socket, remote_addr, consumer, batch_size, stats, cancel))
        };

        let receiver = inbound_tx.map(|tx| {
            let socket = Arc::clone(&socket);
            let cancel = cancel.clone();
            tokio::spawn(run_receiver(socket, tx, cancel))
        });

        Ok(Self {
            socket,
            sender,
            receiver,
            cancel,
            stats,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Stop the sender (and receiver, if running), waiting up to
    /// `timeout` for both to exit.
    pub async fn shutdown(self, timeout: Duration) {
        self.cancel.cancel();
        let join_all = async {
            let _ = self.sender.await;
            if let Some(r) = self.receiver {
                let _ = r.await;
            }
        };
        if tokio::time::timeout(timeout, join_all).await.is_err() {
            warn!("RT transport did not shut down within {:?}", timeout);
        }
    }
}

async fn run_sender(
    socket: Arc<UdpSocket>,
    remote_addr: SocketAddr,
    consumer: RtRingConsumer,
    batch_size: usize,
    stats: Arc<RtTransportStats>,
    cancel: CancellationToken,
) {
    let mut batch = Vec::with_capacity(batch_size);
    let mut buf = Vec::with_capacity(RtDatagram::HEADER_SIZE + 4);

    loop {
        batch.clear();
        tokio::select! {
            _ = cancel.cancelled() => break,
            n = consumer.read_async(&mut batch, batch_size) => {
                if n == 0 {
                    continue;
                }
            }
        }

        for pkt in &batch {
            let datagram = RtDatagram {
                device_id: pkt.device_id,
                timestamp_us: pkt.timestamp_us,
                payload: pkt.bytes().to_vec(),
            };
            datagram.serialize(&mut buf);
            match socket.send_to(&buf, remote_addr).await {
                Ok(_) => {
                    stats.sent.fetch_add(1, Ordering::Relaxed);
                    debug!(device_id = pkt.device_id, "sent RT datagram");
                }
                Err(e) => {
                    stats.send_failures.fetch_add(1, Ordering::Relaxed);
                    error!("RT datagram send failed: {e}");
                }
            }
        }
    }
}

async fn run_receiver(
    socket: Arc<UdpSocket>,
    inbound_tx: mpsc::UnboundedSender<RtDatagram>,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; 512];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, _from)) => {
                        if let Some(datagram) = RtDatagram::deserialize(&buf[..len]) {
                            let _ = inbound_tx.send(datagram);
                        }
                    }
                    Err(e) => {
                        error!("RT datagram recv failed: {e}");
                    }
                }
            }
        }
    }
}
