//! Non-Real-Time Transport: reliable, fragmented, ACK-retried delivery
//! over a dedicated TCP connection (control port + 1), primarily for
//! SysEx.
//!
//! The teacher repo has no TCP reliable-channel precedent to adapt
//! directly, so this module is built in its general idiom instead: a
//! dedicated reader task owning the read half of the stream (the same
//! split-reader/writer-task shape `midi-host::main` uses for each of its
//! independent socket tasks), length-prefixed framing shaped like
//! `midi-protocol::packets`'s fixed-header-plus-payload records, and one
//! `tokio::sync::oneshot` per in-flight fragment — the same
//! one-shot-per-outstanding-request idiom the Connection Facade uses for
//! queries.
//!
//! Sending is split the same way: a dedicated writer task owns the write
//! half and drains an outbound queue one message at a time, so a caller
//! enqueuing a fragmented, multi-retry SysEx send never blocks on the
//! full round trip. Delivery failure (retries exhausted) is reported back
//! out-of-band on a failure channel instead of as a `Result` the caller
//! would have to await.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use meshmidi_protocol::wire::{FrameKind, ReliableFrame};

use crate::error::ConnectionError;

/// Sentinel device id carrying a heartbeat rather than an application
/// payload over the reliable channel. Reusing the existing `Data`/`Ack`
/// frame kinds (rather than adding a third `FrameKind`) keeps the wire
/// layout exactly as fixed elsewhere: a heartbeat is just a zero-length
/// single-fragment `Data` frame addressed to this id, acked like any
/// other fragment but never handed to reassembly.
pub const HEARTBEAT_DEVICE_ID: u16 = u16::MAX;

#[derive(Debug, Default)]
pub struct NrtStats {
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub fragments_sent: AtomicU64,
    pub fragments_received: AtomicU64,
    pub heartbeats_sent: AtomicU64,
    pub heartbeats_received: AtomicU64,
    pub retries: AtomicU64,
    pub failures: AtomicU64,
    pub protocol_errors: AtomicU64,
}

/// A fully reassembled inbound non-real-time message.
#[derive(Debug, Clone)]
pub struct NrtMessage {
    pub device_id: u16,
    pub sequence: u32,
    pub payload: Vec<u8>,
}

/// Reported on the failure channel when a queued send exhausts its
/// retries without being acked. Carries only the sequence number the
/// writer task assigned; the caller already knows what it enqueued.
#[derive(Debug, Clone, Copy)]
pub struct NrtSendFailure {
    pub sequence: u32,
}

struct Reassembly {
    fragments: Vec<Option<Vec<u8>>>,
    device_id: u16,
    received: usize,
}

type AckTable = Mutex<HashMap<(u32, u16), oneshot::Sender<()>>>;

/// One queued outbound message, fragmented and sent by the writer task.
struct OutboundRequest {
    device_id: u16,
    bytes: Vec<u8>,
    fragment_size: usize,
    ack_timeout: Duration,
    max_retries: u8,
}

/// A running NRT Transport over one TCP connection.
pub struct NrtTransport {
    outbound_tx: mpsc::UnboundedSender<OutboundRequest>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    cancel: CancellationToken,
    pub stats: Arc<NrtStats>,
}

impl NrtTransport {
    /// Take ownership of `stream` and start its reader and writer tasks.
    /// Inbound reassembled application messages are delivered on
    /// `inbound_tx`; inbound heartbeats fire `heartbeat_tx` instead and
    /// never reach `inbound_tx`. A send that exhausts its retries is
    /// reported on `failure_tx`, not as a `Result` from `send`/
    /// `send_heartbeat` — those only enqueue.
    pub fn spawn(
        stream: TcpStream,
        inbound_tx: mpsc::UnboundedSender<NrtMessage>,
        heartbeat_tx: mpsc::UnboundedSender<()>,
        failure_tx: mpsc::UnboundedSender<NrtSendFailure>,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();
        let write_half = Arc::new(Mutex::new(write_half));
        let ack_table: Arc<AckTable> = Arc::new(Mutex::new(HashMap::new()));
        let stats = Arc::new(NrtStats::default());
        let cancel = CancellationToken::new();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let reader = {
            let write_half = Arc::clone(&write_half);
            let ack_table = Arc::clone(&ack_table);
            let stats = Arc::clone(&stats);
            let cancel = cancel.clone();
            tokio::spawn(run_reader(
                read_half, write_half, ack_table, inbound_tx, heartbeat_tx, stats, cancel,
            ))
        };

        let writer = {
            let write_half = Arc::clone(&write_half);
            let ack_table = Arc::clone(&ack_table);
            let stats = Arc::clone(&stats);
            let cancel = cancel.clone();
            tokio::spawn(run_writer(
                write_half, ack_table, outbound_rx, failure_tx, stats, cancel,
            ))
        };

        Self {
            outbound_tx,
            reader,
            writer,
            cancel,
            stats,
        }
    }

    /// Queue a heartbeat for the writer task to send as a zero-length
    /// `Data` frame addressed to the heartbeat sentinel device id.
    /// Returns immediately; delivery (and its retries) happen off the
    /// caller's task.
    pub fn send_heartbeat(&self, ack_timeout: Duration, max_retries: u8) {
        let _ = self.outbound_tx.send(OutboundRequest {
            device_id: HEARTBEAT_DEVICE_ID,
            bytes: Vec::new(),
            fragment_size: 1,
            ack_timeout,
            max_retries,
        });
    }

    /// Queue `bytes` for the writer task to fragment and send in order,
    /// retrying each fragment up to `max_retries` times. Returns
    /// immediately; a delivery failure surfaces later on the failure
    /// channel passed to `spawn`.
    pub fn send(
        &self,
        device_id: u16,
        bytes: Vec<u8>,
        fragment_size: usize,
        ack_timeout: Duration,
        max_retries: u8,
    ) {
        let _ = self.outbound_tx.send(OutboundRequest {
            device_id,
            bytes,
            fragment_size,
            ack_timeout,
            max_retries,
        });
    }

    pub async fn shutdown(self, timeout: Duration) {
        self.cancel.cancel();
        drop(self.outbound_tx);
        if tokio::time::timeout(timeout, self.writer).await.is_err() {
            warn!("NRT transport writer did not shut down within {:?}", timeout);
        }
        if tokio::time::timeout(timeout, self.reader).await.is_err() {
            warn!("NRT transport reader did not shut down within {:?}", timeout);
        }
    }
}

/// Owns the write half. Drains `outbound_rx` one message at a time,
/// fragmenting and retrying each before moving to the next, so sends
/// stay in FIFO order on the wire. A message whose retries are exhausted
/// is reported on `failure_tx` and the writer moves on to the next
/// queued message rather than blocking the connection.
async fn run_writer(
    write_half: Arc<Mutex<OwnedWriteHalf>>,
    ack_table: Arc<AckTable>,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundRequest>,
    failure_tx: mpsc::UnboundedSender<NrtSendFailure>,
    stats: Arc<NrtStats>,
    cancel: CancellationToken,
) {
    let mut next_sequence: u32 = 0;

    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            request = outbound_rx.recv() => match request {
                Some(r) => r,
                None => break,
            },
        };

        let sequence = next_sequence;
        next_sequence = next_sequence.wrapping_add(1);

        let fragments: Vec<&[u8]> = if request.bytes.is_empty() {
            vec![&[][..]]
        } else {
            request.bytes.chunks(request.fragment_size.max(1)).collect()
        };
        let fragment_count = fragments.len() as u16;
        let is_heartbeat = request.device_id == HEARTBEAT_DEVICE_ID;

        let mut delivered = true;
        for (index, chunk) in fragments.iter().enumerate() {
            let frame = ReliableFrame {
                sequence,
                device_id: request.device_id,
                fragment_index: index as u16,
                fragment_count,
                kind: FrameKind::Data,
                body: chunk.to_vec(),
            };
            match send_fragment_with_retry(
                &write_half,
                &ack_table,
                &stats,
                &cancel,
                frame,
                request.ack_timeout,
                request.max_retries,
            )
            .await
            {
                Ok(()) => stats.fragments_sent.fetch_add(1, Ordering::Relaxed),
                Err(_) => {
                    delivered = false;
                    break;
                }
            }
        }

        if delivered {
            if is_heartbeat {
                stats.heartbeats_sent.fetch_add(1, Ordering::Relaxed);
            } else {
                stats.messages_sent.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            let _ = failure_tx.send(NrtSendFailure { sequence });
        }
    }
}

async fn send_fragment_with_retry(
    write_half: &Arc<Mutex<OwnedWriteHalf>>,
    ack_table: &Arc<AckTable>,
    stats: &Arc<NrtStats>,
    cancel: &CancellationToken,
    frame: ReliableFrame,
    ack_timeout: Duration,
    max_retries: u8,
) -> Result<(), ConnectionError> {
    let key = (frame.sequence, frame.fragment_index);

    for attempt in 0..=max_retries {
        let (ack_tx, ack_rx) = oneshot::channel();
        ack_table.lock().await.insert(key, ack_tx);

        let acked = tokio::select! {
            _ = cancel.cancelled() => {
                ack_table.lock().await.remove(&key);
                stats.failures.fetch_add(1, Ordering::Relaxed);
                return Err(ConnectionError::NonRealTimeFailure { sequence: frame.sequence });
            }
            write_result = write_frame(write_half, &frame) => {
                match write_result {
                    Ok(()) => tokio::time::timeout(ack_timeout, ack_rx).await.is_ok(),
                    Err(e) => {
                        warn!("NRT frame write failed: {e}");
                        false
                    }
                }
            }
        };

        ack_table.lock().await.remove(&key);
        if acked {
            return Ok(());
        }
        if attempt < max_retries {
            stats.retries.fetch_add(1, Ordering::Relaxed);
            debug!(sequence = frame.sequence, fragment = frame.fragment_index, attempt, "retrying NRT fragment");
        }
    }

    stats.failures.fetch_add(1, Ordering::Relaxed);
    Err(ConnectionError::NonRealTimeFailure {
        sequence: frame.sequence,
    })
}

async fn write_frame(write_half: &Arc<Mutex<OwnedWriteHalf>>, frame: &ReliableFrame) -> std::io::Result<()> {
    let mut buf = Vec::new();
    frame.serialize(&mut buf);
    let mut half = write_half.lock().await;
    half.write_all(&buf).await
}

async fn run_reader(
    mut read_half: OwnedReadHalf,
    write_half: Arc<Mutex<OwnedWriteHalf>>,
    ack_table: Arc<AckTable>,
    inbound_tx: mpsc::UnboundedSender<NrtMessage>,
    heartbeat_tx: mpsc::UnboundedSender<()>,
    stats: Arc<NrtStats>,
    cancel: CancellationToken,
) {
    let mut reassembly: HashMap<u32, Reassembly> = HashMap::new();

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_frame(&mut read_half) => frame,
        };

        let frame = match frame {
            Ok(FrameRead::Frame(frame)) => frame,
            Ok(FrameRead::Malformed) => {
                // Framing itself stayed in sync (we consumed exactly the
                // bytes the stream's own length prefix declared); only
                // the frame's own fields failed to parse. Drop it and
                // keep reading rather than tearing the connection down.
                stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                warn!("dropping malformed NRT frame");
                continue;
            }
            Ok(FrameRead::Eof) => break, // peer closed
            Err(e) => {
                warn!("NRT read error: {e}");
                break;
            }
        };

        match frame.kind {
            FrameKind::Ack => {
                let key = (frame.sequence, frame.fragment_index);
                if let Some(tx) = ack_table.lock().await.remove(&key) {
                    let _ = tx.send(());
                }
            }
            FrameKind::Data => {
                stats.fragments_received.fetch_add(1, Ordering::Relaxed);

                // Ack every received fragment, including duplicates.
                let ack = ReliableFrame {
                    sequence: frame.sequence,
                    device_id: frame.device_id,
                    fragment_index: frame.fragment_index,
                    fragment_count: frame.fragment_count,
                    kind: FrameKind::Ack,
                    body: Vec::new(),
                };
                let mut buf = Vec::new();
                ack.serialize(&mut buf);
                if let Err(e) = write_half.lock().await.write_all(&buf).await {
                    warn!("failed to ack NRT fragment: {e}");
                }

                if frame.device_id == HEARTBEAT_DEVICE_ID {
                    stats.heartbeats_received.fetch_add(1, Ordering::Relaxed);
                    let _ = heartbeat_tx.send(());
                    continue;
                }

                let entry = reassembly.entry(frame.sequence).or_insert_with(|| Reassembly {
                    fragments: vec![None; frame.fragment_count as usize],
                    device_id: frame.device_id,
                    received: 0,
                });

                let idx = frame.fragment_index as usize;
                if idx < entry.fragments.len() && entry.fragments[idx].is_none() {
                    entry.fragments[idx] = Some(frame.body);
                    entry.received += 1;
                }

                if entry.received == entry.fragments.len() {
                    let entry = reassembly.remove(&frame.sequence).unwrap();
                    let mut payload = Vec::new();
                    for fragment in entry.fragments.into_iter().flatten() {
                        payload.extend_from_slice(&fragment);
                    }
                    stats.messages_received.fetch_add(1, Ordering::Relaxed);
                    let _ = inbound_tx.send(NrtMessage {
                        device_id: entry.device_id,
                        sequence: frame.sequence,
                        payload,
                    });
                }
            }
        }
    }
}

/// Outcome of reading one length-prefixed frame off the wire.
///
/// `Malformed` is only reached once the stream's own declared length has
/// been fully consumed, so framing sync is preserved for the next read;
/// anything that loses sync (can't even read a length, or the stream
/// closes mid-frame) is `Eof`/an `Err` instead.
enum FrameRead {
    Frame(ReliableFrame),
    Malformed,
    Eof,
}

async fn read_frame(read_half: &mut OwnedReadHalf) -> std::io::Result<FrameRead> {
    let mut len_buf = [0u8; 4];
    if let Err(e) = read_half.read_exact(&mut len_buf).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Ok(FrameRead::Eof);
        }
        return Err(e);
    }
    let total_len = u32::from_le_bytes(len_buf) as usize;
    if total_len < ReliableFrame::HEADER_SIZE {
        // Can't even trust the declared length enough to know how many
        // bytes to skip to resync; treat as a dead stream.
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, "frame too short"));
    }
    let mut rest = vec![0u8; total_len - 4];
    read_half.read_exact(&mut rest).await?;

    let mut full = Vec::with_capacity(total_len);
    full.extend_from_slice(&len_buf);
    full.extend_from_slice(&rest);

    match ReliableFrame::deserialize(&full) {
        Some(frame) => Ok(FrameRead::Frame(frame)),
        None => Ok(FrameRead::Malformed),
    }
}
