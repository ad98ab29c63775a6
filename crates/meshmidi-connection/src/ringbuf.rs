//! Lock-free SPSC ring buffer carrying real-time MIDI packets from the
//! producer (whoever calls `send_midi`) to the RT Transport sender.
//!
//! Adapted from the protocol crate's MIDI hot-path ring buffer: same
//! cache-line-padded atomic head/tail design, same `Notify`-based async
//! wakeup. Two differences from that version: slots hold a structured
//! [`RtPacket`] rather than raw bytes, and overflow increments a
//! persistent drop counter rather than silently truncating — the spec
//! requires `write()` to never block and to report running totals.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Maximum payload carried by one real-time packet (one MIDI
/// channel-voice or system message, never SysEx).
pub const MAX_PAYLOAD: usize = 4;

/// One real-time MIDI message as stored in a ring-buffer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtPacket {
    pub device_id: u16,
    pub timestamp_us: u32,
    pub len: u8,
    pub payload: [u8; MAX_PAYLOAD],
}

impl RtPacket {
    pub fn new(device_id: u16, timestamp_us: u32, bytes: &[u8]) -> Self {
        let len = bytes.len().min(MAX_PAYLOAD);
        let mut payload = [0u8; MAX_PAYLOAD];
        payload[..len].copy_from_slice(&bytes[..len]);
        Self {
            device_id,
            timestamp_us,
            len: len as u8,
            payload,
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.payload[..self.len as usize]
    }
}

impl Default for RtPacket {
    fn default() -> Self {
        Self {
            device_id: 0,
            timestamp_us: 0,
            len: 0,
            payload: [0u8; MAX_PAYLOAD],
        }
    }
}

const CACHE_LINE: usize = 64;

struct Inner {
    head: AtomicUsize,
    _pad_head: [u8; CACHE_LINE - std::mem::size_of::<AtomicUsize>()],
    tail: AtomicUsize,
    _pad_tail: [u8; CACHE_LINE - std::mem::size_of::<AtomicUsize>()],
    slots: Box<[UnsafeCell<RtPacket>]>,
    capacity: usize,

    // `total_written` counts every successful slot write, including ones
    // that first evicted the oldest unread entry (those also bump
    // `total_dropped`). So after a burst that overflows the buffer,
    // `total_written` alone equals the number of `write()` calls, and
    // `total_written - total_read - total_dropped - occupancy == 0`
    // always holds. A write-only-when-not-evicting counter would instead
    // make `total_written + total_dropped` equal the call count, but
    // would no longer satisfy that conservation equation on its own.
    total_written: AtomicU64,
    total_read: AtomicU64,
    total_dropped: AtomicU64,
}

// SAFETY: SPSC contract — head is only written by the producer, tail
// only by the consumer. Atomics provide the necessary ordering.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

impl Inner {
    fn new(capacity: usize) -> Self {
        assert!(
            capacity > 0 && capacity.is_power_of_two(),
            "ring buffer capacity must be a power of two"
        );
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || UnsafeCell::new(RtPacket::default()));
        Self {
            head: AtomicUsize::new(0),
            _pad_head: [0u8; CACHE_LINE - std::mem::size_of::<AtomicUsize>()],
            tail: AtomicUsize::new(0),
            _pad_tail: [0u8; CACHE_LINE - std::mem::size_of::<AtomicUsize>()],
            slots: slots.into_boxed_slice(),
            capacity,
            total_written: AtomicU64::new(0),
            total_read: AtomicU64::new(0),
            total_dropped: AtomicU64::new(0),
        }
    }

    #[inline]
    fn occupancy(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        head.wrapping_sub(tail)
    }

    /// Write one packet. Never blocks, never fails: if the buffer is
    /// full the oldest unread entry is dropped to make room.
    ///
    /// SAFETY: producer-only.
    fn write(&self, pkt: RtPacket) {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);

        if head.wrapping_sub(tail) >= self.capacity {
            // Full: drop the oldest entry to make room.
            self.tail.store(tail.wrapping_add(1), Ordering::Release);
            self.total_dropped.fetch_add(1, Ordering::Relaxed);
        }

        let idx = head & (self.capacity - 1);
        // SAFETY: only the producer writes slot `head`; the consumer
        // never reads past `tail`, and `head >= tail` always holds here.
        unsafe {
            *self.slots[idx].get() = pkt;
        }
        self.head.store(head.wrapping_add(1), Ordering::Release);
        self.total_written.fetch_add(1, Ordering::Relaxed);
    }

    /// Drain up to `max_n` packets into `out`. Never blocks. Returns the
    /// number drained.
    ///
    /// SAFETY: consumer-only.
    fn read(&self, out: &mut Vec<RtPacket>, max_n: usize) -> usize {
        let mut n = 0;
        while n < max_n {
            let tail = self.tail.load(Ordering::Relaxed);
            let head = self.head.load(Ordering::Acquire);
            if tail == head {
                break;
            }
            let idx = tail & (self.capacity - 1);
            // SAFETY: only the consumer reads slot `tail`, and the
            // producer has moved past it (head != tail).
            let pkt = unsafe { *self.slots[idx].get() };
            self.tail.store(tail.wrapping_add(1), Ordering::Release);
            out.push(pkt);
            n += 1;
        }
        if n > 0 {
            self.total_read.fetch_add(n as u64, Ordering::Relaxed);
        }
        n
    }
}

/// Lock-free atomic counters and derived statistics for a ring buffer.
#[derive(Debug, Clone, Copy)]
pub struct RingBufferStats {
    pub total_written: u64,
    pub total_read: u64,
    pub total_dropped: u64,
    pub occupancy: usize,
    pub free_space: usize,
    pub drop_rate: f64,
}

/// Producer half. Exactly one owner — the caller of `send_midi`'s
/// real-time path, running on the Connection Worker task.
pub struct RtRingProducer {
    inner: Arc<Inner>,
    notify: Arc<tokio::sync::Notify>,
}

/// Consumer half. Exactly one owner — the RT Transport sender task.
pub struct RtRingConsumer {
    inner: Arc<Inner>,
    notify: Arc<tokio::sync::Notify>,
}

/// Create a producer/consumer pair backed by a buffer of `capacity`
/// slots (must be a power of two).
pub fn ring_buffer(capacity: usize) -> (RtRingProducer, RtRingConsumer) {
    let inner = Arc::new(Inner::new(capacity));
    let notify = Arc::new(tokio::sync::Notify::new());
    (
        RtRingProducer {
            inner: Arc::clone(&inner),
            notify: Arc::clone(&notify),
        },
        RtRingConsumer { inner, notify },
    )
}

impl RtRingProducer {
    /// Write a packet, dropping the oldest unread entry if full. Never
    /// blocks.
    pub fn write(&self, pkt: RtPacket) {
        self.inner.write(pkt);
        self.notify.notify_one();
    }

    pub fn stats(&self) -> RingBufferStats {
        stats_of(&self.inner)
    }
}

impl RtRingConsumer {
    /// Drain up to `max_n` packets without blocking.
    pub fn read(&self, out: &mut Vec<RtPacket>, max_n: usize) -> usize {
        self.inner.read(out, max_n)
    }

    /// Wait for at least one packet, then drain up to `max_n`.
    pub async fn read_async(&self, out: &mut Vec<RtPacket>, max_n: usize) -> usize {
        loop {
            let n = self.inner.read(out, max_n);
            if n > 0 {
                return n;
            }
            self.notify.notified().await;
        }
    }

    pub fn stats(&self) -> RingBufferStats {
        stats_of(&self.inner)
    }
}

fn stats_of(inner: &Inner) -> RingBufferStats {
    let total_written = inner.total_written.load(Ordering::Relaxed);
    let total_read = inner.total_read.load(Ordering::Relaxed);
    let total_dropped = inner.total_dropped.load(Ordering::Relaxed);
    let occupancy = inner.occupancy();
    let free_space = inner.capacity - occupancy;
    let drop_rate = if total_written > 0 {
        total_dropped as f64 / total_written as f64
    } else {
        0.0
    };
    RingBufferStats {
        total_written,
        total_read,
        total_dropped,
        occupancy,
        free_space,
        drop_rate,
    }
}
