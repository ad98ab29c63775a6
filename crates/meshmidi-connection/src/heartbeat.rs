//! Heartbeat Monitor: a single periodic timer shared across the whole
//! mesh that drives heartbeat sends and timeout detection for every
//! pooled connection.
//!
//! Grounded on `midi-client::health`'s periodic-tick task shape
//! (`tokio::time::interval` driving a sweep over shared state each
//! tick), generalized from one health snapshot to one sweep per pooled
//! facade.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::pool::ConnectionPool;
use crate::worker::ConnectionState;

#[derive(Debug, Default)]
pub struct HeartbeatStats {
    pub heartbeats_sent: AtomicU64,
    pub timeouts_detected: AtomicU64,
}

/// Fired once per connection the moment its heartbeat age crosses the
/// 3000 ms threshold at a tick. The Mesh Manager forwards this to its
/// own `onConnectionLost` callback.
#[derive(Debug, Clone)]
pub struct ConnectionLost {
    pub node_id: u128,
    pub reason: String,
}

pub struct HeartbeatMonitor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    pub stats: Arc<HeartbeatStats>,
}

impl HeartbeatMonitor {
    /// Start the monitor ticking every `interval` against `pool`.
    /// `lost_tx` receives one `ConnectionLost` per connection whose
    /// heartbeat ages out on a given tick.
    pub fn start(
        pool: Arc<ConnectionPool>,
        interval: Duration,
        lost_tx: mpsc::UnboundedSender<ConnectionLost>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let stats = Arc::new(HeartbeatStats::default());

        let handle = {
            let cancel = cancel.clone();
            let stats = Arc::clone(&stats);
            tokio::spawn(run(pool, interval, lost_tx, stats, cancel))
        };

        Self {
            cancel,
            handle,
            stats,
        }
    }

    pub async fn shutdown(self, timeout: Duration) {
        self.cancel.cancel();
        if tokio::time::timeout(timeout, self.handle).await.is_err() {
            warn!("heartbeat monitor did not shut down within {:?}", timeout);
        }
    }
}

async fn run(
    pool: Arc<ConnectionPool>,
    interval: Duration,
    lost_tx: mpsc::UnboundedSender<ConnectionLost>,
    stats: Arc<HeartbeatStats>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let facades = pool.by_state(ConnectionState::Connected).await;
        for facade in facades {
            facade.send_heartbeat_wire();
            stats.heartbeats_sent.fetch_add(1, Ordering::Relaxed);

            if facade.get_time_since_last_heartbeat() > Duration::from_millis(3000) {
                facade.check_heartbeat();
                stats.timeouts_detected.fetch_add(1, Ordering::Relaxed);
                let _ = lost_tx.send(ConnectionLost {
                    node_id: facade.remote_node_info().id,
                    reason: "heartbeat timeout".to_string(),
                });
            }
        }

        // Sweep whatever has already turned Failed, including entries
        // this same tick's check_heartbeat() calls just transitioned.
        pool.remove_dead().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::facade::ConnectionFacade;
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
    async fn ticks_do_nothing_for_an_empty_pool() {
        let pool = ConnectionPool::new();
        let (lost_tx, mut lost_rx) = mpsc::unbounded_channel();
        let monitor = HeartbeatMonitor::start(Arc::clone(&pool), Duration::from_millis(10), lost_tx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(lost_rx.try_recv().is_err());
        assert_eq!(monitor.stats.heartbeats_sent.load(Ordering::Relaxed), 0);
        monitor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn disconnected_facade_is_skipped_and_not_counted() {
        let pool = ConnectionPool::new();
        let (facade, _events) =
            ConnectionFacade::new(node(1), node(2), ConnectionConfig::default(), None).unwrap();
        pool.add(2, facade).await;

        let (lost_tx, mut lost_rx) = mpsc::unbounded_channel();
        let monitor = HeartbeatMonitor::start(Arc::clone(&pool), Duration::from_millis(10), lost_tx);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(lost_rx.try_recv().is_err());
        assert_eq!(monitor.stats.heartbeats_sent.load(Ordering::Relaxed), 0);
        monitor.shutdown(Duration::from_secs(1)).await;
        pool.clear().await;
    }
}
