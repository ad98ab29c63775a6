//! The typed commands the Connection Facade pushes and the Connection
//! Worker drains, plus the MPSC queue wrapper itself.
//!
//! Grounded on the channel-plus-oneshot request/reply shape already used
//! for the health/focus request handlers in this workspace, generalized
//! to a single tagged `Command` enum with query variants carrying their
//! own one-shot result slot.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use meshmidi_protocol::node::{DeviceInfo, NodeInfo};

use crate::worker::ConnectionState;

/// A query result slot: the worker fills it and fires the completion
/// signal exactly once.
pub type QueryReply<T> = oneshot::Sender<T>;

#[derive(Debug)]
pub enum Command {
    Connect,
    Disconnect,
    CheckHeartbeat,
    NotifyHeartbeat,
    SendHeartbeat,
    SendMidi { device_id: u16, bytes: Vec<u8> },
    GetState(QueryReply<ConnectionState>),
    GetRemoteNode(QueryReply<Option<NodeInfo>>),
    GetDevices(QueryReply<Vec<DeviceInfo>>),
    GetHeartbeat(QueryReply<Duration>),
    Shutdown,
}

/// Multi-producer/single-consumer FIFO delivering commands to the
/// worker. `push` never blocks and never fails under normal operation;
/// `wait_and_pop` is a bounded wait so the worker can periodically
/// observe a shutdown request even with no traffic.
#[derive(Clone)]
pub struct CommandQueueHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl CommandQueueHandle {
    pub fn push(&self, cmd: Command) {
        // An error here means the worker has already exited (its
        // receiver was dropped); this is never itself an error the
        // caller needs to react to beyond the command being a no-op.
        let _ = self.tx.send(cmd);
    }
}

pub struct CommandQueueReceiver {
    rx: mpsc::UnboundedReceiver<Command>,
}

impl CommandQueueReceiver {
    /// Wait up to `timeout` for the next command. Returns `None` on
    /// timeout so the worker can re-check its shutdown condition.
    pub async fn wait_and_pop(&mut self, timeout: Duration) -> Option<Command> {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .ok()
            .flatten()
    }
}

pub fn command_queue() -> (CommandQueueHandle, CommandQueueReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CommandQueueHandle { tx }, CommandQueueReceiver { rx })
}
