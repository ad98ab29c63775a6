use serde::{Deserialize, Serialize};

fn default_ring_buffer_capacity() -> usize {
    2048
}
fn default_rt_batch_size() -> usize {
    16
}
fn default_nrt_fragment_size() -> usize {
    1024
}
fn default_nrt_ack_timeout_ms() -> u64 {
    1000
}
fn default_nrt_max_retries() -> u8 {
    3
}
fn default_heartbeat_timeout_ms() -> u64 {
    3000
}
fn default_heartbeat_interval_ms() -> u64 {
    1000
}
fn default_command_queue_poll_ms() -> u64 {
    100
}
fn default_query_timeout_ms() -> u64 {
    1000
}
fn default_shutdown_join_timeout_ms() -> u64 {
    2000
}
fn default_handshake_timeout_ms() -> u64 {
    5000
}

/// Tunables for the connection subsystem. Defaults match the values
/// fixed by the component contracts; override only for testing or for
/// deployments with unusual network conditions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    #[serde(default = "default_ring_buffer_capacity")]
    pub ring_buffer_capacity: usize,
    #[serde(default = "default_rt_batch_size")]
    pub rt_batch_size: usize,
    #[serde(default = "default_nrt_fragment_size")]
    pub nrt_fragment_size: usize,
    #[serde(default = "default_nrt_ack_timeout_ms")]
    pub nrt_ack_timeout_ms: u64,
    #[serde(default = "default_nrt_max_retries")]
    pub nrt_max_retries: u8,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_command_queue_poll_ms")]
    pub command_queue_poll_ms: u64,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    #[serde(default = "default_shutdown_join_timeout_ms")]
    pub shutdown_join_timeout_ms: u64,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ring_buffer_capacity: default_ring_buffer_capacity(),
            rt_batch_size: default_rt_batch_size(),
            nrt_fragment_size: default_nrt_fragment_size(),
            nrt_ack_timeout_ms: default_nrt_ack_timeout_ms(),
            nrt_max_retries: default_nrt_max_retries(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            command_queue_poll_ms: default_command_queue_poll_ms(),
            query_timeout_ms: default_query_timeout_ms(),
            shutdown_join_timeout_ms: default_shutdown_join_timeout_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
        }
    }
}

impl ConnectionConfig {
    pub fn from_toml_str(s: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(s)?)
    }
}
