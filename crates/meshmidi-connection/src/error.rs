use std::fmt;

/// State-affecting errors that cross the worker → facade → mesh-manager
/// callback boundary. Transport-internal transient failures (a dropped
/// ring-buffer write, a single UDP send failure) are counted, not
/// represented here — see each component's statistics instead.
#[derive(Debug, Clone)]
pub enum ConnectionError {
    InvalidConfig(String),
    HandshakeFailure(String),
    SocketBindFailure(String),
    HeartbeatTimeout,
    NonRealTimeFailure { sequence: u32 },
    NonRealTimeProtocol(String),
    QueryTimeout,
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionError::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            ConnectionError::HandshakeFailure(msg) => write!(f, "handshake failed: {msg}"),
            ConnectionError::SocketBindFailure(msg) => write!(f, "socket bind failed: {msg}"),
            ConnectionError::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            ConnectionError::NonRealTimeFailure { sequence } => {
                write!(f, "non-real-time message {sequence} failed after retries")
            }
            ConnectionError::NonRealTimeProtocol(msg) => {
                write!(f, "non-real-time protocol error: {msg}")
            }
            ConnectionError::QueryTimeout => write!(f, "query timed out"),
        }
    }
}

impl std::error::Error for ConnectionError {}
