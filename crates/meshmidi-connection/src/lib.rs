//! Stateful mesh-connection subsystem: classification, lock-free
//! real-time transport, reliable non-real-time transport, the
//! Connection Worker/Facade pair, the connection pool, the heartbeat
//! monitor, and the mesh coordinator built on top of them.

pub mod classifier;
pub mod command;
pub mod config;
pub mod error;
pub mod facade;
pub mod heartbeat;
pub mod mesh;
pub mod pool;
pub mod ringbuf;
pub mod transport;
pub mod worker;

pub use error::ConnectionError;
pub use facade::ConnectionFacade;
pub use mesh::{MeshEvent, MeshManager, MeshStatistics};
pub use pool::{ConnectionPool, PoolStats};
pub use worker::{ConnectionEvent, ConnectionState};
