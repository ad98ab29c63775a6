//! Wire-level and identity types shared by the mesh connection subsystem.
//!
//! This crate is deliberately I/O-free: everything here is a plain data
//! type plus byte-level encode/decode. Sockets, threads and retries live
//! in `meshmidi-connection`.

pub mod handshake;
pub mod message;
pub mod node;
pub mod wire;

/// Protocol version advertised during handshake.
pub const PROTOCOL_VERSION: &str = "1";

/// Default HTTP control port. The reliable NRT TCP channel runs on
/// `control_port + 1` per the handshake/wire layout.
pub const DEFAULT_CONTROL_PORT: u16 = 7070;
