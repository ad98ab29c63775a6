use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// Identifies a peer on the mesh.
///
/// Produced by the discovery collaborator and stored read-only by both
/// the facade and the worker — a `NodeInfo` is never mutated after
/// construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Stable 128-bit node identifier.
    pub id: u128,
    /// Human-readable display name.
    pub name: String,
    /// Hostname as advertised by discovery.
    pub hostname: String,
    pub address: IpAddr,
    /// HTTP control-plane port.
    pub control_port: u16,
    /// UDP data port negotiated at handshake (0 before handshake completes).
    pub udp_port: u16,
    pub protocol_version: String,
    /// Device count advertised before the handshake response is known.
    pub advertised_device_count: u32,
}

impl NodeInfo {
    /// A `NodeInfo` is valid iff its identifier is non-null and both
    /// ports are positive.
    pub fn is_valid(&self) -> bool {
        self.id != 0 && self.control_port > 0 && self.udp_port > 0
    }
}

/// Direction of a remote MIDI endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceDirection {
    Input,
    Output,
}

/// A remote MIDI endpoint advertised by a peer, received in the
/// handshake response and owned thereafter by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Unique within its owner node.
    pub id: u16,
    pub name: String,
    pub direction: DeviceDirection,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn node(id: u128, control_port: u16, udp_port: u16) -> NodeInfo {
        NodeInfo {
            id,
            name: "peer".into(),
            hostname: "peer.local".into(),
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            control_port,
            udp_port,
            protocol_version: "1".into(),
            advertised_device_count: 0,
        }
    }

    #[test]
    fn valid_requires_nonzero_id_and_ports() {
        assert!(node(1, 7070, 40001).is_valid());
        assert!(!node(0, 7070, 40001).is_valid());
        assert!(!node(1, 0, 40001).is_valid());
        assert!(!node(1, 7070, 0).is_valid());
    }
}
