//! JSON DTOs for the control-plane handshake: `POST /network/handshake`.

use serde::{Deserialize, Serialize};

use crate::node::DeviceDirection;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub node_id: String,
    pub node_name: String,
    pub udp_endpoint: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeDevice {
    pub id: u16,
    pub name: String,
    #[serde(rename = "type")]
    pub direction: DeviceDirection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub udp_endpoint: String,
    pub devices: Vec<HandshakeDevice>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_through_json() {
        let req = HandshakeRequest {
            node_id: "abc".into(),
            node_name: "studio-a".into(),
            udp_endpoint: "127.0.0.1:40001".into(),
            version: "1".into(),
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: HandshakeRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back.node_id, "abc");
        assert_eq!(back.udp_endpoint, "127.0.0.1:40001");
    }

    #[test]
    fn response_parses_device_list() {
        let json = r#"{"udp_endpoint":"127.0.0.1:40001","devices":[{"id":7,"name":"Piano","type":"input"}]}"#;
        let resp: HandshakeResponse = serde_json::from_str(json).unwrap();
        assert_eq!(resp.udp_endpoint, "127.0.0.1:40001");
        assert_eq!(resp.devices.len(), 1);
        assert_eq!(resp.devices[0].id, 7);
    }
}
