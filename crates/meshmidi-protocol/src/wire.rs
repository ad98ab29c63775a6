//! Binary wire layouts for the real-time UDP datagram and the reliable
//! TCP frame. All multi-byte fields are little-endian.

/// One real-time MIDI message, as sent in a single UDP datagram.
///
/// Layout (little-endian):
/// ```text
/// offset  size  field
/// 0       2     device id
/// 2       4     timestamp (us)
/// 6       1     payload length L (1..4)
/// 7       L     payload bytes
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtDatagram {
    pub device_id: u16,
    pub timestamp_us: u32,
    pub payload: Vec<u8>,
}

impl RtDatagram {
    pub const HEADER_SIZE: usize = 7;
    pub const MAX_PAYLOAD: usize = 4;

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        buf.clear();
        buf.extend_from_slice(&self.device_id.to_le_bytes());
        buf.extend_from_slice(&self.timestamp_us.to_le_bytes());
        buf.push(self.payload.len() as u8);
        buf.extend_from_slice(&self.payload);
    }

    pub fn deserialize(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::HEADER_SIZE {
            return None;
        }
        let device_id = u16::from_le_bytes(buf[0..2].try_into().ok()?);
        let timestamp_us = u32::from_le_bytes(buf[2..6].try_into().ok()?);
        let len = buf[6] as usize;
        if len == 0 || len > Self::MAX_PAYLOAD {
            return None;
        }
        if buf.len() < Self::HEADER_SIZE + len {
            return None;
        }
        let payload = buf[Self::HEADER_SIZE..Self::HEADER_SIZE + len].to_vec();
        Some(Self {
            device_id,
            timestamp_us,
            payload,
        })
    }
}

/// Kind tag for a reliable (NRT) frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data = 0,
    Ack = 1,
}

impl FrameKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(FrameKind::Data),
            1 => Some(FrameKind::Ack),
            _ => None,
        }
    }
}

/// Length-prefixed reliable frame header, as carried over the dedicated
/// NRT TCP connection (control port + 1).
///
/// Layout (little-endian):
/// ```text
/// size  field
/// 4     total length (header + body)
/// 4     sequence number
/// 2     device id
/// 2     fragment index
/// 2     fragment count
/// 1     kind (0=Data, 1=Ack)
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReliableFrame {
    pub sequence: u32,
    pub device_id: u16,
    pub fragment_index: u16,
    pub fragment_count: u16,
    pub kind: FrameKind,
    pub body: Vec<u8>,
}

impl ReliableFrame {
    pub const HEADER_SIZE: usize = 15;

    pub fn total_length(&self) -> u32 {
        (Self::HEADER_SIZE + self.body.len()) as u32
    }

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        buf.clear();
        buf.extend_from_slice(&self.total_length().to_le_bytes());
        buf.extend_from_slice(&self.sequence.to_le_bytes());
        buf.extend_from_slice(&self.device_id.to_le_bytes());
        buf.extend_from_slice(&self.fragment_index.to_le_bytes());
        buf.extend_from_slice(&self.fragment_count.to_le_bytes());
        buf.push(self.kind as u8);
        buf.extend_from_slice(&self.body);
    }

    /// Decode a complete frame from `buf`. `buf` must contain exactly
    /// one frame's worth of bytes (the caller is responsible for reading
    /// `total_length` bytes off the stream first).
    pub fn deserialize(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::HEADER_SIZE {
            return None;
        }
        let total_length = u32::from_le_bytes(buf[0..4].try_into().ok()?) as usize;
        if buf.len() < total_length {
            return None;
        }
        let sequence = u32::from_le_bytes(buf[4..8].try_into().ok()?);
        let device_id = u16::from_le_bytes(buf[8..10].try_into().ok()?);
        let fragment_index = u16::from_le_bytes(buf[10..12].try_into().ok()?);
        let fragment_count = u16::from_le_bytes(buf[12..14].try_into().ok()?);
        let kind = FrameKind::from_u8(buf[14])?;
        let body = buf[Self::HEADER_SIZE..total_length].to_vec();
        Some(Self {
            sequence,
            device_id,
            fragment_index,
            fragment_count,
            kind,
            body,
        })
    }
}
