/// A single MIDI message as it crosses the wire: which remote device it
/// targets, its raw bytes, and the sender clock's timestamp in
/// microseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MidiMessage {
    pub device_id: u16,
    pub bytes: Vec<u8>,
    pub timestamp_us: u32,
}
