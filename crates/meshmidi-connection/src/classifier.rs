//! Tags a MIDI message as real-time or non-real-time.
//!
//! Pure, no I/O, no allocation, no locks. Decision is a single branch on
//! the status byte, same table `midi-host`'s packet-boundary scanner
//! uses to find message lengths, reused here for a coarser RT/NRT split.

/// Outcome of classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageClass {
    RealTime,
    NonRealTime,
}

/// Classify a non-empty MIDI message by its leading status byte.
///
/// - SysEx (0xF0, 0xF7, or anything starting with 0xF0) → NonRealTime.
/// - Channel Voice (0x80-0xEF) and System Real-Time (0xF8-0xFF) → RealTime.
/// - System Common (0xF1-0xF6) → RealTime.
///
/// Returns `None` for an empty slice; callers must not classify empty
/// messages.
pub fn classify(bytes: &[u8]) -> Option<MessageClass> {
    let status = *bytes.first()?;

    if status == 0xF0 || status == 0xF7 {
        return Some(MessageClass::NonRealTime);
    }
    if status >= 0xF8 {
        return Some(MessageClass::RealTime);
    }
    if (0xF1..=0xF6).contains(&status) {
        return Some(MessageClass::RealTime);
    }
    if (0x80..=0xEF).contains(&status) {
        return Some(MessageClass::RealTime);
    }

    // Data byte with no leading status — not a valid message start;
    // still has to resolve to *something* total, so treat conservatively
    // as real-time rather than silently dropping classification.
    Some(MessageClass::RealTime)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysex_start_is_non_real_time() {
        assert_eq!(classify(&[0xF0, 0x43, 0x10, 0xF7]), Some(MessageClass::NonRealTime));
    }

    #[test]
    fn bare_sysex_end_is_non_real_time() {
        assert_eq!(classify(&[0xF7]), Some(MessageClass::NonRealTime));
    }

    #[test]
    fn channel_voice_is_real_time() {
        assert_eq!(classify(&[0x90, 0x40, 0x7f]), Some(MessageClass::RealTime)); // Note On
        assert_eq!(classify(&[0xB0, 0x07, 0x64]), Some(MessageClass::RealTime)); // CC
        assert_eq!(classify(&[0xEF, 0x00, 0x40]), Some(MessageClass::RealTime)); // top of channel-voice range
    }

    #[test]
    fn system_real_time_is_real_time() {
        assert_eq!(classify(&[0xF8]), Some(MessageClass::RealTime)); // clock
        assert_eq!(classify(&[0xFF]), Some(MessageClass::RealTime)); // reset
    }

    #[test]
    fn system_common_is_real_time() {
        assert_eq!(classify(&[0xF1, 0x00]), Some(MessageClass::RealTime));
        assert_eq!(classify(&[0xF6]), Some(MessageClass::RealTime));
    }

    #[test]
    fn empty_slice_has_no_class() {
        assert_eq!(classify(&[]), None);
    }

    #[test]
    fn classifier_is_total_over_all_status_bytes() {
        for status in 0u8..=255 {
            assert!(classify(&[status]).is_some());
        }
    }
}
