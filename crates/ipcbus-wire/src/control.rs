//! Protocol control codes.
//!
//! Carried in the `ctlCode` header field of segments with message type
//! [`MsgType::Control`](crate::MsgType::Control). Codes 0x0b-0xfe are
//! reserved for future protocol revisions; receivers ignore codes they do
//! not implement.

/// No operation; used for liveness probes.
pub const CTL_NOP: u8 = 0x00;

/// Ask the receiving node to begin an orderly exit.
pub const CTL_SHUTDOWN: u8 = 0x01;

/// Cancel an in-flight operation (reserved).
pub const CTL_CANCEL: u8 = 0x02;

/// Reset protocol state (reserved).
pub const CTL_RESET: u8 = 0x03;

/// Suspend message processing (reserved).
pub const CTL_SUSPEND: u8 = 0x04;

/// Resume message processing (reserved).
pub const CTL_RESUME: u8 = 0x05;

/// Enable diagnostic tracing (reserved).
pub const CTL_TRACE_ON: u8 = 0x06;

/// Disable diagnostic tracing (reserved).
pub const CTL_TRACE_OFF: u8 = 0x07;

/// Invoke the receiving node's watchdog callback.
pub const CTL_WATCHDOG: u8 = 0x08;

/// Flush the receiving node's address cache.
pub const CTL_FLUSH_CACHE: u8 = 0x09;

/// Release the receiving node's startup barrier.
pub const CTL_START_SYNC: u8 = 0x0a;

/// Application-extended control message.
pub const CTL_EXTENDED: u8 = 0xff;

/// Returns a human-readable name for a control code.
pub fn control_name(code: u8) -> &'static str {
    match code {
        CTL_NOP => "NOP",
        CTL_SHUTDOWN => "SHUTDOWN",
        CTL_CANCEL => "CANCEL",
        CTL_RESET => "RESET",
        CTL_SUSPEND => "SUSPEND",
        CTL_RESUME => "RESUME",
        CTL_TRACE_ON => "TRACE-ON",
        CTL_TRACE_OFF => "TRACE-OFF",
        CTL_WATCHDOG => "WATCHDOG",
        CTL_FLUSH_CACHE => "FLUSH-CACHE",
        CTL_START_SYNC => "START-SYNC",
        CTL_EXTENDED => "EXTENDED",
        _ => "RESERVED",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_have_names() {
        assert_eq!(control_name(CTL_NOP), "NOP");
        assert_eq!(control_name(CTL_SHUTDOWN), "SHUTDOWN");
        assert_eq!(control_name(CTL_START_SYNC), "START-SYNC");
        assert_eq!(control_name(CTL_EXTENDED), "EXTENDED");
    }

    #[test]
    fn unknown_codes_are_reserved() {
        assert_eq!(control_name(0x0b), "RESERVED");
        assert_eq!(control_name(0x80), "RESERVED");
    }
}
