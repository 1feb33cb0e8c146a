/// Errors that can occur while encoding or decoding segments.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// The input is shorter than a complete segment header.
    #[error("truncated segment ({len} bytes, header needs {need})")]
    Truncated { len: usize, need: usize },

    /// The declared payload length disagrees with the bytes actually present.
    #[error("segment length mismatch (declared {declared} payload bytes, got {actual})")]
    LengthMismatch { declared: usize, actual: usize },

    /// The declared payload length exceeds the per-segment capacity.
    #[error("segment payload too large ({len} bytes, capacity {max})")]
    PayloadTooLarge { len: usize, max: usize },

    /// The segment carries an unsupported protocol version.
    #[error("unsupported protocol version {found} (expected {expected})")]
    BadVersion { found: u8, expected: u8 },

    /// The message type byte is not a known value.
    #[error("unknown message type 0x{0:02x}")]
    UnknownMessageType(u8),

    /// A logical message is too large to fragment (fragment numbers are 16-bit).
    #[error("message too large to fragment ({len} bytes, max {max})")]
    MessageTooLarge { len: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, WireError>;
