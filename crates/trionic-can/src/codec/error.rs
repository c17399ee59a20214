//! Frame codec errors

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FramingError {
    #[error("Frame checksum mismatch: computed 0x{computed:02X}, frame carries 0x{carried:02X}")]
    ChecksumMismatch { computed: u8, carried: u8 },

    #[error("Sequence gap: expected consecutive frame {expected}, got {got}")]
    SequenceGap { expected: u8, got: u8 },

    #[error("Unexpected {kind} frame: {reason}")]
    UnexpectedFrame { kind: &'static str, reason: String },

    #[error("Invalid length {length} in {kind} frame")]
    InvalidLength { kind: &'static str, length: usize },

    #[error("Raw CAN frame must be {expected} bytes, got {actual}")]
    InvalidFrameLength { expected: usize, actual: usize },

    #[error("Unknown frame type nibble 0x{0:X}")]
    UnknownFrameType(u8),

    #[error("Payload of {0} bytes exceeds the 12-bit segmentation limit")]
    PayloadTooLarge(usize),

    #[error("Incomplete message: {received} of {expected} bytes received")]
    Incomplete { expected: usize, received: usize },

    #[error("{0} frame(s) left over after the message completed")]
    TrailingFrames(usize),
}
