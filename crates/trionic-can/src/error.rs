//! Error types for each protocol layer
//!
//! Link faults are fatal, timeouts may be retried by the transfer engine,
//! and everything above the request layer wraps what it could not handle.

use std::time::Duration;

use thiserror::Error;

use crate::codec::FramingError;
use crate::kwp::NegativeResponseCode;
use crate::session::{SecurityLevel, SessionState};
use crate::transfer::Direction;
use crate::transport::LinkError;

/// Nothing arrived within the allowed wait
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Timed out after {after:?} waiting for {operation}")]
pub struct TimeoutError {
    pub operation: String,
    pub after: Duration,
}

impl TimeoutError {
    pub fn new(operation: impl Into<String>, after: Duration) -> Self {
        Self {
            operation: operation.into(),
            after,
        }
    }
}

/// Errors from the request layer and session handling
#[derive(Debug, Error, Clone)]
pub enum ProtocolError {
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("Security access failed: {0}")]
    Security(#[from] SecurityError),

    #[error("Negative response: {nrc} (0x{nrc:02X}) for service 0x{service:02X}")]
    NegativeResponse {
        service: u8,
        nrc: NegativeResponseCode,
    },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl ProtocolError {
    /// Only a missing response is worth repeating a block for
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Faults that leave the bus connection unusable
    pub fn is_link_fault(&self) -> bool {
        matches!(self, Self::Link(_))
    }
}

/// Errors from the seed/key handshake
#[derive(Debug, Error, Clone)]
pub enum SecurityError {
    #[error("Seed rejected: {0}")]
    SeedRejected(String),

    #[error("Key rejected after {attempts} attempt(s)")]
    KeyRejected { attempts: u32 },

    #[error("Security level {granted} granted, {required} required")]
    InsufficientLevel {
        required: SecurityLevel,
        granted: SecurityLevel,
    },

    #[error("Link error: {0}")]
    Link(LinkError),

    #[error(transparent)]
    Timeout(TimeoutError),

    #[error("Framing error: {0}")]
    Framing(FramingError),

    #[error("Protocol error: {0}")]
    Protocol(Box<ProtocolError>),
}

impl From<ProtocolError> for SecurityError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Link(e) => Self::Link(e),
            ProtocolError::Timeout(e) => Self::Timeout(e),
            ProtocolError::Framing(e) => Self::Framing(e),
            ProtocolError::Security(e) => e,
            other => Self::Protocol(Box::new(other)),
        }
    }
}

/// Errors from block transfers and flash operations
#[derive(Debug, Error, Clone)]
pub enum TransferError {
    #[error(
        "{direction} block {index} at 0x{address:08X} failed after {attempts} attempt(s): {reason} \
         ({blocks_written} block(s) completed)"
    )]
    BlockFailed {
        direction: Direction,
        index: usize,
        address: u32,
        attempts: u32,
        blocks_written: usize,
        reason: String,
    },

    #[error("Write aborted after {blocks_written} block(s): {reason}")]
    AbortedMidWrite { blocks_written: usize, reason: String },

    #[error("Transfer cancelled after {blocks_completed} block(s)")]
    Cancelled { blocks_completed: usize },

    #[error("Checksum mismatch: expected 0x{expected:08X}, ECU reported 0x{actual:08X}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("Another transfer is in progress")]
    Busy,

    #[error("Session is not open (state: {0})")]
    SessionNotOpen(SessionState),

    #[error("Invalid region: {0}")]
    InvalidRegion(String),

    #[error(transparent)]
    Security(#[from] SecurityError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl TransferError {
    /// Whether flash contents may now be inconsistent and the whole image
    /// must be written again before the ECU is power-cycled
    pub fn requires_full_rewrite(&self) -> bool {
        match self {
            Self::AbortedMidWrite { .. } | Self::ChecksumMismatch { .. } => true,
            Self::BlockFailed { direction, .. } => *direction == Direction::Write,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_timeouts_are_retryable() {
        let timeout: ProtocolError = TimeoutError::new("response", Duration::from_millis(5)).into();
        assert!(timeout.is_retryable());

        let link: ProtocolError = LinkError::NotOpen.into();
        assert!(!link.is_retryable());
        assert!(link.is_link_fault());

        let nrc = ProtocolError::NegativeResponse {
            service: 0x36,
            nrc: NegativeResponseCode::TransferAborted,
        };
        assert!(!nrc.is_retryable());
    }

    #[test]
    fn test_security_error_keeps_link_faults() {
        let err = SecurityError::from(ProtocolError::Link(LinkError::NotOpen));
        assert!(matches!(err, SecurityError::Link(LinkError::NotOpen)));

        let err = SecurityError::from(ProtocolError::InvalidResponse("short".into()));
        match err {
            SecurityError::Protocol(inner) => {
                assert!(matches!(*inner, ProtocolError::InvalidResponse(_)))
            }
            other => panic!("expected Protocol, got {:?}", other),
        }
    }

    #[test]
    fn test_security_error_keeps_negative_response_code() {
        let err = SecurityError::from(ProtocolError::NegativeResponse {
            service: 0x27,
            nrc: NegativeResponseCode::RequestSequenceError,
        });

        match err {
            SecurityError::Protocol(inner) => assert!(matches!(
                *inner,
                ProtocolError::NegativeResponse {
                    service: 0x27,
                    nrc: NegativeResponseCode::RequestSequenceError,
                }
            )),
            other => panic!("expected Protocol, got {:?}", other),
        }
    }

    #[test]
    fn test_requires_full_rewrite() {
        let read_failure = TransferError::BlockFailed {
            direction: Direction::Read,
            index: 0,
            address: 0,
            attempts: 3,
            blocks_written: 0,
            reason: "timeout".into(),
        };
        assert!(!read_failure.requires_full_rewrite());

        let write_failure = TransferError::BlockFailed {
            direction: Direction::Write,
            index: 1,
            address: 0x8080,
            attempts: 3,
            blocks_written: 1,
            reason: "checksum".into(),
        };
        assert!(write_failure.requires_full_rewrite());
        assert!(!TransferError::Cancelled { blocks_completed: 1 }.requires_full_rewrite());
    }

    #[test]
    fn test_negative_response_message() {
        let err = ProtocolError::NegativeResponse {
            service: 0x27,
            nrc: NegativeResponseCode::InvalidKey,
        };
        assert_eq!(
            err.to_string(),
            "Negative response: InvalidKey (0x35) for service 0x27"
        );
    }
}
