//! Transport layer errors

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("No CAN adapter found")]
    NoAdapter,

    #[error("Transport is not open")]
    NotOpen,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("Bus error: {0}")]
    BusError(String),

    #[error("Transport not supported: {0}")]
    Unsupported(String),
}
