//! trionic-can - ECU flashing and diagnostics over CAN
//!
//! This crate talks to an engine control unit over a CAN adapter: it opens a
//! KWP-style diagnostic session, unlocks it with a seed/key handshake, reads
//! live values, and reads or writes flash memory block by block with
//! checksums and bounded retries.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    FlashOrchestrator                        │
//! │  write_flash / read_flash / read_live_value                 │
//! │                                                             │
//! │  ┌───────────────────┐     ┌──────────────────────────────┐ │
//! │  │BlockTransferEngine│ ──> │SessionManager                │ │
//! │  │ (checksum, retry) │     │ (open, keepalive, security)  │ │
//! │  └─────────┬─────────┘     └──────────────┬───────────────┘ │
//! │            └──────────────┬───────────────┘                 │
//! │                     ┌─────┴──────┐                          │
//! │                     │ KwpService │                          │
//! │                     │ (requests) │                          │
//! │                     └─────┬──────┘                          │
//! │                     ┌─────┴──────┐                          │
//! │                     │  Channel   │  bus lock, frame codec   │
//! │                     └─────┬──────┘                          │
//! │                  ┌────────┴────────┐                        │
//! │                  │  CanTransport   │                        │
//! │                  │ (adapter/mock)  │                        │
//! │                  └─────────────────┘                        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Progress and status messages flow back up through an [`EventSink`].

pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod flash;
pub mod kwp;
pub mod session;
pub mod transfer;
pub mod transport;

pub use codec::{Frame, FrameKind, FramingError, Reassembler};
pub use config::{ConfigError, FlashConfig, SleepTime, VerifyMode};
pub use error::{ProtocolError, SecurityError, TimeoutError, TransferError};
pub use events::{
    Activity, ChannelSink, EventSink, FlashEvent, NullSink, Severity, WriteProgress,
};
pub use flash::{FlashOrchestrator, LiveChannel};
pub use kwp::{KwpService, NegativeResponseCode, ServiceIds};
pub use session::{
    JobGuard, KeyAlgorithm, SecurityAccess, SecurityLevel, Session, SessionManager, SessionState,
    XorKeyAlgorithm,
};
pub use transfer::{
    block_checksum, BlockTransferEngine, CancelToken, Direction, MemoryRegion, TransferJob,
};
pub use transport::{mock::SimulatedEcu, CanFrame, CanTransport, Channel, LinkError};
