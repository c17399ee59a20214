//! CAN transport trait and raw frame type

use std::time::Duration;

use async_trait::async_trait;

use super::LinkError;

/// Raw CAN frame as exchanged with the adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    /// 11-bit or 29-bit arbitration id
    pub id: u32,
    /// Data bytes (at most 8 for classic CAN)
    pub data: Vec<u8>,
}

impl CanFrame {
    pub fn new(id: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            data: data.into(),
        }
    }
}

/// Adapter-agnostic interface to a CAN interface
///
/// Implementations wrap a physical adapter driver (or a simulation). The
/// session owns its transport exclusively, so every method takes `&mut self`
/// except the state query.
#[async_trait]
pub trait CanTransport: Send {
    /// Open the adapter
    ///
    /// # Arguments
    /// * `comport` - Adapter port to use, `None` to auto-detect
    /// * `baud` - Bus bitrate, `None` for the adapter default
    async fn open(&mut self, comport: Option<&str>, baud: Option<u32>) -> Result<(), LinkError>;

    /// Put one frame on the bus
    async fn send(&mut self, frame: &CanFrame) -> Result<(), LinkError>;

    /// Wait up to `timeout` for the next frame
    ///
    /// Returns `Ok(None)` when nothing arrived in time. A zero timeout polls.
    async fn receive(&mut self, timeout: Duration) -> Result<Option<CanFrame>, LinkError>;

    /// Check if the adapter is open
    fn is_open(&self) -> bool;

    /// Release the adapter. Must be safe to call when already closed.
    async fn close(&mut self);
}
