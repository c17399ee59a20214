//! Exclusive message channel over a CAN transport
//!
//! The channel owns the transport behind an async mutex. A request and its
//! response are exchanged while holding the lock, so the keep-alive task and
//! block transfers never interleave frames on the bus.

use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tracing::{debug, trace};

use super::{CanFrame, CanTransport, LinkError};
use crate::codec::{self, Frame, Reassembler};
use crate::config::FlashConfig;
use crate::error::{ProtocolError, TimeoutError};

const FRAME_LOG_TARGET: &str = "trionic_can::frames";

/// Tester/ECU CAN ids
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Addressing {
    /// Tester -> ECU
    pub tx_id: u32,
    /// ECU -> tester
    pub rx_id: u32,
}

pub struct Channel {
    transport: Mutex<Box<dyn CanTransport>>,
    addressing: Addressing,
    inter_frame_delay: Duration,
    log_frames: bool,
}

impl Channel {
    pub fn new(transport: Box<dyn CanTransport>, config: &FlashConfig) -> Self {
        Self {
            transport: Mutex::new(transport),
            addressing: Addressing {
                tx_id: config.addressing.tx_id,
                rx_id: config.addressing.rx_id,
            },
            inter_frame_delay: config.sleep_time.as_duration(),
            log_frames: config.enable_raw_frame_logging,
        }
    }

    pub fn addressing(&self) -> Addressing {
        self.addressing
    }

    pub fn inter_frame_delay(&self) -> Duration {
        self.inter_frame_delay
    }

    pub async fn open(&self, comport: Option<&str>, baud: Option<u32>) -> Result<(), LinkError> {
        let mut transport = self.transport.lock().await;
        transport.open(comport, baud).await
    }

    /// Close the transport; safe to call repeatedly
    pub async fn close(&self) {
        let mut transport = self.transport.lock().await;
        transport.close().await;
    }

    pub async fn is_open(&self) -> bool {
        self.transport.lock().await.is_open()
    }

    /// Take the bus for one exchange
    pub async fn lock(&self) -> ChannelGuard<'_> {
        ChannelGuard {
            transport: self.transport.lock().await,
            channel: self,
        }
    }

    /// Send a request and wait for one complete response message
    pub async fn request(&self, payload: &[u8], timeout: Duration) -> Result<Vec<u8>, ProtocolError> {
        let mut guard = self.lock().await;
        guard.send_message(payload).await?;
        guard.receive_message(timeout).await
    }
}

/// Holds the bus for the duration of an exchange
pub struct ChannelGuard<'a> {
    transport: MutexGuard<'a, Box<dyn CanTransport>>,
    channel: &'a Channel,
}

impl ChannelGuard<'_> {
    /// Segment and send one message, discarding stale frames first
    pub async fn send_message(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        if !self.transport.is_open() {
            return Err(LinkError::NotOpen.into());
        }

        self.drain().await?;

        let frames = codec::encode(payload)?;
        let tx_id = self.channel.addressing.tx_id;
        for (index, frame) in frames.iter().enumerate() {
            if index > 0 && !self.channel.inter_frame_delay.is_zero() {
                tokio::time::sleep(self.channel.inter_frame_delay).await;
            }
            let raw = CanFrame::new(tx_id, frame.as_bytes().to_vec());
            self.log_frame("tx", &raw);
            self.transport.send(&raw).await?;
        }
        Ok(())
    }

    /// Wait for one complete message from the ECU
    ///
    /// `timeout` bounds the wait for each individual frame; frames from other
    /// ids do not extend it.
    pub async fn receive_message(&mut self, timeout: Duration) -> Result<Vec<u8>, ProtocolError> {
        let rx_id = self.channel.addressing.rx_id;
        let mut reassembler = Reassembler::new();
        let mut deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(self.timed_out(&reassembler, timeout));
            }

            let Some(raw) = self.transport.receive(remaining).await? else {
                return Err(self.timed_out(&reassembler, timeout));
            };
            self.log_frame("rx", &raw);

            if raw.id != rx_id {
                continue;
            }

            let frame = Frame::from_bytes(&raw.data)?;
            if let Some(message) = reassembler.push(&frame)? {
                return Ok(message);
            }
            deadline = Instant::now() + timeout;
        }
    }

    async fn drain(&mut self) -> Result<(), LinkError> {
        let mut dropped = 0usize;
        while let Some(raw) = self.transport.receive(Duration::ZERO).await? {
            self.log_frame("stale", &raw);
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "Discarded stale frames before request");
        }
        Ok(())
    }

    fn timed_out(&self, reassembler: &Reassembler, timeout: Duration) -> ProtocolError {
        let operation = if reassembler.in_progress() {
            format!(
                "consecutive frame ({} of {} bytes received)",
                reassembler.received(),
                reassembler.expected_len().unwrap_or(0)
            )
        } else {
            "response".to_string()
        };
        TimeoutError::new(operation, timeout).into()
    }

    fn log_frame(&self, direction: &str, frame: &CanFrame) {
        if self.channel.log_frames {
            trace!(
                target: FRAME_LOG_TARGET,
                direction,
                id = format!("0x{:03X}", frame.id),
                data = %hex::encode(&frame.data),
            );
        }
    }
}
