//! Block transfer of ECU memory
//!
//! A [`MemoryRegion`] is split into address-ordered blocks. Each block is
//! exchanged as one segmented message and checked against the CRC-32 the
//! ECU reports for it. A [`TransferJob`] carries the bookkeeping for one
//! read or write of a whole region.

mod engine;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crc::{Crc, CRC_32_ISO_HDLC};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use engine::BlockTransferEngine;

use crate::error::TransferError;
use crate::events::percentage;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-32 (ISO-HDLC) used for blocks and whole images
pub fn block_checksum(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// Transfer direction, also the access a region is meant for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Read,
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Read => f.write_str("read"),
            Direction::Write => f.write_str("write"),
        }
    }
}

/// Contiguous range of ECU memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRegion {
    pub start: u32,
    pub length: usize,
    pub access: Direction,
}

impl MemoryRegion {
    pub fn new(start: u32, length: usize, access: Direction) -> Self {
        Self {
            start,
            length,
            access,
        }
    }

    pub fn read(start: u32, length: usize) -> Self {
        Self::new(start, length, Direction::Read)
    }

    pub fn write(start: u32, length: usize) -> Self {
        Self::new(start, length, Direction::Write)
    }

    /// One past the last address
    pub fn end(&self) -> u64 {
        self.start as u64 + self.length as u64
    }

    /// Non-empty and inside the 32-bit address space
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.length == 0 {
            return Err(TransferError::InvalidRegion(format!(
                "empty region at 0x{:08X}",
                self.start
            )));
        }
        if self.end() > u32::MAX as u64 + 1 {
            return Err(TransferError::InvalidRegion(format!(
                "0x{:08X}+0x{:X} wraps the address space",
                self.start, self.length
            )));
        }
        Ok(())
    }

    pub fn block_count(&self, block_size: usize) -> usize {
        if block_size == 0 {
            return 0;
        }
        self.length.div_ceil(block_size)
    }

    /// Split into address-ordered blocks of at most `block_size` bytes
    pub fn blocks(&self, block_size: usize) -> Vec<MemoryRegion> {
        (0..self.block_count(block_size))
            .map(|index| {
                let offset = index * block_size;
                MemoryRegion {
                    start: self.start.wrapping_add(offset as u32),
                    length: block_size.min(self.length - offset),
                    access: self.access,
                }
            })
            .collect()
    }

    /// Byte range of `block` within this region
    pub fn offset_of(&self, block: &MemoryRegion) -> std::ops::Range<usize> {
        let offset = block.start.wrapping_sub(self.start) as usize;
        offset..offset + block.length
    }
}

/// Bookkeeping for one read or write of a region
#[derive(Debug, Clone, Serialize)]
pub struct TransferJob {
    pub id: Uuid,
    pub region: MemoryRegion,
    pub direction: Direction,
    pub total_bytes: usize,
    /// Bytes confirmed by the ECU; never decreases
    pub bytes_done: usize,
    /// Attempts spent on each block started so far
    pub block_attempts: Vec<u32>,
    pub blocks_completed: usize,
    pub started_at: DateTime<Utc>,
}

impl TransferJob {
    pub fn new(region: MemoryRegion, direction: Direction) -> Self {
        Self {
            id: Uuid::new_v4(),
            region,
            direction,
            total_bytes: region.length,
            bytes_done: 0,
            block_attempts: Vec::new(),
            blocks_completed: 0,
            started_at: Utc::now(),
        }
    }

    pub fn percentage(&self) -> u8 {
        percentage(self.bytes_done, self.total_bytes)
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_done >= self.total_bytes
    }

    /// Start a block, returning its index
    pub(crate) fn begin_block(&mut self) -> usize {
        self.block_attempts.push(0);
        self.block_attempts.len() - 1
    }

    pub(crate) fn record_attempt(&mut self, index: usize) -> u32 {
        let attempts = &mut self.block_attempts[index];
        *attempts += 1;
        *attempts
    }

    pub(crate) fn complete_block(&mut self, bytes: usize) {
        self.bytes_done = (self.bytes_done + bytes).min(self.total_bytes);
        self.blocks_completed += 1;
    }
}

/// Shared cancellation flag, checked between blocks
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_block_checksum_check_value() {
        assert_eq!(block_checksum(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn test_blocks_are_address_ordered() {
        let region = MemoryRegion::write(0x8000, 300);
        let blocks = region.blocks(128);

        assert_eq!(
            blocks,
            vec![
                MemoryRegion::write(0x8000, 128),
                MemoryRegion::write(0x8080, 128),
                MemoryRegion::write(0x8100, 44),
            ]
        );
        assert_eq!(region.offset_of(&blocks[2]), 256..300);
    }

    #[test]
    fn test_validate_rejects_wrap_and_empty() {
        assert!(MemoryRegion::read(0xFFFF_FF00, 0x100).validate().is_ok());
        assert!(matches!(
            MemoryRegion::read(0xFFFF_FF00, 0x101).validate(),
            Err(TransferError::InvalidRegion(_))
        ));
        assert!(matches!(
            MemoryRegion::read(0x1000, 0).validate(),
            Err(TransferError::InvalidRegion(_))
        ));
    }

    #[test]
    fn test_job_progress_is_capped() {
        let mut job = TransferJob::new(MemoryRegion::write(0, 200), Direction::Write);
        let index = job.begin_block();
        assert_eq!(job.record_attempt(index), 1);
        assert_eq!(job.record_attempt(index), 2);
        job.complete_block(128);
        assert_eq!(job.percentage(), 64);

        job.complete_block(128);
        assert_eq!(job.bytes_done, 200);
        assert!(job.is_complete());
        assert_eq!(job.block_attempts, vec![2]);
        assert_eq!(job.blocks_completed, 2);
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        token.reset();
        assert!(!clone.is_cancelled());
    }
}
