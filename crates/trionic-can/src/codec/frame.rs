//! Single CAN frame layout

use crc::{Crc, CRC_8_SAE_J1850};

use super::FramingError;

/// Raw CAN frame length (classic CAN, DLC 8)
pub const CAN_FRAME_LEN: usize = 8;
/// Payload bytes carried by a single frame
pub const SINGLE_FRAME_CAPACITY: usize = 6;
/// Payload bytes carried by a first frame
pub const FIRST_FRAME_CAPACITY: usize = 5;
/// Payload bytes carried by each consecutive frame
pub const CONSECUTIVE_FRAME_CAPACITY: usize = 6;
/// Largest payload expressible in the 12-bit first-frame length field
pub const MAX_PAYLOAD_LEN: usize = 0x0FFF;

const CHECKSUM_INDEX: usize = CAN_FRAME_LEN - 1;
const PADDING: u8 = 0x00;

const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_SAE_J1850);

/// Checksum over everything but the trailing checksum byte
pub fn frame_checksum(bytes: &[u8]) -> u8 {
    CRC8.checksum(bytes)
}

/// Frame type, encoded in the high nibble of byte 0
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Single,
    First,
    Consecutive,
}

impl FrameKind {
    pub fn from_pci(byte0: u8) -> Result<Self, FramingError> {
        match byte0 >> 4 {
            0x0 => Ok(FrameKind::Single),
            0x1 => Ok(FrameKind::First),
            0x2 => Ok(FrameKind::Consecutive),
            other => Err(FramingError::UnknownFrameType(other)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FrameKind::Single => "single",
            FrameKind::First => "first",
            FrameKind::Consecutive => "consecutive",
        }
    }
}

/// One protocol frame as it travels on the bus.
///
/// ```text
/// single       [0x0L][data x6            ][crc]
/// first        [0x1H][LL][data x5        ][crc]
/// consecutive  [0x2S][data x6            ][crc]
/// ```
///
/// The frame keeps its wire bytes; payload, sequence index and checksum are
/// views into them. Construction through [`Frame::from_bytes`] does not
/// validate the checksum so corrupted traffic reaches the decoder intact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    bytes: [u8; CAN_FRAME_LEN],
}

impl Frame {
    pub(crate) fn single(data: &[u8]) -> Self {
        debug_assert!(data.len() <= SINGLE_FRAME_CAPACITY);
        let mut bytes = [PADDING; CAN_FRAME_LEN];
        bytes[0] = data.len() as u8;
        bytes[1..1 + data.len()].copy_from_slice(data);
        Self::sealed(bytes)
    }

    pub(crate) fn first(total_len: usize, data: &[u8]) -> Self {
        debug_assert!(total_len <= MAX_PAYLOAD_LEN);
        debug_assert!(data.len() <= FIRST_FRAME_CAPACITY);
        let mut bytes = [PADDING; CAN_FRAME_LEN];
        bytes[0] = 0x10 | ((total_len >> 8) as u8 & 0x0F);
        bytes[1] = (total_len & 0xFF) as u8;
        bytes[2..2 + data.len()].copy_from_slice(data);
        Self::sealed(bytes)
    }

    pub(crate) fn consecutive(sequence: u8, data: &[u8]) -> Self {
        debug_assert!(data.len() <= CONSECUTIVE_FRAME_CAPACITY);
        let mut bytes = [PADDING; CAN_FRAME_LEN];
        bytes[0] = 0x20 | (sequence & 0x0F);
        bytes[1..1 + data.len()].copy_from_slice(data);
        Self::sealed(bytes)
    }

    fn sealed(mut bytes: [u8; CAN_FRAME_LEN]) -> Self {
        bytes[CHECKSUM_INDEX] = frame_checksum(&bytes[..CHECKSUM_INDEX]);
        Self { bytes }
    }

    /// Wrap raw bytes received from the bus
    pub fn from_bytes(raw: &[u8]) -> Result<Self, FramingError> {
        let bytes: [u8; CAN_FRAME_LEN] =
            raw.try_into()
                .map_err(|_| FramingError::InvalidFrameLength {
                    expected: CAN_FRAME_LEN,
                    actual: raw.len(),
                })?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; CAN_FRAME_LEN] {
        &self.bytes
    }

    pub fn checksum(&self) -> u8 {
        self.bytes[CHECKSUM_INDEX]
    }

    /// Recompute the checksum and compare it with the carried one
    pub fn verify(&self) -> Result<(), FramingError> {
        let computed = frame_checksum(&self.bytes[..CHECKSUM_INDEX]);
        if computed != self.checksum() {
            return Err(FramingError::ChecksumMismatch {
                computed,
                carried: self.checksum(),
            });
        }
        Ok(())
    }

    pub fn kind(&self) -> Result<FrameKind, FramingError> {
        FrameKind::from_pci(self.bytes[0])
    }

    /// Running sequence index: 0 for single/first frames, the 4-bit
    /// counter for consecutive frames.
    pub fn sequence(&self) -> u8 {
        match self.kind() {
            Ok(FrameKind::Consecutive) => self.bytes[0] & 0x0F,
            _ => 0,
        }
    }

    /// Data area of the frame, including any trailing padding
    pub fn payload(&self) -> &[u8] {
        match self.kind() {
            Ok(FrameKind::Single) => {
                let len = (self.bytes[0] & 0x0F) as usize;
                &self.bytes[1..1 + len.min(SINGLE_FRAME_CAPACITY)]
            }
            Ok(FrameKind::First) => &self.bytes[2..CHECKSUM_INDEX],
            Ok(FrameKind::Consecutive) => &self.bytes[1..CHECKSUM_INDEX],
            Err(_) => &[],
        }
    }

    /// Total message length announced by a first frame
    pub(crate) fn announced_len(&self) -> usize {
        (((self.bytes[0] & 0x0F) as usize) << 8) | self.bytes[1] as usize
    }

    /// Length nibble of a single frame
    pub(crate) fn single_len(&self) -> usize {
        (self.bytes[0] & 0x0F) as usize
    }
}
