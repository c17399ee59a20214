//! Frame codec: ISO-TP-like segmentation with per-frame checksums
//!
//! Payloads that fit into one frame travel as a single frame. Longer
//! payloads are split into a first frame announcing the total length and a
//! run of consecutive frames carrying a 4-bit sequence counter (1, 2, ...
//! 15, 0, 1, ...). Every frame ends with a CRC-8 over its other seven bytes.
//!
//! Decoding never repairs anything: a bad checksum, a skipped sequence
//! number or a short message is an error.

mod error;
mod frame;

pub use error::FramingError;
pub use frame::{
    frame_checksum, Frame, FrameKind, CAN_FRAME_LEN, CONSECUTIVE_FRAME_CAPACITY,
    FIRST_FRAME_CAPACITY, MAX_PAYLOAD_LEN, SINGLE_FRAME_CAPACITY,
};

/// Split a payload into frames
pub fn encode(payload: &[u8]) -> Result<Vec<Frame>, FramingError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FramingError::PayloadTooLarge(payload.len()));
    }

    if payload.len() <= SINGLE_FRAME_CAPACITY {
        return Ok(vec![Frame::single(payload)]);
    }

    let (head, rest) = payload.split_at(FIRST_FRAME_CAPACITY);
    let mut frames = Vec::with_capacity(1 + rest.len().div_ceil(CONSECUTIVE_FRAME_CAPACITY));
    frames.push(Frame::first(payload.len(), head));

    let mut sequence: u8 = 1;
    for chunk in rest.chunks(CONSECUTIVE_FRAME_CAPACITY) {
        frames.push(Frame::consecutive(sequence, chunk));
        sequence = (sequence + 1) & 0x0F;
    }

    Ok(frames)
}

/// Reassemble a complete frame sequence into its payload
pub fn decode(frames: &[Frame]) -> Result<Vec<u8>, FramingError> {
    let mut reassembler = Reassembler::new();

    for (index, frame) in frames.iter().enumerate() {
        if let Some(payload) = reassembler.push(frame)? {
            let remaining = frames.len() - index - 1;
            if remaining > 0 {
                return Err(FramingError::TrailingFrames(remaining));
            }
            return Ok(payload);
        }
    }

    Err(FramingError::Incomplete {
        expected: reassembler.expected_len().unwrap_or(0),
        received: reassembler.received(),
    })
}

/// Incremental decoder for frames arriving one at a time
#[derive(Debug, Default)]
pub struct Reassembler {
    expected_len: Option<usize>,
    buf: Vec<u8>,
    next_sequence: u8,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop any partially received message
    pub fn reset(&mut self) {
        self.expected_len = None;
        self.buf.clear();
        self.next_sequence = 0;
    }

    pub fn in_progress(&self) -> bool {
        self.expected_len.is_some()
    }

    pub fn expected_len(&self) -> Option<usize> {
        self.expected_len
    }

    pub fn received(&self) -> usize {
        self.buf.len()
    }

    /// Feed one frame. Returns the payload once the message is complete.
    ///
    /// Any error resets the reassembler; the partial message is discarded.
    pub fn push(&mut self, frame: &Frame) -> Result<Option<Vec<u8>>, FramingError> {
        let result = self.accept(frame);
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn accept(&mut self, frame: &Frame) -> Result<Option<Vec<u8>>, FramingError> {
        frame.verify()?;
        let kind = frame.kind()?;

        match kind {
            FrameKind::Single => {
                if self.in_progress() {
                    return Err(self.interrupted(kind));
                }
                let len = frame.single_len();
                if len > SINGLE_FRAME_CAPACITY {
                    return Err(FramingError::InvalidLength {
                        kind: kind.name(),
                        length: len,
                    });
                }
                Ok(Some(frame.payload().to_vec()))
            }
            FrameKind::First => {
                if self.in_progress() {
                    return Err(self.interrupted(kind));
                }
                let len = frame.announced_len();
                if len <= SINGLE_FRAME_CAPACITY {
                    return Err(FramingError::InvalidLength {
                        kind: kind.name(),
                        length: len,
                    });
                }
                self.expected_len = Some(len);
                self.buf.clear();
                self.buf.reserve(len);
                self.buf.extend_from_slice(frame.payload());
                self.next_sequence = 1;
                Ok(None)
            }
            FrameKind::Consecutive => {
                let Some(expected_len) = self.expected_len else {
                    return Err(FramingError::UnexpectedFrame {
                        kind: kind.name(),
                        reason: "no first frame received".to_string(),
                    });
                };

                let got = frame.sequence();
                if got != self.next_sequence {
                    return Err(FramingError::SequenceGap {
                        expected: self.next_sequence,
                        got,
                    });
                }

                let remaining = expected_len - self.buf.len();
                let take = remaining.min(CONSECUTIVE_FRAME_CAPACITY);
                self.buf.extend_from_slice(&frame.payload()[..take]);
                self.next_sequence = (self.next_sequence + 1) & 0x0F;

                if self.buf.len() == expected_len {
                    let payload = std::mem::take(&mut self.buf);
                    self.reset();
                    return Ok(Some(payload));
                }
                Ok(None)
            }
        }
    }

    fn interrupted(&self, kind: FrameKind) -> FramingError {
        FramingError::UnexpectedFrame {
            kind: kind.name(),
            reason: format!(
                "message of {} bytes still in progress ({} received)",
                self.expected_len.unwrap_or(0),
                self.buf.len()
            ),
        }
    }
}
