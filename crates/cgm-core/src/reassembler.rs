//! Reassembly of notification chunks into fixed-size telemetry frames.
//!
//! The sensor delivers each encrypted frame over several notifications. The
//! reassembler buffers chunks until exactly one frame is available; it never
//! hands out a partial frame.

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

/// Size of one encrypted telemetry frame.
pub const FRAME_SIZE: usize = 46;

/// Outcome of [`FrameReassembler::append`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyResult {
    /// More chunks are needed.
    Incomplete,
    /// A full frame is available.
    Complete(Bytes),
    /// The chunk would grow the buffer past twice the frame size; the
    /// stream is out of sync.
    Overflow,
}

/// Accumulates chunks into one frame of a known size.
///
/// Call [`reset`](Self::reset) after every `Complete` or `Overflow` result
/// and whenever the link drops.
#[derive(Debug)]
pub struct FrameReassembler {
    buffer: BytesMut,
    expected_size: usize,
}

impl FrameReassembler {
    /// Create a reassembler for frames of `expected_size` bytes.
    pub fn new(expected_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(expected_size * 2),
            expected_size,
        }
    }

    /// Add a chunk.
    ///
    /// Bytes beyond the first complete frame stay buffered until the next
    /// reset.
    pub fn append(&mut self, chunk: &[u8]) -> ReassemblyResult {
        if self.buffer.len() + chunk.len() > self.expected_size * 2 {
            warn!(
                buffered = self.buffer.len(),
                chunk = chunk.len(),
                expected = self.expected_size,
                "Frame buffer overflow"
            );
            return ReassemblyResult::Overflow;
        }

        self.buffer.extend_from_slice(chunk);

        if self.buffer.len() >= self.expected_size {
            if self.buffer.len() > self.expected_size {
                debug!(
                    extra = self.buffer.len() - self.expected_size,
                    "Discarding bytes after complete frame"
                );
            }
            let frame = self.buffer.split_to(self.expected_size).freeze();
            ReassemblyResult::Complete(frame)
        } else {
            ReassemblyResult::Incomplete
        }
    }

    /// Discard all buffered bytes.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn expected_size(&self) -> usize {
        self.expected_size
    }
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::new(FRAME_SIZE)
    }
}
