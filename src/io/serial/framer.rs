// src/io/serial/framer.rs
//
// Reassembles reader frames from an arbitrary chunking of the serial byte stream.
// Resynchronises by dropping garbage up to the next 0xA0 header, then
// waits for `length + 2` bytes before cutting a frame.

use crate::protocol::codec::{decode_frame, DecodedFrame, FrameError, FRAME_HEADER, MIN_FRAME_LEN};

// ============================================================================
// Frame Reassembler
// ============================================================================

/// Stream reassembler for length-prefixed reader frames.
///
/// Holds no state besides the pending bytes, so splitting the same stream at
/// different chunk boundaries yields the same frames.
#[derive(Debug, Default)]
pub struct FrameReassembler {
    buffer: Vec<u8>,
    discarded: u64,
}

impl FrameReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and cut out every complete frame now available.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();

        while self.buffer.len() >= MIN_FRAME_LEN {
            if self.buffer[0] != FRAME_HEADER {
                // Same outcome as dropping one byte per pass: stop with fewer
                // than MIN_FRAME_LEN bytes left if no header turns up
                let skip = self
                    .buffer
                    .iter()
                    .position(|&b| b == FRAME_HEADER)
                    .unwrap_or(self.buffer.len())
                    .min(self.buffer.len() + 1 - MIN_FRAME_LEN);
                self.buffer.drain(..skip);
                self.discarded += skip as u64;
                continue;
            }

            let frame_len = self.buffer[1] as usize + 2;
            if self.buffer.len() < frame_len {
                break;
            }

            frames.push(self.buffer.drain(..frame_len).collect());
        }

        frames
    }

    /// Like `feed`, but also decodes each frame.
    pub fn feed_decoded(&mut self, data: &[u8]) -> Vec<Result<DecodedFrame, FrameError>> {
        self.feed(data).iter().map(|raw| decode_frame(raw)).collect()
    }

    /// Bytes waiting for the rest of their frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Garbage bytes dropped while resynchronising, since creation or the last clear.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Forget any partial frame (e.g. after reconnecting).
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.discarded = 0;
    }
}

// ============================================================================
// Tests
// ============================================================================
