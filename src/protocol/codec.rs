// src/protocol/codec.rs
//
// Frame codec for the reader's serial protocol.
//
// Wire layout:
//   0xA0 | length | reader id | command | data... | checksum
// where length = len(data) + 3 and the checksum is the two's complement of the
// 8-bit sum of every preceding byte.

use thiserror::Error;

use crate::checksums::{sum8_checksum, twos_complement_checksum};

// ============================================================================
// Constants
// ============================================================================

/// Start-of-frame marker.
pub const FRAME_HEADER: u8 = 0xA0;

/// Reader address that every reader answers to.
pub const BROADCAST_READER_ID: u8 = 0xFF;

/// Smallest complete frame: header, length, reader id, command, checksum.
pub const MIN_FRAME_LEN: usize = 5;

/// Largest data section the one-byte length field can describe.
pub const MAX_DATA_LEN: usize = 252;

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame too short: {len} bytes (need at least 5)")]
    TooShort { len: usize },

    #[error("invalid frame header 0x{0:02X}")]
    InvalidHeader(u8),

    #[error("checksum mismatch: expected 0x{expected:02X}, got 0x{actual:02X}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("payload of {0} bytes exceeds the 252 byte limit")]
    PayloadTooLong(usize),
}

/// A validated frame received from the reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub reader_id: u8,
    pub command: u8,
    pub payload: Vec<u8>,
}

// ============================================================================
// Encode / Decode
// ============================================================================

/// Build a complete frame for `command` addressed to `reader_id`.
pub fn encode_frame(reader_id: u8, command: u8, data: &[u8]) -> Result<Vec<u8>, FrameError> {
    if data.len() > MAX_DATA_LEN {
        return Err(FrameError::PayloadTooLong(data.len()));
    }

    let mut frame = Vec::with_capacity(data.len() + MIN_FRAME_LEN);
    frame.push(FRAME_HEADER);
    frame.push((data.len() + 3) as u8);
    frame.push(reader_id);
    frame.push(command);
    frame.extend_from_slice(data);
    frame.push(twos_complement_checksum(&frame));
    Ok(frame)
}

/// Parse and validate one complete frame.
///
/// The length byte is not cross-checked here; the reassembler has already used it
/// to cut the frame out of the stream.
pub fn decode_frame(bytes: &[u8]) -> Result<DecodedFrame, FrameError> {
    if bytes.len() < MIN_FRAME_LEN {
        return Err(FrameError::TooShort { len: bytes.len() });
    }
    if bytes[0] != FRAME_HEADER {
        return Err(FrameError::InvalidHeader(bytes[0]));
    }

    let (body, checksum) = bytes.split_at(bytes.len() - 1);
    let expected = twos_complement_checksum(body);
    if expected != checksum[0] {
        return Err(FrameError::ChecksumMismatch {
            expected,
            actual: checksum[0],
        });
    }

    Ok(DecodedFrame {
        reader_id: bytes[2],
        command: bytes[3],
        payload: body[4..].to_vec(),
    })
}

/// True when the byte sum of a complete frame is zero modulo 256.
pub fn frame_sums_to_zero(frame: &[u8]) -> bool {
    sum8_checksum(frame) == 0
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_set_power_frame() {
        let frame = encode_frame(0xFF, 0x76, &[25]).unwrap();
        assert_eq!(frame, vec![0xA0, 0x04, 0xFF, 0x76, 0x19, 0xCE]);
    }

    #[test]
    fn test_encode_empty_data() {
        let frame = encode_frame(0x01, 0x72, &[]).unwrap();
        assert_eq!(frame.len(), 5);
        assert_eq!(frame[1], 0x03);
        assert!(frame_sums_to_zero(&frame));
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        assert!(encode_frame(0xFF, 0x8A, &[0u8; 252]).is_ok());
        assert_eq!(
            encode_frame(0xFF, 0x8A, &[0u8; 253]),
            Err(FrameError::PayloadTooLong(253))
        );
    }

    #[test]
    fn test_decode_recovers_fields() {
        let ids = [0x00, 0x01, 0x7F, 0xFF];
        let commands = [0x00, 0x72, 0x8A, 0xFF];
        let lengths = [0usize, 1, 4, 10, 128, 252];

        for &id in &ids {
            for &cmd in &commands {
                for &len in &lengths {
                    let data: Vec<u8> = (0..len).map(|i| (i * 7 + cmd as usize) as u8).collect();
                    let frame = encode_frame(id, cmd, &data).unwrap();
                    let decoded = decode_frame(&frame).unwrap();
                    assert_eq!(decoded.reader_id, id);
                    assert_eq!(decoded.command, cmd);
                    assert_eq!(decoded.payload, data);
                }
            }
        }
    }

    #[test]
    fn test_decode_too_short() {
        assert_eq!(
            decode_frame(&[0xA0, 0x03, 0xFF, 0x72]),
            Err(FrameError::TooShort { len: 4 })
        );
        assert_eq!(decode_frame(&[]), Err(FrameError::TooShort { len: 0 }));
    }

    #[test]
    fn test_decode_invalid_header() {
        assert_eq!(
            decode_frame(&[0xA1, 0x03, 0xFF, 0x72, 0xEB]),
            Err(FrameError::InvalidHeader(0xA1))
        );
    }

    #[test]
    fn test_decode_checksum_mismatch() {
        let result = decode_frame(&[0xA0, 0x04, 0xFF, 0x76, 0x19, 0xCF]);
        assert_eq!(
            result,
            Err(FrameError::ChecksumMismatch {
                expected: 0xCE,
                actual: 0xCF
            })
        );
    }

    #[test]
    fn test_single_bit_flip_detected() {
        let frame = encode_frame(0xFF, 0x8A, &[0x00, 0x01, 0x01, 0x01, 0x02, 0x00]).unwrap();
        // Header bit flips surface as InvalidHeader instead
        for byte_index in 1..frame.len() {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[byte_index] ^= 1 << bit;
                assert!(
                    matches!(
                        decode_frame(&corrupted),
                        Err(FrameError::ChecksumMismatch { .. })
                    ),
                    "byte {} bit {}",
                    byte_index,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_encoded_frames_sum_to_zero() {
        for cmd in [0x60u8, 0x72, 0x76, 0x8A, 0x97] {
            let frame = encode_frame(0xFF, cmd, &[cmd, 0x10, 0xEE]).unwrap();
            assert!(frame_sums_to_zero(&frame));
        }
    }
}
