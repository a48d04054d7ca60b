// src/checksums.rs
//
// Checksum arithmetic for reader frames.
// Every frame ends with the two's complement of the 8-bit sum of the bytes before it,
// so the byte sum of a complete frame is always zero modulo 256.

// ============================================================================
// Named Checksum Functions
// ============================================================================

/// Simple modulo-256 sum of bytes (8-bit sum).
pub fn sum8_checksum(data: &[u8]) -> u8 {
    let mut sum: u8 = 0;
    for &byte in data {
        sum = sum.wrapping_add(byte);
    }
    sum
}

/// Two's complement of the 8-bit sum: `(~sum + 1) & 0xFF`.
pub fn twos_complement_checksum(data: &[u8]) -> u8 {
    (!sum8_checksum(data)).wrapping_add(1)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // Sum8 Checksum Tests
    // ========================================================================

    #[test]
    fn test_sum8_checksum_basic() {
        // 0x01 + 0x02 + 0x03 + 0x04 + 0x05 = 0x0F
        assert_eq!(sum8_checksum(&[0x01, 0x02, 0x03, 0x04, 0x05]), 0x0F);
    }

    #[test]
    fn test_sum8_checksum_overflow() {
        // 0xA0 + 0x04 + 0xFF + 0x76 + 0x19 = 0x232
        assert_eq!(sum8_checksum(&[0xA0, 0x04, 0xFF, 0x76, 0x19]), 0x32);
    }

    #[test]
    fn test_sum8_checksum_empty() {
        assert_eq!(sum8_checksum(&[]), 0);
    }

    // ========================================================================
    // Two's Complement Tests
    // ========================================================================

    #[test]
    fn test_twos_complement_set_power_frame() {
        assert_eq!(twos_complement_checksum(&[0xA0, 0x04, 0xFF, 0x76, 0x19]), 0xCE);
    }

    #[test]
    fn test_twos_complement_zero_sum() {
        assert_eq!(twos_complement_checksum(&[]), 0x00);
        assert_eq!(twos_complement_checksum(&[0x80, 0x80]), 0x00);
    }

    #[test]
    fn test_twos_complement_makes_total_zero() {
        let samples: [&[u8]; 4] = [
            &[0xA0, 0x03, 0xFF, 0x72],
            &[0xA0, 0x0D, 0x01, 0x8A, 0x00, 0x01, 0x01, 0x01, 0x02, 0x00, 0x03, 0x00, 0x00, 0x00],
            &[0x01],
            &[0xFF, 0xFF, 0xFF],
        ];
        for body in samples {
            let checksum = twos_complement_checksum(body);
            let total = sum8_checksum(body).wrapping_add(checksum);
            assert_eq!(total, 0, "body {:02X?}", body);
        }
    }
}
