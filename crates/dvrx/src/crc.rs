//! Cyclic redundancy checks for the DMR/P25/NXDN families
//!
//! All checks are non-reflected, MSB-first polynomial divisions with
//! zero initial remainder; protocol-specific XOR masks are applied by
//! the caller via [`CrcMask`]. Widths below 8 operate on explicit bit
//! counts since several protocols protect partial-byte fields.

/// DMR CCITT-16 masks, XORed onto the computed remainder per ETSI
/// TS 102 361-1 §B.3.11
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CrcMask {
    /// Data header
    DataHeader,
    /// Control signalling block
    Csbk,
    /// Multi-block control, last block
    Mbc,
    /// Unified data transport, last block
    Udt,
    /// No mask (raw remainder)
    None,
}

impl CrcMask {
    fn value(self) -> u16 {
        match self {
            CrcMask::DataHeader => 0xCCCC,
            CrcMask::Csbk => 0xA5A5,
            CrcMask::Mbc => 0xAAAA,
            CrcMask::Udt => 0x3333,
            CrcMask::None => 0x0000,
        }
    }
}

// Generic MSB-first division over a whole number of bytes.
fn crc_bytes(data: &[u8], poly: u32, width: u32) -> u32 {
    let top = 1u32 << (width - 1);
    let mask = if width == 32 {
        u32::MAX
    } else {
        (1u32 << width) - 1
    };
    let mut rem = 0u32;
    for &byte in data {
        for i in (0..8).rev() {
            let inbit = ((byte >> i) & 1) as u32;
            let msb = (rem & top) != 0;
            rem = (rem << 1) & mask;
            rem |= inbit;
            if msb {
                rem ^= poly & mask;
            }
        }
    }
    rem
}

// Same division over an explicit bit count (MSB-first within bytes).
fn crc_bits(data: &[u8], nbits: usize, poly: u32, width: u32) -> u32 {
    let top = 1u32 << (width - 1);
    let mask = if width == 32 {
        u32::MAX
    } else {
        (1u32 << width) - 1
    };
    let mut rem = 0u32;
    for n in 0..nbits {
        let inbit = ((data[n / 8] >> (7 - n % 8)) & 1) as u32;
        let msb = (rem & top) != 0;
        rem = (rem << 1) & mask;
        rem |= inbit;
        if msb {
            rem ^= poly & mask;
        }
    }
    rem
}

/// CCITT-16 (poly `0x1021`) with a DMR mask
///
/// The division covers `data` followed by 16 zero bits; appending the
/// unmasked result big-endian yields a zero remainder.
pub fn crc16(data: &[u8], mask: CrcMask) -> u16 {
    let mut rem = crc_bytes(data, 0x1021, 16) as u16;
    // flush 16 zero bits
    for _i in 0..16 {
        let msb = (rem & 0x8000) != 0;
        rem <<= 1;
        if msb {
            rem ^= 0x1021;
        }
    }
    rem ^ mask.value()
}

/// DMR multi-block CRC32 (poly `0x04C11DB7`, no reflection)
///
/// The caller is responsible for the 16-bit pair swap of the payload
/// (see [`crate::bits::swap_u16_pairs`]) before computing.
pub fn crc32(data: &[u8]) -> u32 {
    let mut rem = crc_bytes(data, 0x04C11DB7, 32);
    for _i in 0..32 {
        let msb = (rem & 0x8000_0000) != 0;
        rem <<= 1;
        if msb {
            rem ^= 0x04C11DB7;
        }
    }
    rem
}

/// DMR confirmed-data block CRC9 (poly `0x059`) over `nbits` bits
pub fn crc9(data: &[u8], nbits: usize) -> u16 {
    let mut rem = crc_bits(data, nbits, 0x059, 9) as u16;
    for _i in 0..9 {
        let msb = (rem & 0x100) != 0;
        rem = (rem << 1) & 0x1FF;
        if msb {
            rem ^= 0x059;
        }
    }
    // DMR inverts the confirmed-data CRC9
    (rem ^ 0x1FF) & 0x1FF
}

/// CRC8 (poly `0x07`) over `nbits` bits, used by slot-type and
/// embedded signalling fields
pub fn crc8(data: &[u8], nbits: usize) -> u8 {
    let mut rem = crc_bits(data, nbits, 0x07, 8) as u8;
    for _i in 0..8 {
        let msb = (rem & 0x80) != 0;
        rem <<= 1;
        if msb {
            rem ^= 0x07;
        }
    }
    rem
}

/// NXDN CRC12 (poly `0x80F`) over `nbits` bits
pub fn crc12(data: &[u8], nbits: usize) -> u16 {
    let mut rem = crc_bits(data, nbits, 0x80F, 12) as u16;
    for _i in 0..12 {
        let msb = (rem & 0x800) != 0;
        rem = (rem << 1) & 0xFFF;
        if msb {
            rem ^= 0x80F;
        }
    }
    rem
}

/// NXDN CRC6 (poly `0x27`) over `nbits` bits
pub fn crc6(data: &[u8], nbits: usize) -> u8 {
    let mut rem = crc_bits(data, nbits, 0x27, 6) as u8;
    for _i in 0..6 {
        let msb = (rem & 0x20) != 0;
        rem = (rem << 1) & 0x3F;
        if msb {
            rem ^= 0x27;
        }
    }
    rem
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_known_vector() {
        // XModem configuration: poly 0x1021, init 0, no reflection
        assert_eq!(crc16(b"123456789", CrcMask::None), 0x31C3);
    }

    #[test]
    fn test_crc16_mask_applied() {
        let raw = crc16(b"123456789", CrcMask::None);
        assert_eq!(crc16(b"123456789", CrcMask::DataHeader), raw ^ 0xCCCC);
        assert_eq!(crc16(b"123456789", CrcMask::Mbc), raw ^ 0xAAAA);
        assert_eq!(crc16(b"123456789", CrcMask::Udt), raw ^ 0x3333);
    }

    #[test]
    fn test_crc16_residue_zero() {
        // appending the unmasked CRC big-endian gives remainder zero
        let mut msg = b"confirmed data".to_vec();
        let c = crc16(&msg, CrcMask::None);
        msg.push((c >> 8) as u8);
        msg.push(c as u8);
        assert_eq!(crc16(&msg, CrcMask::None), 0);
    }

    #[test]
    fn test_crc32_residue_zero() {
        let mut msg = vec![0xDEu8, 0xAD, 0xBE, 0xEF, 0x00, 0x42];
        let c = crc32(&msg);
        msg.extend_from_slice(&c.to_be_bytes());
        assert_eq!(crc32(&msg), 0);
    }

    #[test]
    fn test_crc32_nonzero_on_corruption() {
        let mut msg = vec![0x01u8, 0x02, 0x03, 0x04];
        let c = crc32(&msg);
        msg.extend_from_slice(&c.to_be_bytes());
        msg[1] ^= 0x80;
        assert_ne!(crc32(&msg), 0);
    }

    #[test]
    fn test_crc9_detects_single_bit_flip() {
        let data = [0x5Au8, 0xA5, 0x3C, 0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0, 0x11];
        let good = crc9(&data, 96);
        let mut bad = data;
        bad[5] ^= 0x10;
        assert_ne!(crc9(&bad, 96), good);
        assert!(good <= 0x1FF);
    }

    #[test]
    fn test_small_widths_bounded() {
        let data = [0xFFu8; 8];
        assert!(crc12(&data, 52) <= 0xFFF);
        assert!(crc6(&data, 26) <= 0x3F);
        let _all = crc8(&data, 64);
    }
}
