//! Bit-level plumbing: MSB-first cursors and dibit packing
//!
//! Every protocol layer reads fields out of packed byte arrays with
//! MSB-first semantics. Rather than scatter shift ladders through the
//! parsers, all field extraction goes through [`BitCursor`] (bounded
//! reads) and [`BitWriter`] (bounded writes). The 16-bit pair swap
//! used when checking DMR multi-block CRC32 is a named operation here.

use thiserror::Error;

/// Bit access beyond the end of the buffer
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("bit read of {want} bits at {at} overruns {len}-bit buffer")]
pub struct BitOverrun {
    /// read position, bits
    pub at: usize,
    /// requested width, bits
    pub want: usize,
    /// buffer length, bits
    pub len: usize,
}

/// MSB-first bit reader over a byte slice
#[derive(Clone, Debug)]
pub struct BitCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitCursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bits remaining
    pub fn remaining(&self) -> usize {
        self.data.len() * 8 - self.pos
    }

    /// Current position, bits
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Skip forward
    pub fn skip(&mut self, nbits: usize) -> Result<(), BitOverrun> {
        self.check(nbits)?;
        self.pos += nbits;
        Ok(())
    }

    /// Read up to 32 bits, MSB first
    pub fn read(&mut self, nbits: usize) -> Result<u32, BitOverrun> {
        debug_assert!(nbits <= 32);
        self.check(nbits)?;
        let mut acc = 0u32;
        for _i in 0..nbits {
            let byte = self.data[self.pos / 8];
            let bit = (byte >> (7 - self.pos % 8)) & 1;
            acc = (acc << 1) | bit as u32;
            self.pos += 1;
        }
        Ok(acc)
    }

    /// Read up to 64 bits, MSB first
    pub fn read64(&mut self, nbits: usize) -> Result<u64, BitOverrun> {
        debug_assert!(nbits <= 64);
        if nbits <= 32 {
            return Ok(self.read(nbits)? as u64);
        }
        let hi = self.read(nbits - 32)? as u64;
        let lo = self.read(32)? as u64;
        Ok((hi << 32) | lo)
    }

    /// Read one bit as bool
    pub fn read_bit(&mut self) -> Result<bool, BitOverrun> {
        Ok(self.read(1)? != 0)
    }

    /// Read a whole byte
    pub fn read_u8(&mut self) -> Result<u8, BitOverrun> {
        Ok(self.read(8)? as u8)
    }

    /// Read a big-endian u16
    pub fn read_u16(&mut self) -> Result<u16, BitOverrun> {
        Ok(self.read(16)? as u16)
    }

    /// Read a big-endian u32
    pub fn read_u32(&mut self) -> Result<u32, BitOverrun> {
        self.read(32)
    }

    fn check(&self, nbits: usize) -> Result<(), BitOverrun> {
        let len = self.data.len() * 8;
        if self.pos + nbits > len {
            Err(BitOverrun {
                at: self.pos,
                want: nbits,
                len,
            })
        } else {
            Ok(())
        }
    }
}

/// MSB-first bit writer backed by a growable byte buffer
#[derive(Clone, Debug, Default)]
pub struct BitWriter {
    data: Vec<u8>,
    pos: usize,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append up to 32 bits, MSB first
    pub fn write(&mut self, value: u32, nbits: usize) {
        debug_assert!(nbits <= 32);
        for i in (0..nbits).rev() {
            if self.pos % 8 == 0 {
                self.data.push(0);
            }
            let bit = ((value >> i) & 1) as u8;
            let last = self.data.len() - 1;
            self.data[last] |= bit << (7 - self.pos % 8);
            self.pos += 1;
        }
    }

    /// Bits written so far
    pub fn len_bits(&self) -> usize {
        self.pos
    }

    /// Finish, returning the packed bytes (final partial byte
    /// zero-padded on the right)
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Swap each 16-bit pair in place: `b0 b1 b2 b3 -> b1 b0 b3 b2`
///
/// DMR multi-block data carries its CRC32 over the payload with this
/// byte order. A trailing odd byte is left untouched.
pub fn swap_u16_pairs(bytes: &mut [u8]) {
    for pair in bytes.chunks_exact_mut(2) {
        pair.swap(0, 1);
    }
}

/// Pack dibits (2 LSBs used) into bytes, MSB first, four per byte
pub fn dibits_to_bytes(dibits: &[u8]) -> Vec<u8> {
    dibits
        .chunks(4)
        .map(|ch| {
            ch.iter()
                .enumerate()
                .fold(0u8, |acc, (i, &d)| acc | ((d & 0x03) << (6 - 2 * i)))
        })
        .collect()
}

/// Unpack bytes to dibits, MSB first
pub fn bytes_to_dibits(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() * 4);
    for &b in bytes {
        out.push((b >> 6) & 0x03);
        out.push((b >> 4) & 0x03);
        out.push((b >> 2) & 0x03);
        out.push(b & 0x03);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_msb_first() {
        let data = [0b1010_1100, 0b0101_0011];
        let mut cur = BitCursor::new(&data);
        assert_eq!(cur.read(3).unwrap(), 0b101);
        assert_eq!(cur.read(5).unwrap(), 0b01100);
        assert_eq!(cur.read_u8().unwrap(), 0b0101_0011);
        assert_eq!(cur.remaining(), 0);
    }

    #[test]
    fn test_cursor_overrun() {
        let data = [0xFF];
        let mut cur = BitCursor::new(&data);
        cur.skip(4).unwrap();
        let err = cur.read(5).unwrap_err();
        assert_eq!(err.at, 4);
        assert_eq!(err.want, 5);
        assert_eq!(err.len, 8);
    }

    #[test]
    fn test_read64_split() {
        let data = [0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC];
        let mut cur = BitCursor::new(&data);
        assert_eq!(cur.read64(48).unwrap(), 0x123456789ABC);
    }

    #[test]
    fn test_writer_roundtrip() {
        let mut wr = BitWriter::new();
        wr.write(0b101, 3);
        wr.write(0x7F, 7);
        wr.write(0xABCD, 16);
        assert_eq!(wr.len_bits(), 26);
        let bytes = wr.into_bytes();

        let mut cur = BitCursor::new(&bytes);
        assert_eq!(cur.read(3).unwrap(), 0b101);
        assert_eq!(cur.read(7).unwrap(), 0x7F);
        assert_eq!(cur.read(16).unwrap(), 0xABCD);
    }

    #[test]
    fn test_swap_u16_pairs() {
        let mut data = [1u8, 2, 3, 4, 5];
        swap_u16_pairs(&mut data);
        assert_eq!(data, [2, 1, 4, 3, 5]);
    }

    #[test]
    fn test_dibit_packing() {
        let dibits = [0b01u8, 0b11, 0b00, 0b10, 0b01, 0b01];
        let bytes = dibits_to_bytes(&dibits);
        assert_eq!(bytes, vec![0b0111_0010, 0b0101_0000]);
        assert_eq!(&bytes_to_dibits(&bytes)[..6], &dibits);
    }
}
