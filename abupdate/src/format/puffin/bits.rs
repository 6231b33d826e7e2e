// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Deflate packs bits starting from the least significant bit of each byte.

use std::io::{self, Write};

use super::{Error, Result};

pub struct BitReader<'a> {
    data: &'a [u8],
    /// Position in bits.
    pos: u64,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn bit_pos(&self) -> u64 {
        self.pos
    }

    pub fn bits_remaining(&self) -> u64 {
        self.data.len() as u64 * 8 - self.pos
    }

    pub fn skip(&mut self, n: u64) -> Result<()> {
        if self.bits_remaining() < n {
            return Err(Error::UnexpectedEnd);
        }

        self.pos += n;

        Ok(())
    }

    /// Read up to 24 bits. The first bit read is the least significant bit of
    /// the result.
    pub fn read_bits(&mut self, n: u32) -> Result<u32> {
        debug_assert!(n <= 24);

        if self.bits_remaining() < u64::from(n) {
            return Err(Error::UnexpectedEnd);
        }

        let mut value = 0u32;
        let mut filled = 0;

        while filled < n {
            let byte = u32::from(self.data[(self.pos / 8) as usize]);
            let offset = (self.pos % 8) as u32;
            let take = (8 - offset).min(n - filled);

            value |= ((byte >> offset) & ((1 << take) - 1)) << filled;
            filled += take;
            self.pos += u64::from(take);
        }

        Ok(value)
    }

    pub fn read_bit(&mut self) -> Result<u32> {
        self.read_bits(1)
    }

    /// Read the bits up to the next byte boundary.
    pub fn read_boundary_bits(&mut self) -> Result<u8> {
        let n = ((8 - self.pos % 8) % 8) as u32;

        self.read_bits(n).map(|v| v as u8)
    }

    /// Read whole bytes. The position must be byte aligned.
    pub fn read_aligned_bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos % 8 != 0 {
            return Err(Error::Unaligned);
        }

        let start = (self.pos / 8) as usize;
        let data = self
            .data
            .get(start..start + n)
            .ok_or(Error::UnexpectedEnd)?;
        self.pos += n as u64 * 8;

        Ok(data)
    }
}

/// Accumulates bits into bytes. Completed bytes stay buffered until they are
/// drained.
#[derive(Default)]
pub struct BitWriter {
    out: Vec<u8>,
    acc: u64,
    acc_bits: u32,
    /// Total number of bits written.
    pos: u64,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bit_pos(&self) -> u64 {
        self.pos
    }

    /// Write the low `n` bits of `value`, where `n` is at most 32.
    pub fn write_bits(&mut self, n: u32, value: u32) {
        debug_assert!(n <= 32);

        let value = u64::from(value) & ((1u64 << n) - 1);
        self.acc |= value << self.acc_bits;
        self.acc_bits += n;
        self.pos += u64::from(n);

        while self.acc_bits >= 8 {
            self.out.push(self.acc as u8);
            self.acc >>= 8;
            self.acc_bits -= 8;
        }
    }

    /// Pad to the next byte boundary with the bits of `value`.
    pub fn write_boundary_bits(&mut self, value: u8) {
        let n = (8 - self.acc_bits % 8) % 8;

        self.write_bits(n, value.into());
    }

    /// Write whole bytes. The position must be byte aligned.
    pub fn write_aligned_bytes(&mut self, data: &[u8]) -> Result<()> {
        if self.acc_bits != 0 {
            return Err(Error::Unaligned);
        }

        self.out.extend_from_slice(data);
        self.pos += data.len() as u64 * 8;

        Ok(())
    }

    /// Completed bytes that have not been drained yet.
    #[cfg(test)]
    pub fn bytes(&self) -> &[u8] {
        &self.out
    }

    /// Write all completed bytes to `writer`. Bits of an incomplete byte are
    /// kept.
    pub fn drain_to(&mut self, writer: &mut (impl Write + ?Sized)) -> io::Result<()> {
        writer.write_all(&self.out)?;
        self.out.clear();

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn lsb_first() {
        let mut writer = BitWriter::new();
        writer.write_bits(1, 1);
        writer.write_bits(2, 0b10);
        writer.write_boundary_bits(0b10101);
        writer.write_bits(12, 0xabc);
        assert_eq!(writer.bit_pos(), 20);
        writer.write_boundary_bits(0);
        writer.write_aligned_bytes(b"xy").unwrap();

        let data = writer.bytes().to_vec();
        assert_eq!(data, [0b1010_1101, 0xbc, 0x0a, b'x', b'y']);

        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read_bit().unwrap(), 1);
        assert_eq!(reader.read_bits(2).unwrap(), 0b10);
        assert_eq!(reader.read_boundary_bits().unwrap(), 0b10101);
        assert_eq!(reader.read_bits(12).unwrap(), 0xabc);
        assert_matches!(reader.read_aligned_bytes(2), Err(Error::Unaligned));
        reader.read_boundary_bits().unwrap();
        assert_eq!(reader.read_aligned_bytes(2).unwrap(), b"xy");
        assert_eq!(reader.bits_remaining(), 0);
        assert_matches!(reader.read_bit(), Err(Error::UnexpectedEnd));
    }

    #[test]
    fn drain_keeps_partial_byte() {
        let mut writer = BitWriter::new();
        writer.write_bits(11, 0x7ff);

        let mut out = vec![];
        writer.drain_to(&mut out).unwrap();
        assert_eq!(out, [0xff]);
        assert!(writer.bytes().is_empty());

        writer.write_bits(5, 0);
        writer.drain_to(&mut out).unwrap();
        assert_eq!(out, [0xff, 0x07]);
    }
}
