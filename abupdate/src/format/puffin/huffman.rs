// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use super::{
    Error, Result,
    bits::{BitReader, BitWriter},
};

const MAX_BITS: usize = 15;

pub const LENGTH_BASES: [u16; 29] = [
    3, 4, 5, 6, 7, 8, 9, 10, 11, 13, 15, 17, 19, 23, 27, 31, 35, 43, 51, 59, 67, 83, 99, 115, 131,
    163, 195, 227, 258,
];
pub const LENGTH_EXTRA_BITS: [u8; 29] = [
    0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4, 5, 5, 5, 5, 0,
];
pub const DISTANCE_BASES: [u16; 30] = [
    1, 2, 3, 4, 5, 7, 9, 13, 17, 25, 33, 49, 65, 97, 129, 193, 257, 385, 513, 769, 1025, 1537,
    2049, 3073, 4097, 6145, 8193, 12289, 16385, 24577,
];
pub const DISTANCE_EXTRA_BITS: [u8; 30] = [
    0, 0, 0, 0, 1, 1, 2, 2, 3, 3, 4, 4, 5, 5, 6, 6, 7, 7, 8, 8, 9, 9, 10, 10, 11, 11, 12, 12, 13,
    13,
];

/// Order in which the code length code lengths are stored.
const CODE_LENGTH_ORDER: [usize; 19] = [
    16, 17, 18, 0, 8, 7, 9, 6, 10, 5, 11, 4, 12, 3, 13, 2, 14, 1, 15,
];

const MAX_LIT_LEN_CODES: usize = 286;
const MAX_DISTANCE_CODES: usize = 30;
pub const END_OF_BLOCK: u16 = 256;

/// A canonical Huffman code.
#[derive(Debug)]
pub struct Huffman {
    /// Number of codes of each length.
    counts: [u16; MAX_BITS + 1],
    /// Symbols sorted by code.
    symbols: Vec<u16>,
    /// Per symbol, the code in the order it is written and its length. A
    /// length of 0 means that the symbol has no code.
    codes: Vec<(u16, u8)>,
}

impl Huffman {
    /// Build the code from per-symbol code lengths. Incomplete codes are
    /// allowed, but over-subscribed ones are not.
    pub fn new(lengths: &[u8]) -> Result<Self> {
        let mut counts = [0u16; MAX_BITS + 1];
        for &length in lengths {
            let length = usize::from(length);
            if length > MAX_BITS {
                return Err(Error::InvalidCodeLengths);
            }
            counts[length] += 1;
        }
        counts[0] = 0;

        let mut left = 1i32;
        for &count in &counts[1..] {
            left = (left << 1) - i32::from(count);
            if left < 0 {
                return Err(Error::InvalidCodeLengths);
            }
        }

        let mut offsets = [0usize; MAX_BITS + 2];
        for length in 1..=MAX_BITS {
            offsets[length + 1] = offsets[length] + usize::from(counts[length]);
        }

        let mut symbols = vec![0u16; offsets[MAX_BITS + 1]];
        for (symbol, &length) in lengths.iter().enumerate() {
            if length != 0 {
                let offset = &mut offsets[usize::from(length)];
                symbols[*offset] = symbol as u16;
                *offset += 1;
            }
        }

        let mut next_code = [0u32; MAX_BITS + 1];
        let mut code = 0u32;
        for length in 1..=MAX_BITS {
            code = (code + u32::from(counts[length - 1])) << 1;
            next_code[length] = code;
        }

        let codes = lengths
            .iter()
            .map(|&length| {
                if length == 0 {
                    return (0, 0);
                }

                let code = &mut next_code[usize::from(length)];
                let reversed = (*code as u16).reverse_bits() >> (16 - u32::from(length));
                *code += 1;

                (reversed, length)
            })
            .collect();

        Ok(Self {
            counts,
            symbols,
            codes,
        })
    }

    pub fn decode(&self, reader: &mut BitReader<'_>) -> Result<u16> {
        let mut code = 0i32;
        let mut first = 0i32;
        let mut index = 0i32;

        for &count in &self.counts[1..] {
            code |= reader.read_bit()? as i32;
            let count = i32::from(count);

            if code - count < first {
                return Ok(self.symbols[(index + (code - first)) as usize]);
            }

            index += count;
            first = (first + count) << 1;
            code <<= 1;
        }

        Err(Error::InvalidCode)
    }

    pub fn encode(&self, writer: &mut BitWriter, symbol: u16) -> Result<()> {
        match self.codes.get(usize::from(symbol)) {
            Some(&(code, length)) if length != 0 => {
                writer.write_bits(length.into(), code.into());
                Ok(())
            }
            _ => Err(Error::InvalidSymbol(symbol)),
        }
    }
}

/// Literal/length and distance codes of a block.
#[derive(Debug)]
pub struct Tables {
    pub lit_len: Huffman,
    pub distance: Huffman,
}

impl Tables {
    pub fn fixed() -> Result<Self> {
        let mut lit_len = [8u8; 288];
        lit_len[144..256].fill(9);
        lit_len[256..280].fill(7);

        Ok(Self {
            lit_len: Huffman::new(&lit_len)?,
            distance: Huffman::new(&[5; MAX_DISTANCE_CODES])?,
        })
    }

    fn from_lengths(lengths: &[u8], num_lit_len: usize) -> Result<Self> {
        let (lit_len, distance) = lengths.split_at(num_lit_len);

        if lit_len[usize::from(END_OF_BLOCK)] == 0 {
            return Err(Error::InvalidCodeLengths);
        }

        Ok(Self {
            lit_len: Huffman::new(lit_len)?,
            distance: Huffman::new(distance)?,
        })
    }

    /// Read a dynamic block's code definitions, appending their puff
    /// representation to `metadata`.
    ///
    /// ```text
    /// HLIT, HDIST, HCLEN    one byte each
    /// code length codes     3-bit lengths, two per byte, high nibble first
    /// code lengths          one byte each: 0-15 literal, 16-19 repeat the
    ///                       previous 3-6 times, 20-27 repeat zero 3-10 times,
    ///                       28-155 repeat zero 11-138 times
    /// ```
    pub fn read_dynamic(reader: &mut BitReader<'_>, metadata: &mut Vec<u8>) -> Result<Self> {
        let hlit = reader.read_bits(5)?;
        let hdist = reader.read_bits(5)?;
        let hclen = reader.read_bits(4)?;
        metadata.extend([hlit as u8, hdist as u8, hclen as u8]);

        let num_lit_len = hlit as usize + 257;
        let num_distance = hdist as usize + 1;
        let num_codes = hclen as usize + 4;
        if num_lit_len > MAX_LIT_LEN_CODES || num_distance > MAX_DISTANCE_CODES {
            return Err(Error::InvalidCodeLengths);
        }

        let mut code_lengths = [0u8; 19];
        let mut packed = Vec::with_capacity(num_codes);
        for &symbol in &CODE_LENGTH_ORDER[..num_codes] {
            let length = reader.read_bits(3)? as u8;
            code_lengths[symbol] = length;
            packed.push(length);
        }
        for pair in packed.chunks(2) {
            metadata.push((pair[0] << 4) | pair.get(1).copied().unwrap_or(0));
        }

        let code = Huffman::new(&code_lengths)?;
        let total = num_lit_len + num_distance;
        let mut lengths = Vec::with_capacity(total);

        while lengths.len() < total {
            let symbol = code.decode(reader)?;

            let (value, repeat, count) = match symbol {
                0..=15 => {
                    lengths.push(symbol as u8);
                    metadata.push(symbol as u8);
                    continue;
                }
                16 => {
                    let previous = *lengths.last().ok_or(Error::InvalidCodeLengths)?;
                    let extra = reader.read_bits(2)?;
                    (16 + extra, previous, 3 + extra)
                }
                17 => {
                    let extra = reader.read_bits(3)?;
                    (20 + extra, 0, 3 + extra)
                }
                18 => {
                    let extra = reader.read_bits(7)?;
                    (28 + extra, 0, 11 + extra)
                }
                _ => return Err(Error::InvalidCodeLengths),
            };

            metadata.push(value as u8);
            lengths.resize(lengths.len() + count as usize, repeat);
        }

        if lengths.len() != total {
            return Err(Error::InvalidCodeLengths);
        }

        Self::from_lengths(&lengths, num_lit_len)
    }

    /// Write the dynamic block code definitions described by `metadata`, the
    /// inverse of [`Self::read_dynamic()`].
    pub fn write_dynamic(metadata: &[u8], writer: &mut BitWriter) -> Result<Self> {
        let [hlit, hdist, hclen, rest @ ..] = metadata else {
            return Err(Error::InvalidPuff("Truncated dynamic block header"));
        };

        let num_lit_len = usize::from(*hlit) + 257;
        let num_distance = usize::from(*hdist) + 1;
        let num_codes = usize::from(*hclen) + 4;
        if num_lit_len > MAX_LIT_LEN_CODES || num_distance > MAX_DISTANCE_CODES || num_codes > 19 {
            return Err(Error::InvalidCodeLengths);
        }

        writer.write_bits(5, (*hlit).into());
        writer.write_bits(5, (*hdist).into());
        writer.write_bits(4, (*hclen).into());

        let Some((packed, encoded)) = rest.split_at_checked(num_codes.div_ceil(2)) else {
            return Err(Error::InvalidPuff("Truncated code length codes"));
        };

        let mut code_lengths = [0u8; 19];
        for (i, &symbol) in CODE_LENGTH_ORDER[..num_codes].iter().enumerate() {
            let byte = packed[i / 2];
            let length = if i % 2 == 0 { byte >> 4 } else { byte & 0xf };
            if length > 7 {
                return Err(Error::InvalidCodeLengths);
            }

            code_lengths[symbol] = length;
            writer.write_bits(3, length.into());
        }

        let code = Huffman::new(&code_lengths)?;
        let total = num_lit_len + num_distance;
        let mut lengths = Vec::with_capacity(total);

        for &value in encoded {
            if lengths.len() >= total {
                return Err(Error::InvalidPuff("Too many code lengths"));
            }

            let (symbol, extra_bits, extra, repeat, count) = match value {
                0..=15 => {
                    code.encode(writer, value.into())?;
                    lengths.push(value);
                    continue;
                }
                16..=19 => {
                    let previous = *lengths.last().ok_or(Error::InvalidCodeLengths)?;
                    (16, 2, value - 16, previous, 3 + value - 16)
                }
                20..=27 => (17, 3, value - 20, 0, 3 + value - 20),
                28..=155 => (18, 7, value - 28, 0, 11 + value - 28),
                _ => return Err(Error::InvalidPuff("Invalid code length value")),
            };

            code.encode(writer, symbol)?;
            writer.write_bits(extra_bits, extra.into());
            lengths.resize(lengths.len() + usize::from(count), repeat);
        }

        if lengths.len() != total {
            return Err(Error::InvalidCodeLengths);
        }

        Self::from_lengths(&lengths, num_lit_len)
    }
}

/// Length code index (symbol minus 257) for a match length of 3 to 258.
pub fn length_index(length: u16) -> usize {
    LENGTH_BASES.iter().rposition(|&b| b <= length).unwrap_or(0)
}

/// Distance code for a match distance of 1 to 32768.
pub fn distance_index(distance: u16) -> usize {
    DISTANCE_BASES
        .iter()
        .rposition(|&b| b <= distance)
        .unwrap_or(0)
}
