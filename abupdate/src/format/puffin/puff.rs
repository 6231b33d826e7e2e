// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Conversion of deflate blocks to the puff representation.
//!
//! ```text
//! block metadata  u16 BE (length - 1), then the metadata bytes. The first
//!                 byte is (final << 7) | (type << 5) | stored block padding.
//!                 Dynamic blocks append their code definitions.
//! literals        0x00-0x7e: (length - 1), then the bytes
//!                 0x7f, u16 BE (length - 128): longer runs
//! match           0x80-0xfe: 0x80 | (length - 3), then u16 BE (distance - 1)
//!                 0xff, (length - 130), u16 BE (distance - 1): length >= 130
//! end of block    0xff, 0x81
//! ```

use super::{
    Error, Result,
    bits::BitReader,
    huffman::{
        DISTANCE_BASES, DISTANCE_EXTRA_BITS, END_OF_BLOCK, LENGTH_BASES, LENGTH_EXTRA_BITS, Tables,
    },
};

const LITERALS_LONG: u8 = 0x7f;
const LEN_DIST: u8 = 0x80;
const LEN_DIST_LONG: u8 = 0xff;
const END_OF_BLOCK_VALUE: u8 = 129;

const MAX_LITERALS_LENGTH: usize = 65536;
const MAX_METADATA_LENGTH: usize = 400;

const STORED: u32 = 0;
const FIXED: u32 = 1;
const DYNAMIC: u32 = 2;

#[derive(Default)]
struct PuffWriter {
    out: Vec<u8>,
    literals: Vec<u8>,
}

impl PuffWriter {
    fn literal(&mut self, byte: u8) {
        self.literals.push(byte);

        if self.literals.len() == MAX_LITERALS_LENGTH {
            self.flush_literals();
        }
    }

    fn literals(&mut self, data: &[u8]) {
        for chunk in data.chunks(MAX_LITERALS_LENGTH) {
            self.literals.extend_from_slice(chunk);
            self.flush_literals();
        }
    }

    fn flush_literals(&mut self) {
        let length = self.literals.len();

        if length == 0 {
            return;
        } else if length < 128 {
            self.out.push((length - 1) as u8);
        } else {
            self.out.push(LITERALS_LONG);
            self.out
                .extend_from_slice(&((length - 128) as u16).to_be_bytes());
        }

        self.out.append(&mut self.literals);
    }

    fn len_dist(&mut self, length: u16, distance: u16) {
        self.flush_literals();

        if length < 130 {
            self.out.push(LEN_DIST | (length - 3) as u8);
        } else {
            self.out.push(LEN_DIST_LONG);
            self.out.push((length - 130) as u8);
        }
        self.out.extend_from_slice(&(distance - 1).to_be_bytes());
    }

    fn block_metadata(&mut self, metadata: &[u8]) {
        self.flush_literals();

        self.out
            .extend_from_slice(&((metadata.len() - 1) as u16).to_be_bytes());
        self.out.extend_from_slice(metadata);
    }

    fn end_of_block(&mut self) {
        self.flush_literals();

        self.out.extend_from_slice(&[LEN_DIST_LONG, END_OF_BLOCK_VALUE]);
    }

    fn finish(mut self) -> Vec<u8> {
        self.flush_literals();
        self.out
    }
}

/// Puff deflate blocks from `reader` until fewer than 8 bits remain.
pub fn puff_deflate(reader: &mut BitReader<'_>) -> Result<Vec<u8>> {
    let mut writer = PuffWriter::default();

    while reader.bits_remaining() >= 8 {
        let final_bit = reader.read_bits(1)?;
        let kind = reader.read_bits(2)?;
        let header = ((final_bit << 7) | (kind << 5)) as u8;

        let tables = match kind {
            STORED => {
                let padding = reader.read_boundary_bits()?;
                if padding > 0x1f {
                    return Err(Error::StoredPadding(padding));
                }

                let length = reader.read_bits(16)?;
                let inverse = reader.read_bits(16)?;
                if length ^ inverse != 0xffff {
                    return Err(Error::StoredLength { length, inverse });
                }

                writer.block_metadata(&[header | padding]);
                writer.literals(reader.read_aligned_bytes(length as usize)?);
                writer.end_of_block();
                continue;
            }
            FIXED => {
                writer.block_metadata(&[header]);
                Tables::fixed()?
            }
            DYNAMIC => {
                let mut metadata = vec![header];
                let tables = Tables::read_dynamic(reader, &mut metadata)?;
                if metadata.len() > MAX_METADATA_LENGTH {
                    return Err(Error::InvalidCodeLengths);
                }

                writer.block_metadata(&metadata);
                tables
            }
            _ => return Err(Error::InvalidBlockType(kind as u8)),
        };

        loop {
            let symbol = tables.lit_len.decode(reader)?;

            match symbol {
                0..=255 => writer.literal(symbol as u8),
                END_OF_BLOCK => {
                    writer.end_of_block();
                    break;
                }
                257..=285 => {
                    let index = usize::from(symbol - 257);
                    let extra = reader.read_bits(LENGTH_EXTRA_BITS[index].into())?;
                    let length = LENGTH_BASES[index] + extra as u16;

                    let symbol = tables.distance.decode(reader)?;
                    let index = usize::from(symbol);
                    if index >= DISTANCE_BASES.len() {
                        return Err(Error::InvalidSymbol(symbol));
                    }
                    let extra = reader.read_bits(DISTANCE_EXTRA_BITS[index].into())?;
                    let distance = DISTANCE_BASES[index] + extra as u16;

                    writer.len_dist(length, distance);
                }
                _ => return Err(Error::InvalidSymbol(symbol)),
            }
        }
    }

    Ok(writer.finish())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PuffData<'a> {
    BlockMetadata(&'a [u8]),
    Literals(&'a [u8]),
    LenDist { length: u16, distance: u16 },
    EndOfBlock,
}

/// Parses puff bytes back into their components.
pub struct PuffParser<'a> {
    data: &'a [u8],
    pos: usize,
    in_block: bool,
}

impl<'a> PuffParser<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            in_block: false,
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let data = self
            .data
            .get(self.pos..self.pos + n)
            .ok_or(Error::InvalidPuff("Truncated puff data"))?;
        self.pos += n;

        Ok(data)
    }

    fn take_u8(&mut self) -> Result<u8> {
        self.take(1).map(|b| b[0])
    }

    fn take_u16(&mut self) -> Result<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn next(&mut self) -> Result<Option<PuffData<'a>>> {
        if self.pos == self.data.len() {
            return Ok(None);
        }

        if !self.in_block {
            let length = usize::from(self.take_u16()?) + 1;
            if length > MAX_METADATA_LENGTH {
                return Err(Error::InvalidPuff("Block metadata is too long"));
            }

            self.in_block = true;
            return self.take(length).map(|m| Some(PuffData::BlockMetadata(m)));
        }

        let header = self.take_u8()?;

        if header & LEN_DIST == 0 {
            let length = if header < LITERALS_LONG {
                usize::from(header) + 1
            } else {
                usize::from(self.take_u16()?) + 128
            };

            return self.take(length).map(|l| Some(PuffData::Literals(l)));
        }

        let length = if header < LEN_DIST_LONG {
            u16::from(header & !LEN_DIST) + 3
        } else {
            u16::from(self.take_u8()?) + 130
        };

        match length {
            259 => {
                self.in_block = false;
                Ok(Some(PuffData::EndOfBlock))
            }
            3..=258 => {
                let distance = u32::from(self.take_u16()?) + 1;
                let distance = u16::try_from(distance)
                    .map_err(|_| Error::InvalidPuff("Match distance is too large"))?;

                Ok(Some(PuffData::LenDist { length, distance }))
            }
            _ => Err(Error::InvalidPuff("Invalid match length")),
        }
    }
}
