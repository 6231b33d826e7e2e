// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use super::{
    Error, Result,
    bits::BitWriter,
    huffman::{
        DISTANCE_BASES, DISTANCE_EXTRA_BITS, END_OF_BLOCK, LENGTH_BASES, LENGTH_EXTRA_BITS, Tables,
        distance_index, length_index,
    },
    puff::{PuffData, PuffParser},
};

/// Convert puff data back into deflate blocks. The writer's bit position must
/// match the position of the original deflate stream because stored blocks
/// pad to byte boundaries.
pub fn huff_deflate(puff: &[u8], writer: &mut BitWriter) -> Result<()> {
    let mut parser = PuffParser::new(puff);

    while let Some(data) = parser.next()? {
        let PuffData::BlockMetadata(metadata) = data else {
            return Err(Error::InvalidPuff("Expected block metadata"));
        };
        let header = metadata[0];
        let kind = (header >> 5) & 0b11;

        writer.write_bits(1, (header >> 7).into());
        writer.write_bits(2, kind.into());

        let tables = match kind {
            0 => {
                if metadata.len() != 1 {
                    return Err(Error::InvalidPuff("Stored block has extra metadata"));
                }
                writer.write_boundary_bits(header & 0x1f);

                let literals: &[u8] = match parser.next()? {
                    Some(PuffData::Literals(l)) => {
                        if parser.next()? != Some(PuffData::EndOfBlock) {
                            return Err(Error::InvalidPuff("Stored block is not terminated"));
                        }
                        l
                    }
                    Some(PuffData::EndOfBlock) => &[],
                    _ => return Err(Error::InvalidPuff("Stored block is not terminated")),
                };
                let length = u16::try_from(literals.len())
                    .map_err(|_| Error::InvalidPuff("Stored block is too long"))?;

                writer.write_bits(16, length.into());
                writer.write_bits(16, (!length).into());
                writer.write_aligned_bytes(literals)?;
                continue;
            }
            1 => {
                if metadata.len() != 1 {
                    return Err(Error::InvalidPuff("Fixed block has extra metadata"));
                }
                Tables::fixed()?
            }
            2 => Tables::write_dynamic(&metadata[1..], writer)?,
            _ => return Err(Error::InvalidBlockType(kind)),
        };

        loop {
            match parser.next()? {
                Some(PuffData::Literals(literals)) => {
                    for &byte in literals {
                        tables.lit_len.encode(writer, byte.into())?;
                    }
                }
                Some(PuffData::LenDist { length, distance }) => {
                    if distance > 32768 {
                        return Err(Error::InvalidPuff("Match distance is too large"));
                    }

                    let index = length_index(length);
                    tables.lit_len.encode(writer, 257 + index as u16)?;
                    writer.write_bits(
                        LENGTH_EXTRA_BITS[index].into(),
                        (length - LENGTH_BASES[index]).into(),
                    );

                    let index = distance_index(distance);
                    tables.distance.encode(writer, index as u16)?;
                    writer.write_bits(
                        DISTANCE_EXTRA_BITS[index].into(),
                        (distance - DISTANCE_BASES[index]).into(),
                    );
                }
                Some(PuffData::EndOfBlock) => {
                    tables.lit_len.encode(writer, END_OF_BLOCK)?;
                    break;
                }
                Some(PuffData::BlockMetadata(_)) | None => {
                    return Err(Error::InvalidPuff("Block is not terminated"));
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;
    use flate2::{Compression, write::DeflateEncoder};

    use super::*;
    use crate::format::puffin::{bits::BitReader, puff::puff_deflate};

    fn huff(puff: &[u8]) -> Result<Vec<u8>> {
        let mut writer = BitWriter::new();
        huff_deflate(puff, &mut writer)?;
        writer.write_boundary_bits(0);
        Ok(writer.bytes().to_vec())
    }

    fn deflate(data: &[u8], level: u32) -> Vec<u8> {
        let mut encoder = DeflateEncoder::new(vec![], Compression::new(level));
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn known_blocks() {
        let stored = [0x01, 0x03, 0x00, 0xfc, 0xff, b'a', b'b', b'c'];
        assert_eq!(huff(&[0x00, 0x00, 0x80, 0x02, b'a', b'b', b'c', 0xff, 0x81]).unwrap(), stored);

        // Empty stored block.
        assert_eq!(
            huff(&[0x00, 0x00, 0x80, 0xff, 0x81]).unwrap(),
            [0x01, 0x00, 0x00, 0xff, 0xff],
        );

        assert_eq!(huff(&[0x00, 0x00, 0xa0, 0x00, b'a', 0xff, 0x81]).unwrap(), [0x4b, 0x04, 0x00]);
    }

    #[test]
    fn zlib_streams_are_reproduced() {
        let mut text = vec![];
        for i in 0..4000u32 {
            writeln!(text, "line {} of {}", i % 97, i / 13).unwrap();
        }
        let random: Vec<u8> = (0..100_000u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect();

        let inputs: [&[u8]; 4] = [b"", b"a", &text, &random];

        for data in inputs {
            // Level 0 produces stored blocks, 1 fixed and dynamic blocks.
            for level in [0, 1, 6, 9] {
                let compressed = deflate(data, level);

                let mut reader = BitReader::new(&compressed);
                let puffed = puff_deflate(&mut reader).unwrap();
                assert!(reader.bits_remaining() < 8);

                assert_eq!(huff(&puffed).unwrap(), compressed, "level {level}");
            }
        }
    }

    #[test]
    fn reject_bad_blocks() {
        assert_matches!(huff(&[0x00, 0x00, 0xe0, 0xff, 0x81]), Err(Error::InvalidBlockType(3)));
        assert_matches!(huff(&[0x00, 0x00, 0xa0, 0x00, b'a']), Err(Error::InvalidPuff(_)));
        assert_matches!(huff(&[0x00, 0x00, 0xa0, 0x00]), Err(Error::InvalidPuff(_)));
        assert_matches!(
            huff(&[0x00, 0x01, 0xa0, 0x00, 0x00, b'a', 0xff, 0x81]),
            Err(Error::InvalidPuff(_))
        );
        // Literals that are not followed by the end of the stored block.
        assert_matches!(
            huff(&[0x00, 0x00, 0x80, 0x00, b'a', 0x00, b'b', 0xff, 0x81]),
            Err(Error::InvalidPuff(_))
        );
    }
}
