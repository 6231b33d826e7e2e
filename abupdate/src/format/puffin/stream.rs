// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Mapping between a stream containing deflate data and its puffed form.
//!
//! The puffed stream alternates between raw regions and puffs. Raw regions
//! contain the bytes between deflate streams verbatim, including bytes that
//! are partially shared with an adjacent deflate stream. Two deflate streams
//! that meet in the middle of a byte have no raw region between them.

use std::{
    collections::VecDeque,
    io::{self, Read, Seek, SeekFrom, Write},
};

use tracing::trace;

use super::{
    Error, Result,
    bits::{BitReader, BitWriter},
    huff::huff_deflate,
    puff::puff_deflate,
};
use crate::protobuf::puffin::metadata::{BitExtent, StreamInfo};

#[derive(Clone, Copy, Debug)]
enum Region {
    /// Bits `[start_bit, end_bit)` of the deflate side, stored as whole bytes.
    Raw { start_bit: u64, end_bit: u64 },
    /// Index into the deflate streams.
    Puff { deflate: usize },
}

#[derive(Clone, Copy, Debug)]
struct Segment {
    puff_offset: u64,
    puff_length: u64,
    region: Region,
}

/// Number of bytes needed to store bits `[start_bit, end_bit)`.
fn raw_length(start_bit: u64, end_bit: u64) -> u64 {
    if start_bit == end_bit {
        0
    } else {
        end_bit.div_ceil(8) - start_bit / 8
    }
}

/// Puff a single deflate stream. `data` begins at the byte containing the
/// first bit of `extent`.
fn puff_extent(data: &[u8], extent: &BitExtent, index: usize) -> Result<Vec<u8>> {
    let mut reader = BitReader::new(data);
    reader.skip(extent.offset % 8)?;

    let puffed = puff_deflate(&mut reader)?;

    // The final block may end before the extent does, but not outside of the
    // extent's last byte.
    let end = extent.offset % 8 + extent.length;
    if reader.bit_pos() > end || reader.bit_pos().div_ceil(8) != end.div_ceil(8) {
        return Err(Error::Layout(format!(
            "Deflate stream #{index} ends at bit {}, but extent ends at bit {end}",
            reader.bit_pos(),
        )));
    }

    Ok(puffed)
}

struct Layout {
    segments: Vec<Segment>,
    deflates: Vec<BitExtent>,
    puff_size: u64,
    deflate_size: u64,
}

impl Layout {
    fn new(info: &StreamInfo, puff_size: u64) -> Result<Self> {
        if info.deflates.len() != info.puffs.len() {
            return Err(Error::Layout(format!(
                "{} deflate streams, but {} puffs",
                info.deflates.len(),
                info.puffs.len(),
            )));
        }

        let overflow = || Error::Layout("Stream offsets overflow".to_owned());
        let mut segments = vec![];
        let mut bit_pos = 0u64;
        let mut puff_pos = 0u64;

        for (i, (deflate, puff)) in info.deflates.iter().zip(&info.puffs).enumerate() {
            if deflate.length == 0 || puff.length == 0 {
                return Err(Error::Layout(format!("Deflate stream #{i} is empty")));
            } else if deflate.offset < bit_pos {
                return Err(Error::Layout(format!(
                    "Deflate stream #{i} overlaps the previous stream",
                )));
            }

            let raw = raw_length(bit_pos, deflate.offset);
            if raw > 0 {
                segments.push(Segment {
                    puff_offset: puff_pos,
                    puff_length: raw,
                    region: Region::Raw {
                        start_bit: bit_pos,
                        end_bit: deflate.offset,
                    },
                });
                puff_pos = puff_pos.checked_add(raw).ok_or_else(overflow)?;
            }

            if puff.offset != puff_pos {
                return Err(Error::Layout(format!(
                    "Puff #{i} is at offset {}, but should be at {puff_pos}",
                    puff.offset,
                )));
            }

            segments.push(Segment {
                puff_offset: puff_pos,
                puff_length: puff.length,
                region: Region::Puff { deflate: i },
            });

            puff_pos = puff_pos.checked_add(puff.length).ok_or_else(overflow)?;
            bit_pos = deflate
                .offset
                .checked_add(deflate.length)
                .ok_or_else(overflow)?;
        }

        let tail = puff_size.checked_sub(puff_pos).ok_or_else(|| {
            Error::Layout(format!(
                "Puffs end at offset {puff_pos}, past the stream size {puff_size}",
            ))
        })?;
        let deflate_size = (bit_pos / 8).checked_add(tail).ok_or_else(overflow)?;
        let deflate_bits = deflate_size
            .checked_mul(8)
            .filter(|b| *b >= bit_pos)
            .ok_or_else(|| {
                Error::Layout(format!("Last deflate stream ends past bit {bit_pos}"))
            })?;

        if tail > 0 {
            segments.push(Segment {
                puff_offset: puff_pos,
                puff_length: tail,
                region: Region::Raw {
                    start_bit: bit_pos,
                    end_bit: deflate_bits,
                },
            });
        }

        Ok(Self {
            segments,
            deflates: info.deflates.clone(),
            puff_size,
            deflate_size,
        })
    }

    /// Find the segment containing puff offset `pos`.
    fn find(&self, pos: u64) -> Option<Segment> {
        let index = self.segments.partition_point(|s| s.puff_offset <= pos);
        let segment = self.segments.get(index.checked_sub(1)?)?;

        (pos < segment.puff_offset + segment.puff_length).then_some(*segment)
    }
}

/// Size of the puffed stream described by `info`. Streams without deflate
/// data may omit the size, in which case `fallback` is used.
pub fn puff_size(info: &StreamInfo, fallback: u64) -> u64 {
    if info.deflates.is_empty() && info.puff_length == 0 {
        fallback
    } else {
        info.puff_length
    }
}

/// Compute the puff locations for the deflate streams in `data`. Returns the
/// puff extents and the size of the puffed stream.
pub fn locate_puffs(data: &[u8], deflates: &[BitExtent]) -> Result<(Vec<BitExtent>, u64)> {
    let mut puffs = Vec::with_capacity(deflates.len());
    let mut bit_pos = 0u64;
    let mut puff_pos = 0u64;

    for (i, deflate) in deflates.iter().enumerate() {
        if deflate.length == 0 {
            return Err(Error::Layout(format!("Deflate stream #{i} is empty")));
        } else if deflate.offset < bit_pos {
            return Err(Error::Layout(format!(
                "Deflate stream #{i} overlaps the previous stream",
            )));
        }

        let end = deflate
            .offset
            .checked_add(deflate.length)
            .and_then(|e| usize::try_from(e.div_ceil(8)).ok())
            .filter(|e| *e <= data.len())
            .ok_or_else(|| Error::Layout(format!("Deflate stream #{i} is out of bounds")))?;
        let start = (deflate.offset / 8) as usize;

        puff_pos += raw_length(bit_pos, deflate.offset);

        let puffed = puff_extent(&data[start..end], deflate, i)?;
        puffs.push(BitExtent {
            offset: puff_pos,
            length: puffed.len() as u64,
        });

        puff_pos += puffed.len() as u64;
        bit_pos = deflate.offset + deflate.length;
    }

    puff_pos += raw_length(bit_pos, data.len() as u64 * 8);

    Ok((puffs, puff_pos))
}

/// Presents the puffed form of a seekable stream. Puffed deflate streams are
/// kept in an LRU cache bounded by `cache_size` bytes, though the most
/// recently used one is always kept.
pub struct PuffReader<'a, R: Read + Seek + ?Sized> {
    inner: &'a mut R,
    layout: Layout,
    cache: VecDeque<(usize, Vec<u8>)>,
    cache_size: usize,
    cached_bytes: usize,
    pos: u64,
}

impl<'a, R: Read + Seek + ?Sized> PuffReader<'a, R> {
    pub fn new(
        inner: &'a mut R,
        info: &StreamInfo,
        inner_size: u64,
        cache_size: usize,
    ) -> Result<Self> {
        let layout = Layout::new(info, puff_size(info, inner_size))?;
        if layout.deflate_size != inner_size {
            return Err(Error::DeflateSize {
                expected: inner_size,
                actual: layout.deflate_size,
            });
        }

        Ok(Self {
            inner,
            layout,
            cache: VecDeque::new(),
            cache_size,
            cached_bytes: 0,
            pos: 0,
        })
    }

    pub fn puff_size(&self) -> u64 {
        self.layout.puff_size
    }

    fn puffed(&mut self, index: usize) -> Result<&[u8]> {
        if let Some(i) = self.cache.iter().position(|(d, _)| *d == index) {
            if let Some(entry) = self.cache.remove(i) {
                self.cache.push_front(entry);
            }
        } else {
            let extent = &self.layout.deflates[index];
            let start = extent.offset / 8;
            let end = (extent.offset + extent.length).div_ceil(8);

            let mut data = vec![0u8; (end - start) as usize];
            self.inner.seek(SeekFrom::Start(start))?;
            self.inner.read_exact(&mut data)?;

            let puffed = puff_extent(&data, extent, index)?;
            let expected = self.layout.segments.iter().find_map(|s| match s.region {
                Region::Puff { deflate } if deflate == index => Some(s.puff_length),
                _ => None,
            });
            if Some(puffed.len() as u64) != expected {
                return Err(Error::Layout(format!(
                    "Deflate stream #{index} puffs to {} bytes, but expected {expected:?}",
                    puffed.len(),
                )));
            }

            trace!("Puffed deflate stream #{index}: {extent:?} -> {} bytes", puffed.len());

            self.cached_bytes += puffed.len();
            self.cache.push_front((index, puffed));

            while self.cached_bytes > self.cache_size && self.cache.len() > 1 {
                if let Some((_, evicted)) = self.cache.pop_back() {
                    self.cached_bytes -= evicted.len();
                }
            }
        }

        Ok(&self.cache[0].1)
    }
}

impl<R: Read + Seek + ?Sized> Read for PuffReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let Some(segment) = self.layout.find(self.pos) else {
            return Ok(0);
        };
        let offset = self.pos - segment.puff_offset;
        let n = (segment.puff_length - offset).min(buf.len() as u64) as usize;

        match segment.region {
            Region::Raw { start_bit, .. } => {
                self.inner.seek(SeekFrom::Start(start_bit / 8 + offset))?;
                self.inner.read_exact(&mut buf[..n])?;
            }
            Region::Puff { deflate } => {
                let data = self.puffed(deflate)?;
                let offset = offset as usize;
                buf[..n].copy_from_slice(&data[offset..offset + n]);
            }
        }

        self.pos += n as u64;

        Ok(n)
    }
}

impl<R: Read + Seek + ?Sized> Seek for PuffReader<'_, R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(o) => Some(o),
            SeekFrom::End(o) => self.layout.puff_size.checked_add_signed(o),
            SeekFrom::Current(o) => self.pos.checked_add_signed(o),
        }
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Seek out of bounds"))?;

        self.pos = new_pos;

        Ok(new_pos)
    }
}

/// Accepts the puffed form of a stream sequentially and writes the original
/// form to the inner writer. Each puff is buffered until it is complete.
pub struct HuffWriter<'a, W: Write + ?Sized> {
    inner: &'a mut W,
    layout: Layout,
    bits: BitWriter,
    puff: Vec<u8>,
    pos: u64,
}

impl<'a, W: Write + ?Sized> HuffWriter<'a, W> {
    pub fn new(inner: &'a mut W, info: &StreamInfo, puff_size: u64) -> Result<Self> {
        Ok(Self {
            inner,
            layout: Layout::new(info, puff_size)?,
            bits: BitWriter::new(),
            puff: vec![],
            pos: 0,
        })
    }

    fn write_segment(&mut self, segment: Segment, data: &[u8]) -> Result<()> {
        let offset = self.pos - segment.puff_offset;

        match segment.region {
            Region::Raw { start_bit, end_bit } => {
                for (byte_index, &byte) in (start_bit / 8 + offset..).zip(data) {
                    let low = (byte_index * 8).max(start_bit);
                    let high = (byte_index * 8 + 8).min(end_bit);

                    self.bits.write_bits(
                        (high - low) as u32,
                        u32::from(byte >> (low - byte_index * 8)),
                    );
                }
            }
            Region::Puff { deflate } => {
                self.puff.extend_from_slice(data);

                if offset + data.len() as u64 == segment.puff_length {
                    let extent = &self.layout.deflates[deflate];
                    let end = extent.offset + extent.length;

                    if self.bits.bit_pos() != extent.offset {
                        return Err(Error::Layout(format!(
                            "Deflate stream #{deflate} starts at bit {}, but expected {}",
                            self.bits.bit_pos(),
                            extent.offset,
                        )));
                    }

                    huff_deflate(&self.puff, &mut self.bits)?;

                    let pos = self.bits.bit_pos();
                    if pos > end || pos.div_ceil(8) != end.div_ceil(8) {
                        return Err(Error::Layout(format!(
                            "Deflate stream #{deflate} ends at bit {pos}, but expected {end}",
                        )));
                    }
                    self.bits.write_bits((end - pos) as u32, 0);

                    self.puff.clear();
                }
            }
        }

        self.pos += data.len() as u64;
        self.bits.drain_to(&mut *self.inner)?;

        Ok(())
    }

    /// Verify that the entire stream was written. Returns the size of the
    /// output.
    pub fn finish(mut self) -> Result<u64> {
        if self.pos != self.layout.puff_size {
            return Err(Error::PuffSize {
                expected: self.layout.puff_size,
                actual: self.pos,
            });
        }

        self.bits.drain_to(&mut *self.inner)?;
        self.inner.flush()?;

        Ok(self.layout.deflate_size)
    }
}

impl<W: Write + ?Sized> Write for HuffWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut written = 0;

        while written < buf.len() {
            let segment = self.layout.find(self.pos).ok_or_else(|| {
                Error::Layout(format!("Write past the puffed stream end at {}", self.pos))
            })?;
            let remaining = segment.puff_length - (self.pos - segment.puff_offset);
            let n = remaining.min((buf.len() - written) as u64) as usize;

            self.write_segment(segment, &buf[written..written + n])?;
            written += n;
        }

        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.bits.drain_to(&mut *self.inner)?;
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;
    use flate2::{Compression, write::DeflateEncoder};

    use super::*;

    /// Deflate streams surrounded by and sometimes adjacent to raw data.
    /// Returns the data and the bit extents of the deflate streams.
    fn build(parts: &[&[u8]]) -> (Vec<u8>, Vec<BitExtent>) {
        let mut data = b"header".to_vec();
        let mut deflates = vec![];

        for (i, part) in parts.iter().enumerate() {
            let mut encoder = DeflateEncoder::new(vec![], Compression::new(6));
            encoder.write_all(part).unwrap();
            let compressed = encoder.finish().unwrap();

            deflates.push(BitExtent {
                offset: data.len() as u64 * 8,
                length: compressed.len() as u64 * 8,
            });
            data.extend_from_slice(&compressed);

            if i % 2 == 0 {
                data.extend_from_slice(b"gap");
            }
        }

        data.extend_from_slice(b"trailer");

        (data, deflates)
    }

    fn stream_info(data: &[u8], deflates: Vec<BitExtent>) -> StreamInfo {
        super::super::stream_info(data, deflates).unwrap()
    }

    fn puff_all(data: &[u8], info: &StreamInfo, cache_size: usize) -> Vec<u8> {
        let mut cursor = Cursor::new(data);
        let mut reader =
            PuffReader::new(&mut cursor, info, data.len() as u64, cache_size).unwrap();
        let mut puffed = vec![];
        reader.read_to_end(&mut puffed).unwrap();
        puffed
    }

    fn huff_all(puffed: &[u8], info: &StreamInfo, chunk_size: usize) -> Result<Vec<u8>> {
        let mut output = vec![];
        let mut writer = HuffWriter::new(&mut output, info, puffed.len() as u64)?;
        for chunk in puffed.chunks(chunk_size) {
            writer.write_all(chunk)?;
        }
        let size = writer.finish()?;
        assert_eq!(size, output.len() as u64);
        Ok(output)
    }

    #[test]
    fn raw_lengths() {
        assert_eq!(raw_length(0, 0), 0);
        assert_eq!(raw_length(16, 16), 0);
        assert_eq!(raw_length(13, 13), 0);
        assert_eq!(raw_length(13, 14), 1);
        assert_eq!(raw_length(13, 17), 2);
        assert_eq!(raw_length(16, 40), 3);
    }

    #[test]
    fn byte_aligned_streams() {
        let text = b"the quick brown fox jumps over the lazy dog ".repeat(50);
        let (data, deflates) = build(&[&text, b"x", &text[..100], &text]);
        let info = stream_info(&data, deflates);

        assert!(info.puff_length > data.len() as u64);

        for cache_size in [0, 1 << 20] {
            let puffed = puff_all(&data, &info, cache_size);
            assert_eq!(puffed.len() as u64, info.puff_length);
            assert_eq!(&puffed[..6], b"header");
            assert!(puffed.ends_with(b"trailer"));

            for chunk_size in [1, 7, 4096] {
                assert_eq!(huff_all(&puffed, &info, chunk_size).unwrap(), data);
            }
        }
    }

    #[test]
    fn unaligned_streams() {
        let fixed_a = [0x00, 0x00, 0xa0, 0x00, b'a', 0xff, 0x81];
        let fixed_b = [0x00, 0x00, 0xa0, 0x00, b'b', 0xff, 0x81];
        // Stored block with one padding bit set.
        let stored = [0x00, 0x00, 0x81, 0x01, b'h', b'i', 0xff, 0x81];

        let mut writer = BitWriter::new();
        writer.write_bits(3, 0b101);
        huff_deflate(&fixed_a, &mut writer).unwrap();
        assert_eq!(writer.bit_pos(), 21);
        huff_deflate(&fixed_b, &mut writer).unwrap();
        assert_eq!(writer.bit_pos(), 39);
        writer.write_bits(5, 0b10110);
        huff_deflate(&stored, &mut writer).unwrap();
        assert_eq!(writer.bit_pos(), 96);
        writer.write_aligned_bytes(b"end").unwrap();
        let data = writer.bytes().to_vec();

        let extent = |offset, length| BitExtent { offset, length };
        let info = stream_info(&data, vec![extent(3, 18), extent(21, 18), extent(44, 52)]);
        assert_eq!(info.puffs, [extent(1, 7), extent(8, 7), extent(17, 8)]);
        assert_eq!(info.puff_length, 28);

        let puffed = puff_all(&data, &info, 0);
        assert_eq!(puffed[1..8], fixed_a);
        assert_eq!(puffed[8..15], fixed_b);
        assert_eq!(puffed[17..25], stored);
        assert_eq!(&puffed[25..], b"end");

        for chunk_size in [1, 3, 4096] {
            assert_eq!(huff_all(&puffed, &info, chunk_size).unwrap(), data);
        }

        // An extent may cover unused bits at the end of its last byte. They
        // are written as zeros.
        let info = stream_info(&data, vec![extent(3, 18), extent(21, 19), extent(44, 52)]);
        assert_eq!(info.puffs, [extent(1, 7), extent(8, 7), extent(16, 8)]);

        let puffed = puff_all(&data, &info, 0);
        assert_eq!(huff_all(&puffed, &info, 4096).unwrap(), data);
    }

    #[test]
    fn reject_bad_layouts() {
        let (data, deflates) = build(&[b"aaaaaaaaaa", b"bbbbbbbbbb"]);
        let info = stream_info(&data, deflates);
        let size = data.len() as u64;

        let mut bad = info.clone();
        bad.puffs.pop();
        assert_matches!(Layout::new(&bad, info.puff_length).err(), Some(Error::Layout(_)));

        let mut bad = info.clone();
        bad.puffs[1].offset += 1;
        assert_matches!(Layout::new(&bad, info.puff_length).err(), Some(Error::Layout(_)));

        let mut bad = info.clone();
        bad.deflates[1].offset = bad.deflates[0].offset;
        assert_matches!(Layout::new(&bad, info.puff_length).err(), Some(Error::Layout(_)));

        assert_matches!(Layout::new(&info, 1).err(), Some(Error::Layout(_)));

        let mut cursor = Cursor::new(&data);
        assert_matches!(
            PuffReader::new(&mut cursor, &info, size + 1, 0).err(),
            Some(Error::DeflateSize { expected, actual }) if expected == size + 1 && actual == size
        );

        // Writing too little or too much.
        let puffed = puff_all(&data, &info, 0);
        let mut output = vec![];
        let mut writer = HuffWriter::new(&mut output, &info, info.puff_length).unwrap();
        writer.write_all(&puffed[..10]).unwrap();
        assert_matches!(writer.finish(), Err(Error::PuffSize { actual: 10, .. }));

        let mut extra = puffed.clone();
        extra.push(0);
        assert!(huff_all(&extra, &info, 4096).is_err());
    }
}
