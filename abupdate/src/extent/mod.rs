// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Mapping between a logical byte stream and the scattered block ranges
//! ("extents") of a device that back it.

use std::{
    fmt,
    io::{self, Read, Seek, SeekFrom, Write},
};

use thiserror::Error;

use crate::{fd::FileDescriptor, protobuf::chromeos_update_engine::Extent};

pub mod bzip;
pub mod xz;

pub use bzip::BzipExtentWriter;
pub use xz::XzExtentWriter;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Extent {index} has no blocks")]
    EmptyExtent { index: usize },
    #[error("Extents are too large to address")]
    ExtentsTooLarge,
    #[error("Attempted to write {excess} bytes past the end of the extents")]
    WritePastEnd { excess: usize },
    #[error("Attempted to seek to {offset}, past the end of the extents ({size})")]
    SeekPastEnd { offset: u64, size: u64 },
    #[error("{0} trailing bytes were not consumed by the decompressor")]
    TrailingData(usize),
    #[error("Compressed stream ended prematurely")]
    StreamNotFinished,
    #[error("Compressed stream continues past its end marker")]
    DataAfterStreamEnd,
    #[error("bzip2 error")]
    Bzip2(#[from] bzip2::Error),
    #[error("XZ stream error")]
    XzStream(#[from] liblzma::stream::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            e => io::Error::other(e),
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Total number of blocks covered by `extents`.
pub fn blocks_in_extents(extents: &[Extent]) -> u64 {
    extents.iter().map(|e| e.num_blocks()).sum()
}

/// Human readable form of an extent list for diagnostics.
pub struct DisplayExtents<'a>(pub &'a [Extent]);

impl fmt::Display for DisplayExtents<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, extent) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }

            if extent.is_sparse_hole() {
                write!(f, "(hole, {})", extent.num_blocks())?;
            } else {
                write!(f, "({}, {})", extent.start_block(), extent.num_blocks())?;
            }
        }

        Ok(())
    }
}

/// Convert extents to `(byte offset, byte length)` pairs. Empty extents are
/// rejected since they can only come from a malformed manifest.
fn extent_byte_ranges(extents: &[Extent], block_size: u64) -> Result<Vec<(u64, u64)>> {
    extents
        .iter()
        .enumerate()
        .map(|(index, e)| {
            if e.num_blocks() == 0 {
                return Err(Error::EmptyExtent { index });
            }

            let offset = if e.is_sparse_hole() {
                u64::MAX
            } else {
                e.start_block()
                    .checked_mul(block_size)
                    .ok_or(Error::ExtentsTooLarge)?
            };
            let length = e
                .num_blocks()
                .checked_mul(block_size)
                .ok_or(Error::ExtentsTooLarge)?;

            // Positions within the extent are computed as `offset + n`.
            if !e.is_sparse_hole() && offset.checked_add(length).is_none() {
                return Err(Error::ExtentsTooLarge);
            }

            Ok((offset, length))
        })
        .collect()
}

/// Random access reader over the concatenation of a list of extents. Sparse
/// holes read back as zeros.
pub struct ExtentReader<'a> {
    fd: &'a mut dyn FileDescriptor,
    ranges: Vec<(u64, u64)>,
    /// `cumulative[i]` is the logical offset where extent `i` begins. Has one
    /// more entry than `ranges` holding the total size.
    cumulative: Vec<u64>,
    offset: u64,
}

impl<'a> ExtentReader<'a> {
    pub fn new(fd: &'a mut dyn FileDescriptor, extents: &[Extent], block_size: u64) -> Result<Self> {
        let ranges = extent_byte_ranges(extents, block_size)?;

        let mut cumulative = Vec::with_capacity(ranges.len() + 1);
        let mut total = 0u64;
        cumulative.push(0);
        for (_, length) in &ranges {
            total = total.checked_add(*length).ok_or(Error::ExtentsTooLarge)?;
            cumulative.push(total);
        }

        Ok(Self {
            fd,
            ranges,
            cumulative,
            offset: 0,
        })
    }

    /// Total logical size of all extents.
    pub fn size(&self) -> u64 {
        self.cumulative.last().copied().unwrap_or(0)
    }

    /// Index of the extent containing logical offset `offset`. Must be less
    /// than [`Self::size()`].
    fn extent_index(&self, offset: u64) -> usize {
        self.cumulative.partition_point(|c| *c <= offset) - 1
    }
}

impl Read for ExtentReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.offset >= self.size() || buf.is_empty() {
            return Ok(0);
        }

        let index = self.extent_index(self.offset);
        let (start, length) = self.ranges[index];
        let in_extent = self.offset - self.cumulative[index];
        let n = buf.len().min((length - in_extent).min(usize::MAX as u64) as usize);

        let n = if start == u64::MAX {
            buf[..n].fill(0);
            n
        } else {
            self.fd.seek(SeekFrom::Start(start + in_extent))?;
            self.fd.read(&mut buf[..n])?
        };

        self.offset += n as u64;

        Ok(n)
    }
}

impl Seek for ExtentReader<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let size = self.size();
        let offset = match pos {
            SeekFrom::Start(o) => Some(o),
            SeekFrom::End(o) => size.checked_add_signed(o),
            SeekFrom::Current(o) => self.offset.checked_add_signed(o),
        }
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "Offset would be before the start of the extents",
            )
        })?;

        if offset > size {
            return Err(Error::SeekPastEnd { offset, size }.into());
        }

        self.offset = offset;

        Ok(offset)
    }
}

/// Writes a logical byte stream across a list of extents. Data destined for a
/// sparse hole is dropped, but still counts towards the extent's size.
pub struct DirectExtentWriter<'a> {
    fd: &'a mut dyn FileDescriptor,
    ranges: Vec<(u64, u64)>,
    index: usize,
    extent_bytes_written: u64,
}

impl<'a> DirectExtentWriter<'a> {
    pub fn new(fd: &'a mut dyn FileDescriptor, extents: &[Extent], block_size: u64) -> Result<Self> {
        Ok(Self {
            fd,
            ranges: extent_byte_ranges(extents, block_size)?,
            index: 0,
            extent_bytes_written: 0,
        })
    }

    /// Write all of `data` or fail.
    pub fn write(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let Some((start, length)) = self.ranges.get(self.index).copied() else {
                return Err(Error::WritePastEnd { excess: data.len() });
            };

            let remaining = length - self.extent_bytes_written;
            let n = data.len().min(remaining.min(usize::MAX as u64) as usize);

            if start != u64::MAX {
                self.fd
                    .seek(SeekFrom::Start(start + self.extent_bytes_written))?;
                self.fd.write_all(&data[..n])?;
            }

            self.extent_bytes_written += n as u64;
            if self.extent_bytes_written == length {
                self.index += 1;
                self.extent_bytes_written = 0;
            }

            data = &data[n..];
        }

        Ok(())
    }
}

impl Write for DirectExtentWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        DirectExtentWriter::write(self, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.fd.flush()
    }
}

/// The writer pipeline for a single operation: plain, or with a decompressor
/// in front. Each stage owns the next.
pub enum ExtentWriter<'a> {
    Direct(DirectExtentWriter<'a>),
    Bzip(Box<BzipExtentWriter<DirectExtentWriter<'a>>>),
    Xz(Box<XzExtentWriter<DirectExtentWriter<'a>>>),
}

impl<'a> ExtentWriter<'a> {
    pub fn direct(fd: &'a mut dyn FileDescriptor, extents: &[Extent], block_size: u64) -> Result<Self> {
        DirectExtentWriter::new(fd, extents, block_size).map(Self::Direct)
    }

    pub fn bzip(fd: &'a mut dyn FileDescriptor, extents: &[Extent], block_size: u64) -> Result<Self> {
        let inner = DirectExtentWriter::new(fd, extents, block_size)?;
        Ok(Self::Bzip(Box::new(BzipExtentWriter::new(inner))))
    }

    pub fn xz(fd: &'a mut dyn FileDescriptor, extents: &[Extent], block_size: u64) -> Result<Self> {
        let inner = DirectExtentWriter::new(fd, extents, block_size)?;
        Ok(Self::Xz(Box::new(XzExtentWriter::new(inner)?)))
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Self::Direct(w) => w.write(data),
            Self::Bzip(w) => w.write(data),
            Self::Xz(w) => w.write(data),
        }
    }

    /// Check that every submitted byte was consumed. Must be called once all
    /// data has been written.
    pub fn finish(self) -> Result<()> {
        match self {
            Self::Direct(_) => Ok(()),
            Self::Bzip(w) => (*w).finish().map(|_| ()),
            Self::Xz(w) => (*w).finish().map(|_| ()),
        }
    }
}

/// Sink for decompressed data.
pub trait ExtentSink {
    fn write_all(&mut self, data: &[u8]) -> Result<()>;
}

impl ExtentSink for DirectExtentWriter<'_> {
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.write(data)
    }
}

impl ExtentSink for Vec<u8> {
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.extend_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Read, Seek, SeekFrom};

    use assert_matches::assert_matches;

    use super::*;
    use crate::protobuf::SPARSE_HOLE;

    const BLOCK_SIZE: u64 = 16;

    fn device(blocks: usize) -> Cursor<Vec<u8>> {
        Cursor::new(vec![0xaau8; blocks * BLOCK_SIZE as usize])
    }

    fn pattern(size: usize) -> Vec<u8> {
        (0..size).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn round_trip() {
        let extents = [Extent::new(5, 2), Extent::new(0, 1), Extent::new(8, 3)];
        let data = pattern(6 * BLOCK_SIZE as usize);
        let mut fd = device(12);

        let mut writer = DirectExtentWriter::new(&mut fd, &extents, BLOCK_SIZE).unwrap();
        for chunk in data.chunks(7) {
            writer.write(chunk).unwrap();
        }

        let mut reader = ExtentReader::new(&mut fd, &extents, BLOCK_SIZE).unwrap();
        assert_eq!(reader.size(), data.len() as u64);
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, data);

        // Untouched blocks keep their contents.
        let raw = fd.get_ref();
        assert_eq!(raw[16..32], [0xaa; 16]);
        assert_eq!(raw[5 * 16..7 * 16], data[..32]);
        assert_eq!(raw[0..16], data[32..48]);
    }

    #[test]
    fn sparse_hole_is_skipped() {
        let extents = [Extent::new(1, 1), Extent::new(SPARSE_HOLE, 2), Extent::new(0, 1)];
        let data = pattern(4 * BLOCK_SIZE as usize);
        let mut fd = device(2);

        let mut writer = DirectExtentWriter::new(&mut fd, &extents, BLOCK_SIZE).unwrap();
        writer.write(&data).unwrap();

        assert_eq!(fd.get_ref()[16..32], data[..16]);
        assert_eq!(fd.get_ref()[0..16], data[48..64]);

        let mut reader = ExtentReader::new(&mut fd, &extents, BLOCK_SIZE).unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf[..16], data[..16]);
        assert_eq!(buf[16..48], [0u8; 32]);
        assert_eq!(buf[48..], data[48..]);
    }

    #[test]
    fn seek_across_extents() {
        let extents = [Extent::new(3, 1), Extent::new(1, 2)];
        let mut fd = Cursor::new(pattern(4 * BLOCK_SIZE as usize));
        let mut reader = ExtentReader::new(&mut fd, &extents, BLOCK_SIZE).unwrap();

        reader.seek(SeekFrom::Start(14)).unwrap();
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).unwrap();
        // Two bytes from the end of block 3, then two from the start of block 1.
        assert_eq!(buf, [62, 63, 16, 17]);

        assert_eq!(reader.seek(SeekFrom::End(0)).unwrap(), 48);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
        reader.read_exact(&mut buf).unwrap_err();
        reader.seek(SeekFrom::Start(49)).unwrap_err();
    }

    #[test]
    fn write_past_end() {
        let extents = [Extent::new(0, 1)];
        let mut fd = device(4);
        let mut writer = DirectExtentWriter::new(&mut fd, &extents, BLOCK_SIZE).unwrap();

        writer.write(&[1u8; 10]).unwrap();
        assert_matches!(
            writer.write(&[1u8; 10]),
            Err(Error::WritePastEnd { excess: 4 })
        );
    }

    #[test]
    fn reject_empty_extent() {
        let extents = [Extent::new(0, 1), Extent::new(2, 0)];
        let mut fd = device(4);

        assert_matches!(
            DirectExtentWriter::new(&mut fd, &extents, BLOCK_SIZE).err(),
            Some(Error::EmptyExtent { index: 1 })
        );
    }

    #[test]
    fn reject_extent_past_address_space() {
        let mut fd = device(4);

        // The start is addressable, but the end is not.
        let extents = [Extent::new(0, 1), Extent::new(u64::MAX / BLOCK_SIZE, 1)];
        assert_matches!(
            DirectExtentWriter::new(&mut fd, &extents, BLOCK_SIZE).err(),
            Some(Error::ExtentsTooLarge)
        );
        assert_matches!(
            ExtentReader::new(&mut fd, &extents, BLOCK_SIZE).err(),
            Some(Error::ExtentsTooLarge)
        );

        let extents = [Extent::new(u64::MAX / BLOCK_SIZE - 1, 1)];
        assert!(DirectExtentWriter::new(&mut fd, &extents, BLOCK_SIZE).is_ok());
    }

    #[test]
    fn display() {
        let extents = [Extent::new(1, 2), Extent::new(SPARSE_HOLE, 3)];
        assert_eq!(DisplayExtents(&extents).to_string(), "(1, 2), (hole, 3)");
    }
}
