// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Puffin patch container.
//!
//! ```text
//! magic        "PUF1"
//! header_size  u32 BE
//! header       PatchHeader protobuf
//! patch        raw bsdiff patch over the "puffed" streams
//! ```
//!
//! Puffing replaces deflate streams with an expanded representation that
//! diffs better. The inner patch is applied between the puffed form of the
//! old data and the puffed form of the new data. The new data's deflate
//! streams are rebuilt bit for bit from their puffed form.

use std::io::{self, Read, Seek, SeekFrom, Write};

use prost::Message;
use thiserror::Error;
use tracing::debug;

use crate::{
    format::bspatch,
    protobuf::puffin::metadata::{BitExtent, PatchHeader, StreamInfo, patch_header::PatchType},
};

mod bits;
mod huff;
mod huffman;
mod puff;
mod stream;

pub use stream::{HuffWriter, PuffReader, locate_puffs, puff_size};

const PUFFIN_MAGIC: &[u8; 4] = b"PUF1";
const PATCH_HEADER_VERSION: i32 = 1;

/// Default upper bound for the source read cache.
pub const DEFAULT_CACHE_SIZE: usize = 5 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown puffin magic: {0:?}")]
    UnknownMagic([u8; 4]),
    #[error("Patch is truncated")]
    Truncated,
    #[error("Unsupported patch header version: {0}")]
    UnsupportedVersion(i32),
    #[error("Unsupported patch type: {0:?}")]
    UnsupportedType(i32),
    #[error("Failed to parse patch header")]
    HeaderParse(#[source] prost::DecodeError),
    #[error("Inner bsdiff patch failed")]
    Bspatch(#[from] bspatch::Error),
    #[error("Deflate data ended prematurely")]
    UnexpectedEnd,
    #[error("Deflate data is not byte aligned")]
    Unaligned,
    #[error("Invalid Huffman code lengths")]
    InvalidCodeLengths,
    #[error("Invalid Huffman code in deflate data")]
    InvalidCode,
    #[error("Symbol has no Huffman code: {0}")]
    InvalidSymbol(u16),
    #[error("Invalid deflate block type: {0}")]
    InvalidBlockType(u8),
    #[error("Stored block length {length:#06x} does not match its complement {inverse:#06x}")]
    StoredLength { length: u32, inverse: u32 },
    #[error("Stored block padding does not fit in the block header: {0:#x}")]
    StoredPadding(u8),
    #[error("Invalid puff data: {0}")]
    InvalidPuff(&'static str),
    #[error("Invalid stream layout: {0}")]
    Layout(String),
    #[error("Expected {expected} bytes of deflate data, but found {actual}")]
    DeflateSize { expected: u64, actual: u64 },
    #[error("Expected {expected} bytes of puffed data, but found {actual}")]
    PuffSize { expected: u64, actual: u64 },
    #[error("I/O error")]
    Io(#[from] io::Error),
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            e => Self::other(e),
        }
    }
}

type Result<T> = std::result::Result<T, Error>;

/// Split a puffin patch into its header and the inner bsdiff patch.
pub fn parse(patch: &[u8]) -> Result<(PatchHeader, &[u8])> {
    let magic: [u8; 4] = patch
        .get(..4)
        .and_then(|m| m.try_into().ok())
        .ok_or(Error::Truncated)?;
    if magic != *PUFFIN_MAGIC {
        return Err(Error::UnknownMagic(magic));
    }

    let header_size: [u8; 4] = patch
        .get(4..8)
        .and_then(|m| m.try_into().ok())
        .ok_or(Error::Truncated)?;
    let header_end = usize::try_from(u32::from_be_bytes(header_size))
        .ok()
        .and_then(|n| n.checked_add(8))
        .filter(|n| *n <= patch.len())
        .ok_or(Error::Truncated)?;

    let header = PatchHeader::decode(&patch[8..header_end]).map_err(Error::HeaderParse)?;

    Ok((header, &patch[header_end..]))
}

/// Apply a puffin patch. `old` is read through a window cache of at most
/// `cache_size` bytes and puffed deflate streams are cached up to the same
/// limit. Returns the number of bytes written.
pub fn puffpatch(
    old: &mut (impl Read + Seek + ?Sized),
    old_size: u64,
    new: &mut (impl Write + ?Sized),
    patch: &[u8],
    cache_size: usize,
) -> Result<u64> {
    let (header, inner) = parse(patch)?;

    if header.version != PATCH_HEADER_VERSION {
        return Err(Error::UnsupportedVersion(header.version));
    }

    match PatchType::try_from(header.r#type) {
        Ok(PatchType::Bsdiff) => {}
        _ => return Err(Error::UnsupportedType(header.r#type)),
    }

    let src = header.src.unwrap_or_default();
    let dst = header.dst.unwrap_or_default();

    debug!(
        "Applying {} byte puffin patch: {} source and {} target deflate streams",
        inner.len(),
        src.deflates.len(),
        dst.deflates.len(),
    );

    let mut window = WindowCache::new(old, old_size, cache_size);
    let mut reader = PuffReader::new(&mut window, &src, old_size, cache_size)?;
    let src_puff_size = reader.puff_size();

    let dst_puff_size = puff_size(&dst, bspatch::new_size(inner)?);
    let mut writer = HuffWriter::new(new, &dst, dst_puff_size)?;

    bspatch::bspatch(&mut reader, src_puff_size, &mut writer, inner)?;

    writer.finish()
}

/// Describe `data`, which contains deflate streams at the bit extents in
/// `deflates`, along with the locations of the streams' puffed forms.
pub fn stream_info(data: &[u8], deflates: Vec<BitExtent>) -> Result<StreamInfo> {
    let (puffs, puff_length) = locate_puffs(data, &deflates)?;

    Ok(StreamInfo {
        deflates,
        puffs,
        puff_length,
    })
}

/// Caches one contiguous window of the underlying reader. bspatch reads the
/// old data mostly sequentially with occasional seeks, so a single window
/// absorbs most of the small reads.
struct WindowCache<'a, R: Read + Seek + ?Sized> {
    inner: &'a mut R,
    size: u64,
    capacity: usize,
    window_start: u64,
    window: Vec<u8>,
    pos: u64,
}

impl<'a, R: Read + Seek + ?Sized> WindowCache<'a, R> {
    fn new(inner: &'a mut R, size: u64, capacity: usize) -> Self {
        Self {
            inner,
            size,
            capacity: capacity.max(1),
            window_start: 0,
            window: Vec::new(),
            pos: 0,
        }
    }

    fn in_window(&self, pos: u64) -> bool {
        pos >= self.window_start && pos < self.window_start + self.window.len() as u64
    }

    fn fill(&mut self) -> io::Result<()> {
        let len = (self.size - self.pos).min(self.capacity as u64) as usize;

        self.window.resize(len, 0);
        self.inner.seek(SeekFrom::Start(self.pos))?;
        self.inner.read_exact(&mut self.window)?;
        self.window_start = self.pos;

        Ok(())
    }
}

impl<R: Read + Seek + ?Sized> Read for WindowCache<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.size || buf.is_empty() {
            return Ok(0);
        }

        // Requests larger than the cache bypass it.
        if buf.len() >= self.capacity && !self.in_window(self.pos) {
            let n = buf.len().min((self.size - self.pos) as usize);
            self.inner.seek(SeekFrom::Start(self.pos))?;
            self.inner.read_exact(&mut buf[..n])?;
            self.pos += n as u64;
            return Ok(n);
        }

        if !self.in_window(self.pos) {
            self.fill()?;
        }

        let offset = (self.pos - self.window_start) as usize;
        let n = buf.len().min(self.window.len() - offset);
        buf[..n].copy_from_slice(&self.window[offset..offset + n]);
        self.pos += n as u64;

        Ok(n)
    }
}

impl<R: Read + Seek + ?Sized> Seek for WindowCache<'_, R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(o) => Some(o),
            SeekFrom::End(o) => self.size.checked_add_signed(o),
            SeekFrom::Current(o) => self.pos.checked_add_signed(o),
        }
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Seek out of bounds"))?;

        self.pos = new_pos;

        Ok(new_pos)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;
    use flate2::{Compression, write::DeflateEncoder};

    use super::*;
    use crate::format::bspatch::tests::make_patch;

    fn wrap(header: &PatchHeader, inner: &[u8]) -> Vec<u8> {
        let raw_header = header.encode_to_vec();

        let mut patch = vec![];
        patch.extend_from_slice(PUFFIN_MAGIC);
        patch.extend_from_slice(&(raw_header.len() as u32).to_be_bytes());
        patch.extend_from_slice(&raw_header);
        patch.extend_from_slice(inner);
        patch
    }

    fn header() -> PatchHeader {
        PatchHeader {
            version: PATCH_HEADER_VERSION,
            src: Some(StreamInfo::default()),
            dst: Some(StreamInfo::default()),
            r#type: PatchType::Bsdiff.into(),
        }
    }

    #[test]
    fn apply_without_deflates() {
        let old: Vec<u8> = (0..50_000u32).map(|i| (i / 3) as u8).collect();
        let mut new = old.clone();
        new[1000..1100].fill(0xff);
        let inner = make_patch(&old, &new, &[(30_000, 100, -100), (19_900, 0, 0)], false);
        let patch = wrap(&header(), &inner);

        // Small cache to exercise refills.
        for cache_size in [1, 4096, DEFAULT_CACHE_SIZE] {
            let mut output = vec![];
            let n = puffpatch(
                &mut Cursor::new(&old),
                old.len() as u64,
                &mut output,
                &patch,
                cache_size,
            )
            .unwrap();

            assert_eq!(n, new.len() as u64);
            assert_eq!(output, new, "cache size {cache_size}");
        }
    }

    #[test]
    fn reject_unsupported() {
        let inner = make_patch(b"a", b"a", &[(1, 0, 0)], false);
        let mut output = vec![];
        let mut apply = |patch: &[u8]| {
            puffpatch(&mut Cursor::new(b"a"), 1, &mut output, patch, 4096)
        };

        assert_matches!(apply(b"PUF0\0\0\0\0"), Err(Error::UnknownMagic(_)));
        assert_matches!(apply(b"PUF1\0\0\0\x10"), Err(Error::Truncated));

        let mut h = header();
        h.version = 2;
        assert_matches!(apply(&wrap(&h, &inner)), Err(Error::UnsupportedVersion(2)));

        let mut h = header();
        h.r#type = PatchType::Zucchini.into();
        assert_matches!(apply(&wrap(&h, &inner)), Err(Error::UnsupportedType(1)));

        // Puff locations that do not match the deflate streams.
        let mut h = header();
        h.src = Some(StreamInfo {
            deflates: vec![BitExtent {
                offset: 0,
                length: 8,
            }],
            ..Default::default()
        });
        assert_matches!(apply(&wrap(&h, &inner)), Err(Error::Layout(_)));

        // Source data that is not deflate data.
        let mut h = header();
        h.src = Some(StreamInfo {
            deflates: vec![BitExtent {
                offset: 0,
                length: 8,
            }],
            puffs: vec![BitExtent {
                offset: 0,
                length: 1,
            }],
            puff_length: 1,
        });
        let inner = make_patch(b"a", b"a", &[(1, 0, 0)], false);
        assert_matches!(apply(&wrap(&h, &inner)), Err(Error::Bspatch(_)));
    }

    fn deflate(data: &[u8]) -> Vec<u8> {
        let mut encoder = DeflateEncoder::new(vec![], Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    /// Raw data surrounding a deflate stream, like a zip entry.
    fn archive(prefix: &[u8], contents: &[u8], suffix: &[u8]) -> (Vec<u8>, StreamInfo) {
        let compressed = deflate(contents);

        let mut data = prefix.to_vec();
        data.extend_from_slice(&compressed);
        data.extend_from_slice(suffix);

        let deflates = vec![BitExtent {
            offset: prefix.len() as u64 * 8,
            length: compressed.len() as u64 * 8,
        }];
        let info = stream_info(&data, deflates).unwrap();

        (data, info)
    }

    fn puffed(data: &[u8], info: &StreamInfo) -> Vec<u8> {
        let mut cursor = Cursor::new(data);
        let mut reader = PuffReader::new(&mut cursor, info, data.len() as u64, 0).unwrap();
        let mut puffed = vec![];
        reader.read_to_end(&mut puffed).unwrap();
        puffed
    }

    #[test]
    fn apply_with_deflates() {
        let mut contents = vec![];
        for i in 0..2000 {
            writeln!(contents, "entry {i}: {}", i * 7 % 13).unwrap();
        }
        let (old, src) = archive(b"PK old header", &contents, b"old central directory");

        contents[5000..5010].copy_from_slice(b"0123456789");
        contents.extend_from_slice(b"appended line\n");
        let (new, dst) = archive(b"PK new header!", &contents, b"new central directory");

        let old_puffed = puffed(&old, &src);
        let new_puffed = puffed(&new, &dst);
        assert_eq!(new_puffed.len() as u64, dst.puff_length);

        // Diff entirely against the old puffed data so that the output
        // depends on puffing the source correctly.
        let inner = make_patch(
            &old_puffed,
            &new_puffed,
            &[(new_puffed.len() as i64, 0, 0)],
            false,
        );
        let h = PatchHeader {
            src: Some(src),
            dst: Some(dst),
            ..header()
        };
        let patch = wrap(&h, &inner);

        for cache_size in [0, 4096, DEFAULT_CACHE_SIZE] {
            let mut output = vec![];
            let n = puffpatch(
                &mut Cursor::new(&old),
                old.len() as u64,
                &mut output,
                &patch,
                cache_size,
            )
            .unwrap();

            assert_eq!(n, new.len() as u64);
            assert_eq!(output, new, "cache size {cache_size}");
        }

        // The old data must match the described layout.
        assert_matches!(
            puffpatch(
                &mut Cursor::new(&old),
                old.len() as u64 - 1,
                &mut vec![],
                &patch,
                DEFAULT_CACHE_SIZE,
            ),
            Err(Error::DeflateSize { .. })
        );
    }
}
