// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Applier for bsdiff patches in the classic `BSDIFF40` format (all streams
//! bzip2-compressed) and the Android `BSDF2` format (per-stream compression).
//!
//! Both share a 32-byte header:
//!
//! ```text
//! magic        [8]   "BSDIFF40" or "BSDF2" + 3 compression type bytes
//! ctrl_len     i64   sign-magnitude little endian
//! diff_len     i64
//! new_size     i64
//! ```
//!
//! The control, diff, and extra streams follow back to back. The control
//! stream is a sequence of `(diff_len, extra_len, old_seek)` triplets. The old
//! data is never fully loaded: it is read on demand through [`Read`] + [`Seek`]
//! so that it can live in scattered extents.

use std::io::{self, Read, Seek, SeekFrom, Write};

use bzip2::read::BzDecoder;
use thiserror::Error;

const BSDIFF40_MAGIC: &[u8; 8] = b"BSDIFF40";
const BSDF2_MAGIC: &[u8; 5] = b"BSDF2";
const HEADER_SIZE: usize = 32;

const CHUNK_SIZE: usize = 65536;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Patch is too small for the header: {0} bytes")]
    TooSmall(usize),
    #[error("Unknown patch magic: {0:?}")]
    UnknownMagic([u8; 8]),
    #[error("Unknown stream compression type: {0}")]
    UnknownCompression(u8),
    #[error("Invalid {field} in header: {value}")]
    InvalidHeader { field: &'static str, value: i64 },
    #[error("Stream lengths exceed the patch size")]
    StreamsOutOfBounds,
    #[error("Invalid control entry: ({0}, {1}, {2})")]
    InvalidControl(i64, i64, i64),
    #[error("Old data is too large to address: {0} bytes")]
    OldTooLarge(u64),
    #[error("Control entry would write past the new size ({0})")]
    NewSizeExceeded(u64),
    #[error("Stream ended prematurely")]
    Truncated(#[source] io::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Decode a sign-magnitude little endian integer.
fn offtin(buf: [u8; 8]) -> i64 {
    let magnitude = (u64::from_le_bytes(buf) & !(1 << 63)) as i64;

    if buf[7] & 0x80 != 0 {
        -magnitude
    } else {
        magnitude
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Compression {
    None,
    Bzip2,
    Brotli,
}

impl Compression {
    fn from_bsdf2(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Bzip2),
            2 => Ok(Self::Brotli),
            v => Err(Error::UnknownCompression(v)),
        }
    }
}

enum CompressedStream<'a> {
    None(&'a [u8]),
    Bzip2(Box<BzDecoder<&'a [u8]>>),
    Brotli(Box<brotli::Decompressor<&'a [u8]>>),
}

impl<'a> CompressedStream<'a> {
    fn new(compression: Compression, data: &'a [u8]) -> Self {
        match compression {
            Compression::None => Self::None(data),
            Compression::Bzip2 => Self::Bzip2(Box::new(BzDecoder::new(data))),
            Compression::Brotli => Self::Brotli(Box::new(brotli::Decompressor::new(data, 4096))),
        }
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        let result = match self {
            Self::None(r) => r.read_exact(buf),
            Self::Bzip2(r) => r.read_exact(buf),
            Self::Brotli(r) => r.read_exact(buf),
        };

        result.map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                Error::Truncated(e)
            } else {
                Error::Io(e)
            }
        })
    }

    fn read_offtin(&mut self) -> Result<i64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(offtin(buf))
    }
}

/// Parsed patch header with the three stream readers.
struct Patch<'a> {
    new_size: u64,
    ctrl: CompressedStream<'a>,
    diff: CompressedStream<'a>,
    extra: CompressedStream<'a>,
}

impl<'a> Patch<'a> {
    fn parse(patch: &'a [u8]) -> Result<Self> {
        if patch.len() < HEADER_SIZE {
            return Err(Error::TooSmall(patch.len()));
        }

        let mut magic = [0u8; 8];
        magic.copy_from_slice(&patch[..8]);

        let types = if magic == *BSDIFF40_MAGIC {
            [Compression::Bzip2; 3]
        } else if magic.starts_with(BSDF2_MAGIC) {
            [
                Compression::from_bsdf2(magic[5])?,
                Compression::from_bsdf2(magic[6])?,
                Compression::from_bsdf2(magic[7])?,
            ]
        } else {
            return Err(Error::UnknownMagic(magic));
        };

        let field = |name: &'static str, offset: usize| -> Result<u64> {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&patch[offset..offset + 8]);
            let value = offtin(buf);

            u64::try_from(value).map_err(|_| Error::InvalidHeader { field: name, value })
        };

        let ctrl_len = field("ctrl_len", 8)?;
        let diff_len = field("diff_len", 16)?;
        let new_size = field("new_size", 24)?;

        let body = &patch[HEADER_SIZE..];
        let ctrl_end = usize::try_from(ctrl_len)
            .ok()
            .filter(|n| *n <= body.len())
            .ok_or(Error::StreamsOutOfBounds)?;
        let diff_end = usize::try_from(diff_len)
            .ok()
            .and_then(|n| ctrl_end.checked_add(n))
            .filter(|n| *n <= body.len())
            .ok_or(Error::StreamsOutOfBounds)?;

        Ok(Self {
            new_size,
            ctrl: CompressedStream::new(types[0], &body[..ctrl_end]),
            diff: CompressedStream::new(types[1], &body[ctrl_end..diff_end]),
            extra: CompressedStream::new(types[2], &body[diff_end..]),
        })
    }
}

/// Size of the output that `patch` will produce.
pub fn new_size(patch: &[u8]) -> Result<u64> {
    Patch::parse(patch).map(|p| p.new_size)
}

/// Apply `patch` to `old` (of size `old_size`), writing exactly the patch's
/// declared new size to `new`. Returns the number of bytes written. Bytes of
/// the diff stream that refer to positions outside of the old data are copied
/// unmodified.
pub fn bspatch(
    old: &mut (impl Read + Seek + ?Sized),
    old_size: u64,
    new: &mut (impl Write + ?Sized),
    patch: &[u8],
) -> Result<u64> {
    let mut patch = Patch::parse(patch)?;
    let new_size = patch.new_size;
    let old_end = i64::try_from(old_size).map_err(|_| Error::OldTooLarge(old_size))?;

    let mut diff_buf = vec![0u8; CHUNK_SIZE];
    let mut old_buf = vec![0u8; CHUNK_SIZE];
    let mut new_pos = 0u64;
    let mut old_pos = 0i64;

    while new_pos < new_size {
        let diff_len = patch.ctrl.read_offtin()?;
        let extra_len = patch.ctrl.read_offtin()?;
        let seek = patch.ctrl.read_offtin()?;

        let (Ok(diff_len), Ok(extra_len)) = (u64::try_from(diff_len), u64::try_from(extra_len))
        else {
            return Err(Error::InvalidControl(diff_len, extra_len, seek));
        };

        if new_pos
            .checked_add(diff_len)
            .is_none_or(|end| end > new_size)
        {
            return Err(Error::NewSizeExceeded(new_size));
        }

        let mut remaining = diff_len;
        while remaining > 0 {
            let n = remaining.min(CHUNK_SIZE as u64) as usize;
            let diff = &mut diff_buf[..n];
            patch.diff.read_exact(diff)?;

            // Portion of [old_pos, old_pos + n) that lies inside the old data.
            let start = old_pos.clamp(0, old_end) as u64;
            let end = old_pos.saturating_add(n as i64).clamp(0, old_end) as u64;

            if start < end {
                let skip = (start as i64 - old_pos) as usize;
                let len = (end - start) as usize;

                old.seek(SeekFrom::Start(start))?;
                old.read_exact(&mut old_buf[..len])?;

                for (d, o) in diff[skip..skip + len].iter_mut().zip(&old_buf[..len]) {
                    *d = d.wrapping_add(*o);
                }
            }

            new.write_all(diff)?;

            remaining -= n as u64;
            old_pos = old_pos.saturating_add(n as i64);
        }

        new_pos += diff_len;

        if new_pos
            .checked_add(extra_len)
            .is_none_or(|end| end > new_size)
        {
            return Err(Error::NewSizeExceeded(new_size));
        }

        let mut remaining = extra_len;
        while remaining > 0 {
            let n = remaining.min(CHUNK_SIZE as u64) as usize;
            let extra = &mut diff_buf[..n];
            patch.extra.read_exact(extra)?;
            new.write_all(extra)?;

            remaining -= n as u64;
        }

        new_pos += extra_len;
        old_pos = old_pos.saturating_add(seek);
    }

    Ok(new_pos)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Cursor;

    use assert_matches::assert_matches;
    use bzip2::{Compression as BzLevel, write::BzEncoder};

    use super::*;

    fn offtout(value: i64) -> [u8; 8] {
        let mut buf = value.unsigned_abs().to_le_bytes();
        if value < 0 {
            buf[7] |= 0x80;
        }
        buf
    }

    fn bz2(data: &[u8]) -> Vec<u8> {
        let mut encoder = BzEncoder::new(Vec::new(), BzLevel::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    /// Build a patch from explicit control triplets. Each triplet's diff
    /// bytes are computed against `old` so that applying the patch yields
    /// `new`. `brotli_extra` switches to BSDF2 with a brotli extra stream.
    pub(crate) fn make_patch(
        old: &[u8],
        new: &[u8],
        controls: &[(i64, i64, i64)],
        bsdf2: bool,
    ) -> Vec<u8> {
        let mut ctrl = vec![];
        let mut diff = vec![];
        let mut extra = vec![];
        let mut new_pos = 0usize;
        let mut old_pos = 0i64;

        for &(x, y, z) in controls {
            ctrl.extend_from_slice(&offtout(x));
            ctrl.extend_from_slice(&offtout(y));
            ctrl.extend_from_slice(&offtout(z));

            for i in 0..x as usize {
                let o = old_pos + i as i64;
                let base = if o >= 0 && (o as usize) < old.len() {
                    old[o as usize]
                } else {
                    0
                };
                diff.push(new[new_pos + i].wrapping_sub(base));
            }
            new_pos += x as usize;
            old_pos += x;

            extra.extend_from_slice(&new[new_pos..new_pos + y as usize]);
            new_pos += y as usize;
            old_pos += z;
        }

        let (magic, ctrl, diff, extra) = if bsdf2 {
            let mut brotli_extra = vec![];
            {
                let mut writer = brotli::CompressorWriter::new(&mut brotli_extra, 4096, 9, 22);
                writer.write_all(&extra).unwrap();
            }
            (*b"BSDF2\x01\x00\x02", bz2(&ctrl), diff, brotli_extra)
        } else {
            (*BSDIFF40_MAGIC, bz2(&ctrl), bz2(&diff), bz2(&extra))
        };

        let mut patch = vec![];
        patch.extend_from_slice(&magic);
        patch.extend_from_slice(&offtout(ctrl.len() as i64));
        patch.extend_from_slice(&offtout(diff.len() as i64));
        patch.extend_from_slice(&offtout(new.len() as i64));
        patch.extend_from_slice(&ctrl);
        patch.extend_from_slice(&diff);
        patch.extend_from_slice(&extra);
        patch
    }

    fn apply(old: &[u8], patch: &[u8]) -> Result<Vec<u8>> {
        let mut new = vec![];
        bspatch(&mut Cursor::new(old), old.len() as u64, &mut new, patch)?;
        Ok(new)
    }

    #[test]
    fn sign_magnitude() {
        for value in [0, 1, -1, 255, -256, i64::MAX, -i64::MAX] {
            assert_eq!(offtin(offtout(value)), value);
        }
        assert_eq!(offtin([0, 0, 0, 0, 0, 0, 0, 0x80]), 0);
    }

    #[test]
    fn apply_both_formats() {
        let old: Vec<u8> = (0..200_000u32).map(|i| (i % 241) as u8).collect();
        let mut new = old.clone();
        new[100..110].fill(7);
        new.extend_from_slice(b"appended tail");
        new.rotate_left(3);

        let controls = [
            (150_000, 5, 1000),
            (new.len() as i64 - 150_005 - 20, 20, -50),
        ];

        for bsdf2 in [false, true] {
            let patch = make_patch(&old, &new, &controls, bsdf2);
            assert_eq!(new_size(&patch).unwrap(), new.len() as u64);
            assert_eq!(apply(&old, &patch).unwrap(), new, "bsdf2 {bsdf2}");
        }
    }

    #[test]
    fn old_position_out_of_range() {
        let old = b"abcdef";
        let new = b"xyzxyzxyz";
        // Seek before the start so the first bytes have no old data.
        let controls = [(0, 0, -4), (9, 0, 0)];
        let patch = make_patch(old, new, &controls, false);

        assert_eq!(apply(old, &patch).unwrap(), new);
    }

    #[test]
    fn reject_unaddressable_old_size() {
        let patch = make_patch(b"abc", b"abc", &[(3, 0, 0)], false);
        let mut new = vec![];

        for old_size in [u64::MAX, i64::MAX as u64 + 1] {
            assert_matches!(
                bspatch(&mut Cursor::new(b"abc"), old_size, &mut new, &patch),
                Err(Error::OldTooLarge(s)) if s == old_size
            );
        }
        assert!(new.is_empty());

        // The largest representable size is fine as long as the reads that
        // actually happen succeed.
        bspatch(&mut Cursor::new(b"abc"), i64::MAX as u64, &mut new, &patch).unwrap();
        assert_eq!(new, b"abc");
    }

    #[test]
    fn reject_bad_patches() {
        assert_matches!(apply(b"", b"BSDIFF40"), Err(Error::TooSmall(8)));
        assert_matches!(apply(b"", &[0u8; 32]), Err(Error::UnknownMagic(_)));

        let mut bad_type = make_patch(b"a", b"a", &[(1, 0, 0)], true);
        bad_type[5] = 9;
        assert_matches!(apply(b"a", &bad_type), Err(Error::UnknownCompression(9)));

        let mut bad_size = make_patch(b"a", b"a", &[(1, 0, 0)], false);
        bad_size[24..32].copy_from_slice(&offtout(-1));
        assert_matches!(
            apply(b"a", &bad_size),
            Err(Error::InvalidHeader { field: "new_size", .. })
        );

        // Control entry larger than the declared new size.
        let mut overflow = make_patch(b"ab", b"ab", &[(2, 0, 0)], false);
        overflow[24..32].copy_from_slice(&offtout(1));
        assert_matches!(apply(b"ab", &overflow), Err(Error::NewSizeExceeded(1)));

        // Truncated diff stream.
        let patch = make_patch(b"abcd", b"abcd", &[(4, 0, 0)], false);
        assert!(apply(b"abcd", &patch[..patch.len() - 20]).is_err());
    }
}
