// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Uniform access to the devices an update reads from and writes to.
//!
//! Every descriptor is a plain [`Read`] + [`Write`] + [`Seek`] stream with a
//! few block device extras on top. Block device ioctls are capability tested:
//! an [`io::ErrorKind::Unsupported`] error means the device cannot do it and
//! the caller is expected to fall back to writing zeros.

use std::io::{self, Cursor, Read, Seek, Write};

pub mod cached;
pub mod fec;
#[cfg(all(feature = "mtd", target_os = "linux"))]
pub mod mtd;
pub mod raw;

pub use cached::CachedFileDescriptor;
pub use fec::FecFileDescriptor;
pub use raw::RawFileDescriptor;

/// Block device range requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlkIoctl {
    /// `BLKDISCARD`: the range may read back as anything afterwards.
    Discard,
    /// `BLKSECDISCARD`: like [`Self::Discard`], but the old data must be
    /// unrecoverable.
    SecureDiscard,
    /// `BLKZEROOUT`: the range reads back as zeros afterwards.
    ZeroOut,
}

pub trait FileDescriptor: Read + Write + Seek + Send {
    /// Size in bytes of the underlying block device, or 0 if it is not a block
    /// device.
    fn block_dev_size(&mut self) -> u64;

    /// Issue a block device range request. Returns
    /// [`io::ErrorKind::Unsupported`] if the device does not support it.
    fn blk_ioctl(&mut self, request: BlkIoctl, start: u64, length: u64) -> io::Result<()>;

    /// Write out all pending data and release the descriptor. No further
    /// operations are allowed afterwards.
    fn close(&mut self) -> io::Result<()>;
}

impl<F: FileDescriptor + ?Sized> FileDescriptor for Box<F> {
    fn block_dev_size(&mut self) -> u64 {
        (**self).block_dev_size()
    }

    fn blk_ioctl(&mut self, request: BlkIoctl, start: u64, length: u64) -> io::Result<()> {
        (**self).blk_ioctl(request, start, length)
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

/// In-memory device. Behaves like a block device that only supports
/// [`BlkIoctl::ZeroOut`].
impl FileDescriptor for Cursor<Vec<u8>> {
    fn block_dev_size(&mut self) -> u64 {
        self.get_ref().len() as u64
    }

    fn blk_ioctl(&mut self, request: BlkIoctl, start: u64, length: u64) -> io::Result<()> {
        if request != BlkIoctl::ZeroOut {
            return Err(unsupported(&format!("{request:?}")));
        }

        let data = self.get_mut();
        let range = usize::try_from(start)
            .ok()
            .zip(usize::try_from(length).ok())
            .and_then(|(s, l)| Some(s..s.checked_add(l)?))
            .filter(|r| r.end <= data.len())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "Range exceeds device size")
            })?;

        data[range].fill(0);

        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub(crate) fn unsupported(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Unsupported, format!("{what} is not supported"))
}

/// Best-effort trim of `[start, start + length)`: discard, then secure discard,
/// then zero out. Returns whether any of them succeeded.
pub fn discard_range(fd: &mut dyn FileDescriptor, start: u64, length: u64) -> bool {
    for request in [BlkIoctl::Discard, BlkIoctl::SecureDiscard, BlkIoctl::ZeroOut] {
        match fd.blk_ioctl(request, start, length) {
            Ok(()) => return true,
            Err(e) => tracing::debug!("{request:?} failed for {start}+{length}: {e}"),
        }
    }

    false
}
