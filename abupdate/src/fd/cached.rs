// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{self, Read, Seek, SeekFrom, Write};

use num_traits::ToPrimitive;
use tracing::warn;

use crate::fd::{BlkIoctl, FileDescriptor};

/// Default write cache size.
pub const DEFAULT_CACHE_SIZE: usize = 1024 * 1024;

/// A descriptor that coalesces small sequential writes into a fixed-size
/// buffer. The buffered bytes always belong at the positions just before the
/// current offset, so the cache is written out before any operation that
/// observes or moves away from that position.
pub struct CachedFileDescriptor<F: FileDescriptor> {
    inner: F,
    cache: Vec<u8>,
    cache_size: usize,
    /// Logical offset, including the cached bytes.
    offset: u64,
}

impl<F: FileDescriptor> CachedFileDescriptor<F> {
    pub fn new(mut inner: F, cache_size: usize) -> io::Result<Self> {
        let offset = inner.stream_position()?;

        Ok(Self {
            inner,
            cache: Vec::with_capacity(cache_size),
            cache_size: cache_size.max(1),
            offset,
        })
    }

    pub fn get_ref(&self) -> &F {
        &self.inner
    }

    fn flush_cache(&mut self) -> io::Result<()> {
        if !self.cache.is_empty() {
            self.inner.write_all(&self.cache)?;
            self.cache.clear();
        }

        Ok(())
    }
}

impl<F: FileDescriptor> Drop for CachedFileDescriptor<F> {
    fn drop(&mut self) {
        if !self.cache.is_empty() {
            warn!(
                "Dropping cached descriptor with {} unwritten bytes",
                self.cache.len(),
            );

            if let Err(e) = self.flush_cache() {
                warn!("Failed to write out cached data: {e}");
            }
        }
    }
}

impl<F: FileDescriptor> Read for CachedFileDescriptor<F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.flush_cache()?;

        let n = self.inner.read(buf)?;
        self.offset += n as u64;

        Ok(n)
    }
}

impl<F: FileDescriptor> Write for CachedFileDescriptor<F> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = buf.len().min(self.cache_size - self.cache.len());
        self.cache.extend_from_slice(&buf[..n]);
        self.offset += n as u64;

        if self.cache.len() == self.cache_size {
            self.flush_cache()?;
        }

        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_cache()?;
        self.inner.flush()
    }
}

impl<F: FileDescriptor> Seek for CachedFileDescriptor<F> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(o) => Some(o),
            SeekFrom::Current(d) => self
                .offset
                .to_i64()
                .and_then(|o| o.checked_add(d))
                .and_then(|o| o.to_u64()),
            SeekFrom::End(_) => None,
        };

        // Seeking to where we already are keeps coalescing writes.
        if target == Some(self.offset) {
            return Ok(self.offset);
        }

        self.flush_cache()?;

        self.offset = match target {
            Some(o) => self.inner.seek(SeekFrom::Start(o))?,
            None if matches!(pos, SeekFrom::Current(_)) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "Seek offset out of range",
                ));
            }
            None => self.inner.seek(pos)?,
        };

        Ok(self.offset)
    }
}

impl<F: FileDescriptor> FileDescriptor for CachedFileDescriptor<F> {
    fn block_dev_size(&mut self) -> u64 {
        self.inner.block_dev_size()
    }

    fn blk_ioctl(&mut self, request: BlkIoctl, start: u64, length: u64) -> io::Result<()> {
        // Pending writes may overlap the range.
        self.flush_cache()?;
        self.inner.blk_ioctl(request, start, length)
    }

    fn close(&mut self) -> io::Result<()> {
        self.flush_cache()?;
        self.inner.close()
    }
}
