// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{self, Read, Seek, SeekFrom, Write};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    fd::{BlkIoctl, FileDescriptor},
    format::fec::{self, FEC_BLOCK_SIZE, Fec},
};

/// Where the Reed-Solomon parity of a partition lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FecLayout {
    /// Number of bytes protected by the parity, starting at offset 0.
    pub data_size: u64,
    /// Offset of the parity data within the partition.
    pub fec_offset: u64,
    /// Parity bytes per 255-byte codeword.
    pub roots: u8,
}

/// A read-only descriptor that returns error-corrected data.
///
/// Reads are served one block at a time. The whole round containing the block
/// is read and corrected, then kept around since sequential reads of
/// neighboring blocks in the same round are common for small partitions.
pub struct FecFileDescriptor<F> {
    inner: F,
    fec: Fec,
    layout: FecLayout,
    pos: u64,
    round_cache: Option<(u64, Vec<u8>)>,
    corrected: u64,
}

impl<F: Read + Seek> FecFileDescriptor<F> {
    pub fn new(inner: F, layout: FecLayout) -> Result<Self, fec::Error> {
        let fec = Fec::new(layout.data_size, FEC_BLOCK_SIZE, layout.roots)?;

        Ok(Self {
            inner,
            fec,
            layout,
            pos: 0,
            round_cache: None,
            corrected: 0,
        })
    }

    /// Total number of bytes that had to be corrected so far.
    pub fn corrected_bytes(&self) -> u64 {
        self.corrected
    }

    fn load_round(&mut self, round: u64) -> io::Result<&[u8]> {
        let cached = matches!(&self.round_cache, Some((r, _)) if *r == round);

        if !cached {
            let range = self.fec.round_fec_range(round);
            let mut parity = vec![0u8; (range.end - range.start) as usize];
            self.inner
                .seek(SeekFrom::Start(self.layout.fec_offset + range.start))?;
            self.inner.read_exact(&mut parity)?;

            let (grid, corrected) = self
                .fec
                .repair_round(&mut self.inner, round, &parity)
                .map_err(|e| match e {
                    fec::Error::Io(e) => e,
                    e => io::Error::new(io::ErrorKind::InvalidData, e),
                })?;

            if corrected > 0 {
                warn!("Corrected {corrected} bytes in FEC round {round}");
                self.corrected += corrected;
            } else {
                debug!("FEC round {round} has no errors");
            }

            self.round_cache = Some((round, grid));
        }

        Ok(self
            .round_cache
            .as_ref()
            .map_or(&[] as &[u8], |(_, grid)| grid.as_slice()))
    }
}

impl<F: Read + Seek> Read for FecFileDescriptor<F> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.layout.data_size || buf.is_empty() {
            return Ok(0);
        }

        let block_size = u64::from(FEC_BLOCK_SIZE);
        let (round, row) = self.fec.locate_block(self.pos / block_size);
        let in_block = (self.pos % block_size) as usize;
        let n = buf
            .len()
            .min(block_size as usize - in_block)
            .min((self.layout.data_size - self.pos) as usize);

        let grid = self.load_round(round)?;
        let start = row * block_size as usize + in_block;
        buf[..n].copy_from_slice(&grid[start..start + n]);

        self.pos += n as u64;

        Ok(n)
    }
}

impl<F> Write for FecFileDescriptor<F> {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "Error-corrected descriptors are read-only",
        ))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<F> Seek for FecFileDescriptor<F> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(o) => Some(o),
            SeekFrom::End(o) => self.layout.data_size.checked_add_signed(o),
            SeekFrom::Current(o) => self.pos.checked_add_signed(o),
        };

        self.pos = new_pos.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "Offset would be before the start of the file",
            )
        })?;

        Ok(self.pos)
    }
}

impl<F: Read + Seek + Send> FileDescriptor for FecFileDescriptor<F> {
    fn block_dev_size(&mut self) -> u64 {
        self.layout.data_size
    }

    fn blk_ioctl(&mut self, _request: BlkIoctl, _start: u64, _length: u64) -> io::Result<()> {
        Err(super::unsupported("Block ioctl on an error-corrected descriptor"))
    }

    fn close(&mut self) -> io::Result<()> {
        self.round_cache = None;
        Ok(())
    }
}
