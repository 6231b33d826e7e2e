// SPDX-FileCopyrightText: 2023-2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io::{self, Read, Seek, SeekFrom, Write};

use num_traits::ToPrimitive;
use thiserror::Error;

use crate::format::verityrs::{self, RsCodec};

// Not to be confused with the 255-byte RS block size.
pub const FEC_BLOCK_SIZE: u32 = 4096;

const FEC_MAX_BLOCK_SIZE: u32 = 16384;

#[derive(Debug, Error)]
pub enum Error {
    #[error("FEC with parity byte count of {0} is not supported")]
    UnsupportedParity(u8),
    #[error("Cannot calculate FEC for empty data")]
    InputEmpty,
    #[error("Input size ({input}) is not a multiple of FEC block size ({block})")]
    NotBlockAligned { input: u64, block: u32 },
    #[error("Round {0} is out of bounds")]
    RoundOutOfBounds(u64),
    #[error("Cannot repair data due to too many errors")]
    TooManyErrors,
    #[error("{0:?} field is out of bounds")]
    FieldOutOfBounds(&'static str),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// A small wrapper around a byte array to represent a single Reed-Solomon
/// codeword for any `RS(255, K)`.
struct Codeword {
    data: [u8; 255],
    rs_k: u8,
}

impl Codeword {
    fn new(rs_k: u8) -> Self {
        Self {
            data: [0u8; 255],
            rs_k,
        }
    }

    fn data(&self) -> &[u8] {
        &self.data[..usize::from(self.rs_k)]
    }

    fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data[..usize::from(self.rs_k)]
    }

    fn parity(&self) -> &[u8] {
        &self.data[usize::from(self.rs_k)..]
    }

    fn parity_mut(&mut self) -> &mut [u8] {
        &mut self.data[usize::from(self.rs_k)..]
    }

    fn all_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// FEC generation and error correction for a specific file size and Reed
/// Solomon configuration, using dm-verity's interleaving access pattern.
///
/// Place the file offsets in a two-dimensional grid. When reading a 2072576
/// byte file for calculating RS(255, 253):
///
/// ```text
///      | <-------- Round 0 --------> | <-------- Round 1 --------> |
///      |-----------------------------|-----------------------------|
///  ^   | 0       1       ... 4095    | 4096    4097    ... 8191    |
///  |   | 8192    8192    ... 12287   | 12288   12289   ... 16383   |
/// rs_k | 16384   16385   ... 20479   | 20480   20481   ... 24575   |
///  |   | ....... ....... ... ....... | ....... ....... ... ....... |
///  v   | 2064384 2064385 ... 2068479 | 2068480 2068481 ... 2072575 |
/// ```
///
/// Each column is `rs_k` items tall and forms the data portion of one RS
/// codeword. File block `b` therefore lives in round `b % rounds`, at row
/// `b / rounds`. Offsets past the end of the file read as `\0`.
///
/// Everything runs on the calling thread. Correction works one round at a
/// time, which bounds memory use to `rs_k` blocks.
#[derive(Clone, Debug)]
pub struct Fec {
    file_size: u64,
    block_size: u32,
    rs_k: u8,
    rounds: u64,
}

impl Fec {
    pub fn new(file_size: u64, block_size: u32, parity: u8) -> Result<Self> {
        if file_size == 0 {
            return Err(Error::InputEmpty);
        } else if file_size % u64::from(block_size) != 0 {
            return Err(Error::NotBlockAligned {
                input: file_size,
                block: block_size,
            });
        } else if block_size > FEC_MAX_BLOCK_SIZE {
            return Err(Error::FieldOutOfBounds("block_size"));
        }

        let rs_k = 255u8
            .checked_sub(parity)
            .ok_or(Error::UnsupportedParity(parity))?;
        if !verityrs::CODECS.contains_key(&rs_k) {
            return Err(Error::UnsupportedParity(parity));
        }

        let blocks = file_size.div_ceil(u64::from(block_size));
        let rounds = blocks.div_ceil(u64::from(rs_k));

        // Check upfront so we don't need to do checked multiplication later.
        rounds
            .checked_mul(u64::from(parity))
            .and_then(|s| s.checked_mul(u64::from(block_size)))
            .and_then(|s| s.to_usize())
            .ok_or(Error::FieldOutOfBounds("fec_data_size"))?;
        rounds
            .checked_mul(u64::from(rs_k))
            .and_then(|s| s.checked_mul(u64::from(block_size)))
            .ok_or(Error::FieldOutOfBounds("fec_grid_size"))?;

        Ok(Self {
            file_size,
            block_size,
            rs_k,
            rounds,
        })
    }

    fn codec(&self) -> &'static RsCodec {
        &verityrs::CODECS[&self.rs_k]
    }

    /// Get the number of parity bytes per codeword.
    #[inline]
    pub fn parity(&self) -> u8 {
        255 - self.rs_k
    }

    #[inline]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    #[inline]
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Size of the FEC data for a single round.
    #[inline]
    fn round_fec_size(&self) -> usize {
        usize::from(self.parity()) * self.block_size as usize
    }

    /// Get the size of the FEC data needed to cover the entire file.
    #[inline]
    pub fn fec_size(&self) -> u64 {
        self.rounds * self.round_fec_size() as u64
    }

    /// The round and row in which file block `block` is stored.
    #[inline]
    pub fn locate_block(&self, block: u64) -> (u64, usize) {
        (block % self.rounds, (block / self.rounds) as usize)
    }

    /// Get the backing file offset for the specified `offset` in the
    /// interleaved view.
    fn backing_offset(&self, offset: u64) -> u64 {
        let rs_k = u64::from(self.rs_k);

        offset / rs_k + offset % rs_k * self.rounds * u64::from(self.block_size)
    }

    /// Read a raw sequential block from the backing file, starting at offset
    /// `offset` in the interleaved view. This reads a horizontal block-aligned
    /// slice in the file offset grid.
    fn read_seq_block(
        &self,
        mut reader: impl Read + Seek,
        offset: u64,
        buf: &mut [u8],
    ) -> io::Result<()> {
        let backing_offset = self.backing_offset(offset);

        // Out of bounds offsets are treated as if they contain zeros.
        if backing_offset >= self.file_size {
            buf.fill(0);
        } else {
            reader.seek(SeekFrom::Start(backing_offset))?;
            reader.read_exact(buf)?;
        }

        Ok(())
    }

    /// Read the nth round from the file. The data is laid out sequentially
    /// (row-by-row).
    fn read_round(&self, mut reader: impl Read + Seek, round: u64) -> io::Result<Vec<u8>> {
        let mut grid = vec![0u8; usize::from(self.rs_k) * self.block_size as usize];

        for (row, row_slice) in grid.chunks_exact_mut(self.block_size as usize).enumerate() {
            let interleaved_offset =
                round * u64::from(self.rs_k) * u64::from(self.block_size) + row as u64;

            self.read_seq_block(&mut reader, interleaved_offset, row_slice)?;
        }

        Ok(grid)
    }

    /// Get the nth RS codeword from a round's grid.
    fn get_codeword(&self, grid: &[u8], column: usize) -> Codeword {
        let mut codeword = Codeword::new(self.rs_k);
        let data = codeword.data_mut();

        for (row, byte) in data.iter_mut().enumerate() {
            *byte = grid[row * self.block_size as usize + column];
        }

        codeword
    }

    /// Put the nth RS codeword into a round's grid.
    fn put_codeword(&self, grid: &mut [u8], column: usize, codeword: &Codeword) {
        for (row, byte) in codeword.data().iter().enumerate() {
            grid[row * self.block_size as usize + column] = *byte;
        }
    }

    /// Generate FEC data for a single round.
    fn generate_one_round(
        &self,
        reader: impl Read + Seek,
        round: u64,
        fec: &mut [u8],
    ) -> Result<()> {
        let grid = self.read_round(reader, round)?;
        let encode = self.codec().encode;
        let parity = usize::from(self.parity());

        for (column, buf) in fec.chunks_exact_mut(parity).enumerate() {
            let mut codeword = self.get_codeword(&grid, column);
            encode(codeword.all_mut());
            buf.copy_from_slice(codeword.parity());
        }

        Ok(())
    }

    /// Generate FEC data for the whole file, streaming one round at a time to
    /// `writer`. Exactly [`Self::fec_size()`] bytes are written.
    pub fn generate(&self, mut reader: impl Read + Seek, mut writer: impl Write) -> Result<()> {
        let mut buf = vec![0u8; self.round_fec_size()];

        for round in 0..self.rounds {
            self.generate_one_round(&mut reader, round, &mut buf)?;
            writer.write_all(&buf)?;
        }

        Ok(())
    }

    /// Read and correct a single round. `fec` is that round's slice of the FEC
    /// data. Returns the corrected grid and the number of corrected bytes.
    ///
    /// Errors are corrected at unknown locations only. Up to `parity / 2`
    /// bytes per codeword can be repaired.
    pub fn repair_round(
        &self,
        reader: impl Read + Seek,
        round: u64,
        fec: &[u8],
    ) -> Result<(Vec<u8>, u64)> {
        if round >= self.rounds {
            return Err(Error::RoundOutOfBounds(round));
        } else if fec.len() != self.round_fec_size() {
            return Err(Error::FieldOutOfBounds("fec"));
        }

        let mut grid = self.read_round(reader, round)?;
        let codec = self.codec();
        let parity = usize::from(self.parity());
        let mut num_corrected = 0;

        for (column, buf) in fec.chunks_exact(parity).enumerate() {
            let mut codeword = self.get_codeword(&grid, column);
            codeword.parity_mut().copy_from_slice(buf);

            if (codec.is_correct)(codeword.all_mut()) {
                continue;
            }

            let n = (codec.correct_errors)(codeword.all_mut()).ok_or(Error::TooManyErrors)?;
            if n > 0 {
                self.put_codeword(&mut grid, column, &codeword);
            }

            num_corrected += n as u64;
        }

        Ok((grid, num_corrected))
    }

    /// Offset of a round's parity within the FEC data.
    #[inline]
    pub fn round_fec_range(&self, round: u64) -> std::ops::Range<u64> {
        let size = self.round_fec_size() as u64;
        round * size..(round + 1) * size
    }
}
