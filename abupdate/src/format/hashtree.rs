// SPDX-FileCopyrightText: 2023-2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! dm-verity hash tree generation.

use std::{
    io::{self, Cursor, Read},
    ops::Range,
};

use ring::digest::{Algorithm, Context};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Hashing algorithm not supported: {0:?}")]
    UnsupportedHashAlgorithm(String),
    #[error("{0:?} field is out of bounds")]
    FieldOutOfBounds(&'static str),
    #[error("Expected root digest {expected}, but have {actual}")]
    InvalidRootDigest { expected: String, actual: String },
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Look up a hash tree algorithm by its manifest name. An empty name means
/// the default of SHA-1.
pub fn ring_algorithm(name: &str) -> Result<&'static Algorithm> {
    match name {
        "" | "sha1" => Ok(&ring::digest::SHA1_FOR_LEGACY_USE_ONLY),
        "sha256" => Ok(&ring::digest::SHA256),
        _ => Err(Error::UnsupportedHashAlgorithm(name.to_owned())),
    }
}

pub struct HashTree {
    block_size: u32,
    salted_context: Context,
}

impl HashTree {
    pub fn new(block_size: u32, algorithm: &'static Algorithm, salt: &[u8]) -> Self {
        let mut salted_context = Context::new(algorithm);
        salted_context.update(salt);

        Self {
            block_size,
            salted_context,
        }
    }

    fn digest_size(&self) -> usize {
        self.salted_context
            .algorithm()
            .output_len()
            .next_power_of_two()
    }

    /// Compute the list of offset ranges that each level occupies in the hash
    /// tree data. The items are returned with the bottom level's offsets first
    /// in the list. Note that the bottom level is stored at the end of the hash
    /// tree data.
    pub fn compute_level_offsets(&self, image_size: u64) -> Result<Vec<Range<usize>>> {
        let block_size = u64::from(self.block_size);
        let mut ranges = vec![];
        let mut level_size = image_size;

        while level_size > block_size {
            let blocks = level_size.div_ceil(block_size);
            level_size = blocks
                .checked_mul(self.digest_size() as u64)
                .and_then(|s| s.checked_next_multiple_of(block_size))
                .ok_or(Error::FieldOutOfBounds("level_size"))?;

            let level_size =
                usize::try_from(level_size).map_err(|_| Error::FieldOutOfBounds("level_size"))?;

            ranges.push(0..level_size);
        }

        // The hash tree puts the leaves at the end.
        let mut offset = 0;
        for range in ranges.iter_mut().rev() {
            let level_size = range.end - range.start;
            range.start += offset;
            range.end += offset;
            offset += level_size;
        }

        Ok(ranges)
    }

    /// Total size of the hash tree for an image.
    pub fn tree_size(&self, image_size: u64) -> Result<u64> {
        let offsets = self.compute_level_offsets(image_size)?;

        Ok(offsets.first().map_or(0, |r| r.end as u64))
    }

    /// Hash `size` bytes of `reader` block by block into `level_data`. A
    /// partial final block is zero padded.
    fn hash_level(&self, mut reader: impl Read, mut size: u64, mut level_data: &mut [u8]) -> io::Result<()> {
        let output_len = self.salted_context.algorithm().output_len();
        let digest_padding = self.digest_size() - output_len;
        let mut buf = vec![0u8; self.block_size as usize];

        while size > 0 {
            let n = size.min(buf.len() as u64) as usize;
            reader.read_exact(&mut buf[..n])?;
            buf[n..].fill(0);

            let mut context = self.salted_context.clone();
            context.update(&buf);
            let digest = context.finish();

            level_data[..output_len].copy_from_slice(digest.as_ref());
            level_data[output_len..output_len + digest_padding].fill(0);
            level_data = &mut level_data[output_len + digest_padding..];

            size -= n as u64;
        }

        Ok(())
    }

    /// Generate the hash tree for the first `image_size` bytes of `input`.
    /// Returns the root digest and the hash tree data.
    pub fn generate(&self, mut input: impl Read, image_size: u64) -> Result<(Vec<u8>, Vec<u8>)> {
        let offsets = self.compute_level_offsets(image_size)?;
        let tree_size = offsets.first().map_or(0, |r| r.end);
        let mut tree = vec![0u8; tree_size];

        // Small images are hashed directly.
        if offsets.is_empty() {
            let mut buf = vec![0u8; image_size as usize];
            input.read_exact(&mut buf)?;

            let mut context = self.salted_context.clone();
            context.update(&buf);

            return Ok((context.finish().as_ref().to_vec(), tree));
        }

        for (i, level_range) in offsets.iter().enumerate() {
            let (front, back) = tree.split_at_mut(level_range.end);
            let level_data = &mut front[level_range.clone()];

            if i == 0 {
                self.hash_level(&mut input, image_size, level_data)?;
            } else {
                // The previous level sits directly after this one.
                let prev = &offsets[i - 1];
                let prev_size = prev.end - prev.start;

                self.hash_level(Cursor::new(&back[..prev_size]), prev_size as u64, level_data)?;
            }
        }

        let mut context = self.salted_context.clone();
        if let Some(top) = offsets.last() {
            context.update(&tree[top.clone()]);
        }

        Ok((context.finish().as_ref().to_vec(), tree))
    }

    /// Check the image against a known root digest.
    pub fn verify(&self, input: impl Read, image_size: u64, root_digest: &[u8]) -> Result<()> {
        let (actual, _) = self.generate(input, image_size)?;

        if actual != root_digest {
            return Err(Error::InvalidRootDigest {
                expected: hex::encode(root_digest),
                actual: hex::encode(&actual),
            });
        }

        Ok(())
    }
}
