// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Incremental SHA-256 whose intermediate state can be serialized and restored
//! later, possibly by a different process. [`ring::digest::Context`] cannot be
//! serialized, so the compression function is driven manually here.

use std::fmt;

use sha2::digest::{consts::U64, generic_array::GenericArray};
use thiserror::Error;

const BLOCK_SIZE: usize = 64;
const STATE_WORDS: usize = 8;

const INITIAL_STATE: [u32; STATE_WORDS] = [
    0x6a09e667, 0xbb67ae85, 0x3c6ef372, 0xa54ff53a, 0x510e527f, 0x9b05688c, 0x1f83d9ab, 0x5be0cd19,
];

/// Version prefix of the serialized context.
const CONTEXT_PREFIX: &str = "sha256:";

pub const SHA256_DIGEST_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Hash context has unknown prefix")]
    UnknownPrefix,
    #[error("Hash context has invalid length: {0}")]
    InvalidLength(usize),
    #[error("Hash context buffered {buffered} bytes, but total length implies {expected}")]
    InconsistentBuffer { buffered: usize, expected: usize },
    #[error("Hash context contains non-ASCII characters")]
    NotAscii,
    #[error("Hash context is not valid hex")]
    Hex(#[from] hex::FromHexError),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone)]
pub struct HashCalculator {
    state: [u32; STATE_WORDS],
    buffer: [u8; BLOCK_SIZE],
    buffer_len: usize,
    /// Total number of bytes hashed.
    length: u64,
    raw_hash: Option<[u8; SHA256_DIGEST_SIZE]>,
}

impl fmt::Debug for HashCalculator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HashCalculator")
            .field("length", &self.length)
            .field("raw_hash", &self.raw_hash.as_ref().map(hex::encode))
            .finish_non_exhaustive()
    }
}

impl Default for HashCalculator {
    fn default() -> Self {
        Self::new()
    }
}

impl HashCalculator {
    pub fn new() -> Self {
        Self {
            state: INITIAL_STATE,
            buffer: [0u8; BLOCK_SIZE],
            buffer_len: 0,
            length: 0,
            raw_hash: None,
        }
    }

    fn compress(state: &mut [u32; STATE_WORDS], block: &[u8]) {
        let block = GenericArray::<u8, U64>::from_slice(block);
        sha2::compress256(state, std::slice::from_ref(block));
    }

    /// Number of bytes hashed so far.
    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Feed more data into the hash. Has no effect after [`Self::finalize()`].
    pub fn update(&mut self, mut data: &[u8]) {
        if self.raw_hash.is_some() {
            return;
        }

        self.length += data.len() as u64;

        if self.buffer_len > 0 {
            let n = (BLOCK_SIZE - self.buffer_len).min(data.len());
            self.buffer[self.buffer_len..self.buffer_len + n].copy_from_slice(&data[..n]);
            self.buffer_len += n;
            data = &data[n..];

            if self.buffer_len < BLOCK_SIZE {
                return;
            }

            Self::compress(&mut self.state, &self.buffer);
            self.buffer_len = 0;
        }

        let mut blocks = data.chunks_exact(BLOCK_SIZE);
        for block in &mut blocks {
            Self::compress(&mut self.state, block);
        }

        let remainder = blocks.remainder();
        self.buffer[..remainder.len()].copy_from_slice(remainder);
        self.buffer_len = remainder.len();
    }

    /// Apply the final padding and compute the digest. Calling this more than
    /// once returns the same digest.
    pub fn finalize(&mut self) -> [u8; SHA256_DIGEST_SIZE] {
        if let Some(digest) = self.raw_hash {
            return digest;
        }

        let mut state = self.state;
        let mut block = [0u8; BLOCK_SIZE];
        block[..self.buffer_len].copy_from_slice(&self.buffer[..self.buffer_len]);
        block[self.buffer_len] = 0x80;

        if self.buffer_len + 1 > BLOCK_SIZE - 8 {
            Self::compress(&mut state, &block);
            block = [0u8; BLOCK_SIZE];
        }

        block[BLOCK_SIZE - 8..].copy_from_slice(&(self.length * 8).to_be_bytes());
        Self::compress(&mut state, &block);

        let mut digest = [0u8; SHA256_DIGEST_SIZE];
        for (chunk, word) in digest.chunks_exact_mut(4).zip(state) {
            chunk.copy_from_slice(&word.to_be_bytes());
        }

        self.raw_hash = Some(digest);

        digest
    }

    /// The digest computed by [`Self::finalize()`], if it was called.
    pub fn raw_hash(&self) -> Option<&[u8; SHA256_DIGEST_SIZE]> {
        self.raw_hash.as_ref()
    }

    /// Serialize the intermediate hashing state.
    pub fn context(&self) -> String {
        let mut result = String::with_capacity(CONTEXT_PREFIX.len() + 16 + 64 + 128);
        result.push_str(CONTEXT_PREFIX);
        result.push_str(&format!("{:016x}", self.length));
        for word in self.state {
            result.push_str(&format!("{word:08x}"));
        }
        result.push_str(&hex::encode(&self.buffer[..self.buffer_len]));

        result
    }

    /// Restore the intermediate hashing state produced by [`Self::context()`].
    /// On failure, the current state is left untouched.
    pub fn set_context(&mut self, context: &str) -> Result<()> {
        let data = context
            .strip_prefix(CONTEXT_PREFIX)
            .ok_or(Error::UnknownPrefix)?;

        // Slicing below is by byte offset.
        if !data.is_ascii() {
            return Err(Error::NotAscii);
        }

        if data.len() < 16 + 64 || data.len() > 16 + 64 + 2 * (BLOCK_SIZE - 1) {
            return Err(Error::InvalidLength(data.len()));
        }

        let mut length = [0u8; 8];
        hex::decode_to_slice(&data[..16], &mut length)?;
        let length = u64::from_be_bytes(length);

        let mut state_raw = [0u8; 4 * STATE_WORDS];
        hex::decode_to_slice(&data[16..80], &mut state_raw)?;

        let pending = hex::decode(&data[80..])?;
        let expected = (length % BLOCK_SIZE as u64) as usize;
        if pending.len() != expected {
            return Err(Error::InconsistentBuffer {
                buffered: pending.len(),
                expected,
            });
        }

        for (word, chunk) in self.state.iter_mut().zip(state_raw.chunks_exact(4)) {
            *word = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        self.buffer[..pending.len()].copy_from_slice(&pending);
        self.buffer_len = pending.len();
        self.length = length;
        self.raw_hash = None;

        Ok(())
    }

    /// One-shot SHA-256 of `data`.
    pub fn raw_hash_of_data(data: &[u8]) -> [u8; SHA256_DIGEST_SIZE] {
        let digest = ring::digest::digest(&ring::digest::SHA256, data);
        let mut result = [0u8; SHA256_DIGEST_SIZE];
        result.copy_from_slice(digest.as_ref());
        result
    }
}

#[cfg(test)]
mod tests {
    use rand::{RngCore, SeedableRng, rngs::StdRng};

    use super::*;

    #[test]
    fn matches_ring() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut data = vec![0u8; 1000];
        rng.fill_bytes(&mut data);

        for size in [0, 1, 55, 56, 63, 64, 65, 119, 120, 128, 1000] {
            let mut hasher = HashCalculator::new();
            for chunk in data[..size].chunks(7) {
                hasher.update(chunk);
            }

            assert_eq!(
                hasher.finalize(),
                HashCalculator::raw_hash_of_data(&data[..size]),
                "size {size}",
            );
        }
    }

    #[test]
    fn context_round_trip() {
        let data = b"The quick brown fox jumps over the lazy dog, repeatedly, until \
            the block buffer has some pending bytes in it.";

        for split in [0, 1, 63, 64, 65, data.len()] {
            let mut first = HashCalculator::new();
            first.update(&data[..split]);

            let mut second = HashCalculator::new();
            second.set_context(&first.context()).unwrap();
            assert_eq!(second.len(), split as u64);
            second.update(&data[split..]);

            assert_eq!(second.finalize(), HashCalculator::raw_hash_of_data(data));
        }
    }

    #[test]
    fn reject_bad_context() {
        let mut hasher = HashCalculator::new();
        hasher.update(b"foo");
        let before = hasher.context();

        assert!(matches!(
            hasher.set_context("md5:"),
            Err(Error::UnknownPrefix)
        ));
        assert!(matches!(
            hasher.set_context("sha256:1234"),
            Err(Error::InvalidLength(4))
        ));

        // Length says 3 pending bytes, but only 1 present.
        let truncated = &before[..before.len() - 4];
        assert!(matches!(
            hasher.set_context(truncated),
            Err(Error::InconsistentBuffer {
                buffered: 1,
                expected: 3,
            })
        ));

        assert_eq!(hasher.context(), before);
    }

    #[test]
    fn reject_non_ascii_context() {
        let mut hasher = HashCalculator::new();
        hasher.update(b"foo");
        let before = hasher.context();

        // 'é' is two bytes, so a byte offset lands mid-character.
        let context = format!("sha256:a{}", "é".repeat(40));
        assert!(matches!(hasher.set_context(&context), Err(Error::NotAscii)));

        let mut context = before.clone();
        context.push('é');
        assert!(matches!(hasher.set_context(&context), Err(Error::NotAscii)));

        assert_eq!(hasher.context(), before);
    }

    #[test]
    fn finalize_is_sticky() {
        let mut hasher = HashCalculator::new();
        hasher.update(b"foo");
        let digest = hasher.finalize();
        hasher.update(b"bar");

        assert_eq!(hasher.finalize(), digest);
        assert_eq!(hasher.raw_hash(), Some(&digest));
    }
}
