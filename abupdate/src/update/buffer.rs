// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use crate::{hash::HashCalculator, util::NumBytes};

/// Payload bytes that have been received but not yet consumed.
///
/// Every byte passes through exactly one [`Self::discard()`] call, which is
/// where it gets hashed. The offset counts discarded bytes of the data section
/// (everything after the metadata signature).
#[derive(Clone, Debug, Default)]
pub struct PayloadBuffer {
    data: Vec<u8>,
    offset: u64,
    payload_hash: HashCalculator,
    signed_hash: HashCalculator,
}

impl PayloadBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Offset within the data section of the first buffered byte.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Move bytes from the front of `input` until the buffer holds
    /// `target_len` bytes or `input` runs out. Returns the number of bytes
    /// moved.
    pub fn fill(&mut self, input: &mut &[u8], target_len: usize) -> usize {
        let n = target_len.saturating_sub(self.data.len()).min(input.len());

        self.data.extend_from_slice(&input[..n]);
        *input = &input[n..];

        n
    }

    /// Hash and drop all buffered bytes. Only the first `signed_len` bytes are
    /// included in the signed hash. The offset is only advanced if
    /// `advance_offset` is set, which is the case for everything except the
    /// metadata.
    pub fn discard(&mut self, advance_offset: bool, signed_len: usize) {
        if advance_offset {
            self.offset += self.data.len() as u64;
        }

        self.payload_hash.update(&self.data);
        self.signed_hash
            .update(&self.data[..signed_len.min(self.data.len())]);

        tracing::trace!(
            "Discarded {:?}; offset is now {}",
            NumBytes(self.data.len()),
            self.offset,
        );

        self.data = Vec::new();
    }

    /// Hash of every discarded byte.
    pub fn payload_hash(&mut self) -> &mut HashCalculator {
        &mut self.payload_hash
    }

    /// Hash of the bytes covered by the payload signature.
    pub fn signed_hash(&mut self) -> &mut HashCalculator {
        &mut self.signed_hash
    }

    /// Continue from a checkpoint. The buffer must be empty.
    pub fn restore(&mut self, offset: u64, payload_hash: HashCalculator, signed_hash: HashCalculator) {
        debug_assert!(self.data.is_empty());

        self.offset = offset;
        self.payload_hash = payload_hash;
        self.signed_hash = signed_hash;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_and_discard() {
        let mut buffer = PayloadBuffer::new();
        let mut input = &b"metadataBLOBsig"[..];

        assert_eq!(buffer.fill(&mut input, 8), 8);
        assert_eq!(buffer.fill(&mut input, 8), 0);
        assert_eq!(buffer.data(), b"metadata");

        // Metadata does not advance the data offset.
        buffer.discard(false, 8);
        assert_eq!(buffer.offset(), 0);
        assert!(buffer.is_empty());

        assert_eq!(buffer.fill(&mut input, 4), 4);
        buffer.discard(true, 4);
        assert_eq!(buffer.offset(), 4);

        // Signature is not part of the signed hash.
        assert_eq!(buffer.fill(&mut input, 100), 3);
        assert!(input.is_empty());
        buffer.discard(true, 0);
        assert_eq!(buffer.offset(), 7);

        assert_eq!(
            buffer.payload_hash().finalize(),
            HashCalculator::raw_hash_of_data(b"metadataBLOBsig"),
        );
        assert_eq!(
            buffer.signed_hash().finalize(),
            HashCalculator::raw_hash_of_data(b"metadataBLOB"),
        );
    }
}
