// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use bzip2::{Decompress, Status};

use super::{Error, ExtentSink, Result};

const OUTPUT_BUFFER_SIZE: usize = 16384;

/// Decompresses a bzip2 stream that arrives in arbitrarily sized chunks.
/// Input that the decompressor could not consume yet is carried over to the
/// next [`Self::write()`] call.
pub struct BzipExtentWriter<W: ExtentSink> {
    inner: W,
    decompress: Decompress,
    input: Vec<u8>,
    output: Box<[u8]>,
    stream_end: bool,
}

impl<W: ExtentSink> BzipExtentWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            decompress: Decompress::new(false),
            input: Vec::new(),
            output: vec![0u8; OUTPUT_BUFFER_SIZE].into_boxed_slice(),
            stream_end: false,
        }
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.input.extend_from_slice(data);

        // Anything after the end marker is reported by finish().
        if self.stream_end {
            return Ok(());
        }

        let mut consumed = 0;

        loop {
            let before_in = self.decompress.total_in();
            let before_out = self.decompress.total_out();

            let status = self
                .decompress
                .decompress(&self.input[consumed..], &mut self.output)?;

            let n_in = (self.decompress.total_in() - before_in) as usize;
            let n_out = (self.decompress.total_out() - before_out) as usize;
            consumed += n_in;

            if n_out > 0 {
                self.inner.write_all(&self.output[..n_out])?;
            }

            if status == Status::StreamEnd {
                self.stream_end = true;
                break;
            } else if (n_in == 0 && n_out == 0)
                || (consumed == self.input.len() && n_out < self.output.len())
            {
                break;
            }
        }

        self.input.drain(..consumed);

        Ok(())
    }

    /// Ensure that the stream ended and every input byte was used.
    pub fn finish(self) -> Result<W> {
        if !self.stream_end {
            return Err(Error::StreamNotFinished);
        } else if !self.input.is_empty() {
            return Err(Error::TrailingData(self.input.len()));
        }

        Ok(self.inner)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;
    use bzip2::{Compression, write::BzEncoder};
    use rand::{Rng, SeedableRng, rngs::StdRng};

    use super::*;

    fn compress(data: &[u8]) -> Vec<u8> {
        let mut encoder = BzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn sample() -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(0x627a);
        // Low entropy so that output is much larger than input.
        (0..200_000).map(|_| rng.gen_range(b'a'..=b'd')).collect()
    }

    #[test]
    fn chunked_input() {
        let data = sample();
        let compressed = compress(&data);

        for chunk_size in [1, 7, 4096, compressed.len()] {
            let mut writer = BzipExtentWriter::new(Vec::new());
            for chunk in compressed.chunks(chunk_size) {
                writer.write(chunk).unwrap();
            }

            assert_eq!(writer.finish().unwrap(), data, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn truncated_stream() {
        let compressed = compress(&sample());

        let mut writer = BzipExtentWriter::new(Vec::new());
        writer.write(&compressed[..compressed.len() - 10]).unwrap();
        assert_matches!(writer.finish(), Err(Error::StreamNotFinished));
    }

    #[test]
    fn trailing_data() {
        let mut compressed = compress(b"hello");
        compressed.extend_from_slice(b"junk");

        let mut writer = BzipExtentWriter::new(Vec::new());
        writer.write(&compressed).unwrap();
        assert_matches!(writer.finish(), Err(Error::TrailingData(4)));
    }

    #[test]
    fn corrupt_stream() {
        let mut writer = BzipExtentWriter::new(Vec::new());
        assert_matches!(writer.write(b"BZh9garbagegarbage"), Err(Error::Bzip2(_)));
    }
}
