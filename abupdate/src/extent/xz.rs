// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use liblzma::stream::{Action, Status, Stream};

use super::{Error, ExtentSink, Result};

const OUTPUT_BUFFER_SIZE: usize = 16384;

/// Large enough for any dictionary size used by the payload generator.
const MEMORY_LIMIT: u64 = 64 * 1024 * 1024;

/// Decompresses an XZ stream that arrives in arbitrarily sized chunks. Both
/// single and multi-block streams are supported.
pub struct XzExtentWriter<W: ExtentSink> {
    inner: W,
    stream: Stream,
    input: Vec<u8>,
    output: Box<[u8]>,
    stream_end: bool,
}

impl<W: ExtentSink> XzExtentWriter<W> {
    pub fn new(inner: W) -> Result<Self> {
        Ok(Self {
            inner,
            stream: Stream::new_stream_decoder(MEMORY_LIMIT, 0)?,
            input: Vec::new(),
            output: vec![0u8; OUTPUT_BUFFER_SIZE].into_boxed_slice(),
            stream_end: false,
        })
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.input.extend_from_slice(data);

        if self.stream_end {
            return Ok(());
        }

        let mut consumed = 0;

        loop {
            let before_in = self.stream.total_in();
            let before_out = self.stream.total_out();

            let status =
                self.stream
                    .process(&self.input[consumed..], &mut self.output, Action::Run)?;

            let n_in = (self.stream.total_in() - before_in) as usize;
            let n_out = (self.stream.total_out() - before_out) as usize;
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
