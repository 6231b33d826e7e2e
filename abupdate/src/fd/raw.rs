// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use tracing::debug;

use crate::{
    fd::{BlkIoctl, FileDescriptor},
    stream,
};

#[cfg(target_os = "linux")]
mod blk {
    use std::{ffi::c_int, fs::File, io};

    use rustix::ioctl::{Getter, Opcode, Setter, ioctl, opcode};

    // <linux/fs.h>
    const BLKROSET: Opcode = opcode::none(0x12, 93);
    const BLKGETSIZE64: Opcode = opcode::read::<usize>(0x12, 114);
    pub const BLKDISCARD: Opcode = opcode::none(0x12, 119);
    pub const BLKSECDISCARD: Opcode = opcode::none(0x12, 125);
    pub const BLKZEROOUT: Opcode = opcode::none(0x12, 127);

    pub fn get_size64(file: &File) -> io::Result<u64> {
        // SAFETY: BLKGETSIZE64 writes a single u64.
        let size = unsafe { ioctl(file, Getter::<BLKGETSIZE64, u64>::new())? };

        Ok(size)
    }

    pub fn set_read_only(file: &File, read_only: bool) -> io::Result<()> {
        // SAFETY: BLKROSET reads a single int.
        unsafe { ioctl(file, Setter::<BLKROSET, c_int>::new(read_only.into()))? };

        Ok(())
    }

    /// Issue one of the `(start, length)` range requests.
    pub fn range<const OPCODE: Opcode>(file: &File, start: u64, length: u64) -> io::Result<()> {
        // SAFETY: The range requests read exactly two u64 values.
        unsafe { ioctl(file, Setter::<OPCODE, [u64; 2]>::new([start, length]))? };

        Ok(())
    }
}

/// A descriptor backed directly by a file or block device. Reads and writes
/// are transparently retried when interrupted by a signal.
pub struct RawFileDescriptor {
    file: Option<File>,
    path: PathBuf,
    writable: bool,
}

impl RawFileDescriptor {
    /// Open `path` read-only or read-write. Writable descriptors are opened
    /// with `O_DSYNC` unless `interactive` is set, trading durability of each
    /// write for speed when a user is waiting on the result.
    pub fn open(path: &Path, writable: bool, interactive: bool) -> io::Result<Self> {
        set_block_device_read_only(path, !writable);

        let mut options = OpenOptions::new();
        options.read(true).write(writable);

        #[cfg(unix)]
        if writable && !interactive {
            use std::os::unix::fs::OpenOptionsExt;

            options.custom_flags(libc::O_DSYNC);
        }
        #[cfg(not(unix))]
        let _ = interactive;

        let file = options.open(path)?;

        Ok(Self {
            file: Some(file),
            path: path.to_owned(),
            writable,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&mut self) -> io::Result<&mut File> {
        self.file.as_mut().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotConnected,
                format!("{:?} is already closed", self.path),
            )
        })
    }

    #[cfg(target_os = "linux")]
    fn is_block_device(&mut self) -> bool {
        use std::os::unix::fs::FileTypeExt;

        self.file()
            .and_then(|f| f.metadata())
            .is_ok_and(|m| m.file_type().is_block_device())
    }
}

impl Read for RawFileDescriptor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let file = self.file()?;
        stream::retry_interrupted(|| file.read(buf))
    }
}

impl Write for RawFileDescriptor {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let file = self.file()?;
        stream::retry_interrupted(|| file.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        let file = self.file()?;
        stream::retry_interrupted(|| file.flush())
    }
}

impl Seek for RawFileDescriptor {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file()?.seek(pos)
    }
}

impl FileDescriptor for RawFileDescriptor {
    #[cfg(target_os = "linux")]
    fn block_dev_size(&mut self) -> u64 {
        if !self.is_block_device() {
            return 0;
        }

        match self.file().and_then(|f| blk::get_size64(f)) {
            Ok(size) => size,
            Err(e) => {
                debug!("BLKGETSIZE64 failed for {:?}: {e}", self.path);
                0
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn block_dev_size(&mut self) -> u64 {
        0
    }

    #[cfg(target_os = "linux")]
    fn blk_ioctl(&mut self, request: BlkIoctl, start: u64, length: u64) -> io::Result<()> {
        if !self.is_block_device() {
            return Err(super::unsupported("Block ioctl on a regular file"));
        }

        let file = self.file()?;
        let ret = stream::retry_interrupted(|| match request {
            BlkIoctl::Discard => blk::range::<{ blk::BLKDISCARD }>(file, start, length),
            BlkIoctl::SecureDiscard => blk::range::<{ blk::BLKSECDISCARD }>(file, start, length),
            BlkIoctl::ZeroOut => blk::range::<{ blk::BLKZEROOUT }>(file, start, length),
        });

        match ret {
            Err(e) if matches!(e.raw_os_error(), Some(libc::ENOTTY | libc::EOPNOTSUPP)) => {
                Err(io::Error::new(io::ErrorKind::Unsupported, e))
            }
            r => r,
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn blk_ioctl(&mut self, _request: BlkIoctl, _start: u64, _length: u64) -> io::Result<()> {
        Err(super::unsupported("Block ioctl"))
    }

    fn close(&mut self) -> io::Result<()> {
        let Some(mut file) = self.file.take() else {
            return Ok(());
        };

        stream::retry_interrupted(|| file.flush())?;
        if self.writable {
            stream::retry_interrupted(|| file.sync_data())?;
        }

        Ok(())
    }
}

/// Toggle the kernel's read-only flag for a block device. Failures are ignored
/// because this does not work for regular files.
#[cfg(target_os = "linux")]
pub fn set_block_device_read_only(path: &Path, read_only: bool) {
    use std::os::unix::fs::FileTypeExt;

    let Ok(file) = File::open(path) else {
        return;
    };
    if !file
        .metadata()
        .is_ok_and(|m| m.file_type().is_block_device())
    {
        return;
    }

    if let Err(e) = blk::set_read_only(&file, read_only) {
        debug!("Failed to set {path:?} read-only={read_only}: {e}");
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_block_device_read_only(_path: &Path, _read_only: bool) {}
