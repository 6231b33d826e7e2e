// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Raw NAND (MTD) and UBI volume descriptors. Both device types only accept
//! sequential writes, so seeking is restricted to read-only descriptors.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use rustix::ioctl::{Getter, Opcode, Setter, ioctl, opcode};
use tracing::debug;

use crate::{
    fd::{BlkIoctl, FileDescriptor},
    stream,
};

#[repr(C)]
struct MtdInfoUser {
    kind: u8,
    flags: u32,
    size: u32,
    erasesize: u32,
    writesize: u32,
    oobsize: u32,
    _padding: u64,
}

#[repr(C)]
struct EraseInfoUser {
    start: u32,
    length: u32,
}

// <mtd/mtd-abi.h> and <mtd/ubi-user.h>
const MEMGETINFO: Opcode = opcode::read::<MtdInfoUser>(b'M', 1);
const MEMERASE: Opcode = opcode::write::<EraseInfoUser>(b'M', 2);
const UBI_IOCVOLUP: Opcode = opcode::write::<i64>(b'O', 0);

fn sequential_only() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "Only sequential writes are supported",
    )
}

/// Whether `path` is an MTD character device node (`/dev/mtdN`).
pub fn is_mtd_device(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_prefix("mtd"))
        .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()))
}

/// Whether `path` is a UBI volume device node (`/dev/ubiX_Y`).
pub fn is_ubi_device(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_prefix("ubi"))
        .and_then(|n| n.split_once('_'))
        .is_some_and(|(d, v)| {
            !d.is_empty()
                && !v.is_empty()
                && d.bytes().all(|b| b.is_ascii_digit())
                && v.bytes().all(|b| b.is_ascii_digit())
        })
}

/// Raw NAND flash. Each erase block is erased right before the first byte is
/// written to it.
pub struct MtdFileDescriptor {
    file: File,
    writable: bool,
    size: u64,
    erase_size: u64,
    pos: u64,
    /// End of the erased region available for writing.
    erased_until: u64,
}

impl MtdFileDescriptor {
    pub fn open(path: &Path, writable: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(!writable)
            .write(writable)
            .open(path)?;

        // SAFETY: MEMGETINFO fills in a single mtd_info_user struct.
        let info = unsafe { ioctl(&file, Getter::<MEMGETINFO, MtdInfoUser>::new())? };
        debug!(
            "MTD {path:?}: type={} flags={:#x} size={} erase={} write={} oob={}",
            info.kind, info.flags, info.size, info.erasesize, info.writesize, info.oobsize,
        );

        Ok(Self {
            file,
            writable,
            size: info.size.into(),
            erase_size: info.erasesize.max(1).into(),
            pos: 0,
            erased_until: 0,
        })
    }

    fn erase_next(&mut self) -> io::Result<()> {
        let start = self.erased_until;
        let erase = EraseInfoUser {
            start: start
                .try_into()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?,
            length: self.erase_size as u32,
        };

        // SAFETY: MEMERASE reads a single erase_info_user struct.
        unsafe { ioctl(&self.file, Setter::<MEMERASE, EraseInfoUser>::new(erase))? };

        self.erased_until += self.erase_size;

        Ok(())
    }
}

impl Read for MtdFileDescriptor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = stream::retry_interrupted(|| self.file.read(buf))?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for MtdFileDescriptor {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.pos >= self.size {
            return Ok(0);
        }
        if self.pos == self.erased_until {
            self.erase_next()?;
        }

        let n = buf.len().min((self.erased_until - self.pos) as usize);
        let n = stream::retry_interrupted(|| self.file.write(&buf[..n]))?;
        self.pos += n as u64;

        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for MtdFileDescriptor {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        if self.writable {
            if pos == SeekFrom::Start(self.pos) || pos == SeekFrom::Current(0) {
                return Ok(self.pos);
            }
            return Err(sequential_only());
        }

        self.pos = self.file.seek(pos)?;
        Ok(self.pos)
    }
}

impl FileDescriptor for MtdFileDescriptor {
    fn block_dev_size(&mut self) -> u64 {
        self.size
    }

    fn blk_ioctl(&mut self, _request: BlkIoctl, _start: u64, _length: u64) -> io::Result<()> {
        Err(super::unsupported("Block ioctl on MTD device"))
    }

    fn close(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// UBI volume. Writable descriptors start a volume update that expects exactly
/// the volume's usable size to be written.
pub struct UbiFileDescriptor {
    file: File,
    writable: bool,
    size: u64,
    pos: u64,
}

impl UbiFileDescriptor {
    fn volume_size(path: &Path) -> io::Result<u64> {
        let name = path
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "No volume name"))?;
        let sysfs = PathBuf::from("/sys/class/ubi").join(name).join("data_bytes");

        fs::read_to_string(&sysfs)?
            .trim()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    pub fn open(path: &Path, writable: bool) -> io::Result<Self> {
        let size = Self::volume_size(path)?;
        let file = OpenOptions::new()
            .read(!writable)
            .write(writable)
            .open(path)?;

        if writable {
            let bytes = i64::try_from(size)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            // SAFETY: UBI_IOCVOLUP reads a single int64.
            unsafe { ioctl(&file, Setter::<UBI_IOCVOLUP, i64>::new(bytes))? };
        }

        Ok(Self {
            file,
            writable,
            size,
            pos: 0,
        })
    }
}

impl Read for UbiFileDescriptor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = stream::retry_interrupted(|| self.file.read(buf))?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for UbiFileDescriptor {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let remaining = self.size.saturating_sub(self.pos);
        let n = buf.len().min(remaining as usize);
        let n = stream::retry_interrupted(|| self.file.write(&buf[..n]))?;
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for UbiFileDescriptor {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        if self.writable {
            if pos == SeekFrom::Start(self.pos) || pos == SeekFrom::Current(0) {
                return Ok(self.pos);
            }
            return Err(sequential_only());
        }

        self.pos = self.file.seek(pos)?;
        Ok(self.pos)
    }
}

impl FileDescriptor for UbiFileDescriptor {
    fn block_dev_size(&mut self) -> u64 {
        self.size
    }

    fn blk_ioctl(&mut self, _request: BlkIoctl, _start: u64, _length: u64) -> io::Result<()> {
        Err(super::unsupported("Block ioctl on UBI volume"))
    }

    fn close(&mut self) -> io::Result<()> {
        // A volume update only completes once every byte has been written.
        if self.writable && self.pos < self.size {
            stream::WriteZerosExt::write_zeros_exact(&mut self.file, self.size - self.pos)?;
            self.pos = self.size;
        }

        self.file.flush()
    }
}
