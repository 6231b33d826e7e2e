// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Just enough of the ext2/3/4 superblock to report whether a source partition
//! was ever mounted read-write.

use std::io::{self, Read, Seek, SeekFrom};

use tracing::{info, warn};
use zerocopy::{FromBytes, byteorder::little_endian};
use zerocopy_derive::{FromBytes, Immutable, KnownLayout, Unaligned};

pub const SUPERBLOCK_OFFSET: u64 = 1024;
pub const EXT_MAGIC: u16 = 0xef53;

/// Leading fields of the superblock, up to and including `s_magic`.
#[derive(Clone, Copy, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawSuperblock {
    inodes_count: little_endian::U32,
    blocks_count: little_endian::U32,
    r_blocks_count: little_endian::U32,
    free_blocks_count: little_endian::U32,
    free_inodes_count: little_endian::U32,
    first_data_block: little_endian::U32,
    log_block_size: little_endian::U32,
    log_cluster_size: little_endian::U32,
    blocks_per_group: little_endian::U32,
    clusters_per_group: little_endian::U32,
    inodes_per_group: little_endian::U32,
    mtime: little_endian::U32,
    wtime: little_endian::U32,
    mnt_count: little_endian::U16,
    max_mnt_count: little_endian::U16,
    magic: little_endian::U16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MountHistory {
    pub mount_count: u16,
    /// Seconds since the epoch of the last mount, or 0 if never mounted.
    pub last_mount_time: u32,
}

/// Read the mount history from an ext filesystem superblock. Returns [`None`]
/// if there is no ext filesystem.
pub fn read_mount_history(mut reader: impl Read + Seek) -> io::Result<Option<MountHistory>> {
    let mut buf = [0u8; size_of::<RawSuperblock>()];

    reader.seek(SeekFrom::Start(SUPERBLOCK_OFFSET))?;
    reader.read_exact(&mut buf)?;

    let Ok(sb) = RawSuperblock::read_from_bytes(&buf) else {
        return Ok(None);
    };

    if sb.magic.get() != EXT_MAGIC {
        return Ok(None);
    }

    Ok(Some(MountHistory {
        mount_count: sb.mnt_count.get(),
        last_mount_time: sb.mtime.get(),
    }))
}

/// Log the mount history of a source partition whose contents did not match
/// what the payload expects.
pub fn log_mount_history(reader: impl Read + Seek) {
    match read_mount_history(reader) {
        Ok(Some(h)) if h.mount_count > 0 => {
            warn!(
                "Device was remounted R/W {} times. Last remount happened at unix time {}",
                h.mount_count, h.last_mount_time,
            );
        }
        Ok(Some(_)) => info!("Source filesystem was never mounted R/W"),
        Ok(None) => info!("Source partition does not contain an ext filesystem"),
        Err(e) => warn!("Failed to read source filesystem superblock: {e}"),
    }
}
