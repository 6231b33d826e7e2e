// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Writing the dm-verity hash tree and FEC parity of a freshly written target
//! partition.

use std::io::{self, SeekFrom};

use thiserror::Error;
use tracing::info;

use crate::{
    fd::FileDescriptor,
    format::{
        fec::{self, FEC_BLOCK_SIZE, Fec},
        hashtree::{self, HashTree},
    },
    stream::{SectionReader, WriteZerosExt},
    update::plan::Partition,
    util::NumBytes,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Hash tree needs {needed} bytes, but only {available} are reserved")]
    HashTreeTooLarge { needed: u64, available: u64 },
    #[error("FEC data needs {needed} bytes, but {available} are reserved")]
    FecSizeMismatch { needed: u64, available: u64 },
    #[error("FEC roots out of range: {0}")]
    InvalidRoots(u32),
    #[error("Failed to generate hash tree")]
    HashTree(#[from] hashtree::Error),
    #[error("Failed to generate FEC data")]
    Fec(#[from] fec::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

fn write_hash_tree(fd: &mut dyn FileDescriptor, partition: &Partition) -> Result<()> {
    let algorithm = hashtree::ring_algorithm(&partition.hash_tree_algorithm)?;
    let hash_tree = HashTree::new(partition.block_size, algorithm, &partition.hash_tree_salt);

    let reader = SectionReader::new(
        &mut *fd,
        partition.hash_tree_data_offset,
        partition.hash_tree_data_size,
    )?;
    let (root_digest, tree) = hash_tree.generate(reader, partition.hash_tree_data_size)?;

    if tree.len() as u64 > partition.hash_tree_size {
        return Err(Error::HashTreeTooLarge {
            needed: tree.len() as u64,
            available: partition.hash_tree_size,
        });
    }

    fd.seek(SeekFrom::Start(partition.hash_tree_offset))?;
    fd.write_all(&tree)?;
    fd.write_zeros_exact(partition.hash_tree_size - tree.len() as u64)?;

    info!(
        "Wrote {:?} hash tree for {:?} with root digest {}",
        NumBytes(tree.len()),
        partition.name,
        hex::encode(root_digest),
    );

    Ok(())
}

fn write_fec(fd: &mut dyn FileDescriptor, partition: &Partition) -> Result<()> {
    let roots = u8::try_from(partition.fec_roots).map_err(|_| Error::InvalidRoots(partition.fec_roots))?;
    let fec = Fec::new(partition.fec_data_size, FEC_BLOCK_SIZE, roots)?;

    if fec.fec_size() != partition.fec_size {
        return Err(Error::FecSizeMismatch {
            needed: fec.fec_size(),
            available: partition.fec_size,
        });
    }

    let mut parity = Vec::new();
    let reader = SectionReader::new(&mut *fd, partition.fec_data_offset, partition.fec_data_size)?;
    fec.generate(reader, &mut parity)?;

    fd.seek(SeekFrom::Start(partition.fec_offset))?;
    fd.write_all(&parity)?;

    info!(
        "Wrote {:?} FEC data for {:?} with {roots} roots",
        NumBytes(partition.fec_size),
        partition.name,
    );

    Ok(())
}

/// Generate and write the hash tree, then the FEC data, which usually covers
/// the hash tree too.
pub fn write_verity(fd: &mut dyn FileDescriptor, partition: &Partition) -> Result<()> {
    if partition.hash_tree_size > 0 {
        write_hash_tree(fd, partition)?;
    }

    if partition.fec_size > 0 {
        write_fec(fd, partition)?;
    }

    fd.flush()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Read};

    use assert_matches::assert_matches;
    use rand::{RngCore, SeedableRng, rngs::StdRng};

    use super::*;
    use crate::fd::fec::{FecFileDescriptor, FecLayout};

    #[test]
    fn hash_tree_and_fec() {
        let block_size = 4096u64;
        let data_size = 40 * block_size;

        let hash_tree = HashTree::new(4096, &ring::digest::SHA256, b"salt");
        let tree_size = hash_tree.tree_size(data_size).unwrap();
        let fec_data_size = data_size + tree_size;
        let fec_size = Fec::new(fec_data_size, FEC_BLOCK_SIZE, 2)
            .unwrap()
            .fec_size();

        let partition = Partition {
            name: "system".to_owned(),
            block_size: 4096,
            hash_tree_algorithm: "sha256".to_owned(),
            hash_tree_salt: b"salt".to_vec(),
            hash_tree_data_offset: 0,
            hash_tree_data_size: data_size,
            hash_tree_offset: data_size,
            hash_tree_size: tree_size,
            fec_data_offset: 0,
            fec_data_size,
            fec_offset: fec_data_size,
            fec_size,
            fec_roots: 2,
            ..Default::default()
        };

        let mut image = vec![0u8; (fec_data_size + fec_size) as usize];
        StdRng::seed_from_u64(6).fill_bytes(&mut image[..data_size as usize]);
        let data = image[..data_size as usize].to_vec();

        let mut fd = Cursor::new(image);
        write_verity(&mut fd, &partition).unwrap();
        let image = fd.into_inner();

        let (_, expected_tree) = hash_tree.generate(data.as_slice(), data_size).unwrap();
        assert_eq!(
            &image[data_size as usize..fec_data_size as usize],
            expected_tree.as_slice(),
        );

        // The parity repairs corruption in both the data and the tree.
        let mut corrupted = image.clone();
        corrupted[5] ^= 0xff;
        corrupted[data_size as usize + 1] ^= 0xff;

        let layout = FecLayout {
            data_size: fec_data_size,
            fec_offset: fec_data_size,
            roots: 2,
        };
        let mut fec_fd = FecFileDescriptor::new(Cursor::new(corrupted), layout).unwrap();
        let mut repaired = vec![];
        fec_fd.read_to_end(&mut repaired).unwrap();
        assert_eq!(repaired, &image[..fec_data_size as usize]);
    }

    #[test]
    fn reserved_space_too_small() {
        let partition = Partition {
            block_size: 4096,
            hash_tree_data_size: 8 * 4096,
            hash_tree_offset: 8 * 4096,
            hash_tree_size: 1,
            ..Default::default()
        };

        let mut fd = Cursor::new(vec![0u8; 9 * 4096]);
        assert_matches!(
            write_verity(&mut fd, &partition),
            Err(Error::HashTreeTooLarge {
                needed: 4096,
                available: 1
            })
        );
    }
}
