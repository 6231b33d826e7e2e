// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Checking whether a delta payload can be applied on top of the running slot
//! without downloading the payload data.

use std::{
    fs::File,
    io::{self, Read},
    path::Path,
};

use rsa::RsaPublicKey;
use tracing::{info, warn};

use crate::{
    fd::RawFileDescriptor,
    format::payload::{
        self, BRILLO_MAJOR_PAYLOAD_VERSION, MetadataParseResult, PayloadMetadata,
    },
    update::{
        error::{Error, Result},
        legacy, performer,
        system::BootControl,
    },
};

/// Parse the payload metadata in `metadata_path`, verify its signature with
/// `public_key` and then check the source hash of every operation against the
/// current slot's partitions.
pub fn verify_payload_applicable(
    metadata_path: &Path,
    boot_control: &dyn BootControl,
    public_key: Option<&RsaPublicKey>,
) -> Result<()> {
    let mut file = File::open(metadata_path)?;

    // Only the metadata is read, even if the whole payload is given.
    let mut data = vec![];
    (&mut file)
        .take(payload::MAX_PAYLOAD_HEADER_SIZE as u64)
        .read_to_end(&mut data)?;

    let mut metadata = PayloadMetadata::new();
    let result = metadata.parse_payload_header(&data).map_err(|e| match e {
        payload::Error::UnsupportedMajorVersion(v) => Error::UnsupportedMajorVersion(v),
        e => Error::MetadataParse(e),
    })?;
    if result == MetadataParseResult::InsufficientData {
        return Err(Error::MetadataParse(payload::Error::InsufficientData {
            needed: payload::MAX_PAYLOAD_HEADER_SIZE as u64,
            available: data.len(),
        }));
    }

    let remaining = metadata.data_offset().saturating_sub(data.len() as u64);
    file.take(remaining).read_to_end(&mut data)?;

    match public_key {
        Some(key) => metadata
            .validate_metadata_signature(&data, "", Some(key))
            .map_err(|e| match e {
                payload::Error::SignatureMissing => Error::MetadataSignatureMissing,
                e => Error::MetadataSignature(e),
            })?,
        None => warn!("No public key; skipping metadata signature verification"),
    }

    let mut manifest = metadata.manifest(&data).map_err(Error::MetadataParse)?;
    let block_size = u64::from(manifest.block_size());

    let partitions = if metadata.major_version() == BRILLO_MAJOR_PAYLOAD_VERSION {
        std::mem::take(&mut manifest.partitions)
    } else {
        legacy::normalize(&mut manifest, true)
    };

    let slot = boot_control.current_slot();
    let mut checked = 0;

    for partition in &partitions {
        let name = &partition.partition_name;
        let ops = partition
            .operations
            .iter()
            .filter(|op| op.src_sha256_hash.is_some())
            .collect::<Vec<_>>();
        if ops.is_empty() {
            continue;
        }

        let path = boot_control
            .get_partition_device(name, slot)
            .map_err(|e| Error::DeviceOpen {
                partition: name.clone(),
                path: String::new(),
                source: io::Error::other(e),
            })?;
        let mut fd =
            RawFileDescriptor::open(&path, false, true).map_err(|e| Error::DeviceOpen {
                partition: name.clone(),
                path: path.display().to_string(),
                source: e,
            })?;

        for op in ops {
            let expected = op.src_sha256_hash();
            let actual =
                performer::hash_of_extents(&mut fd, None, &op.src_extents, &[], block_size)?;

            if actual != expected {
                return Err(Error::SourceHashMismatch {
                    expected: hex::encode(expected),
                    actual: hex::encode(actual),
                });
            }

            checked += 1;
        }

        info!("Source partition {name:?} matches the payload");
    }

    info!("Payload is applicable: verified {checked} source hashes");

    Ok(())
}
