// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

mod common;

use std::fs;

use abupdate::{
    format::payload::Error as MetadataError,
    protobuf::chromeos_update_engine::install_operation::Type,
    update::{Error, ErrorCode, applicable},
};
use assert_matches::assert_matches;

use common::{
    BLOCK_SIZE, PayloadBuilder, TestDevice, TestPartition, TestPayload, op, pattern, sha256,
    signing_key,
};

fn delta_payload(builder: PayloadBuilder, source: &[u8], target: &[u8]) -> TestPayload {
    let mut copy = op(Type::SourceCopy, &[(1, 1)], &[(0, 1)]);
    copy.src_sha256_hash = Some(sha256(&source[BLOCK_SIZE as usize..2 * BLOCK_SIZE as usize]));

    // Without a source hash, there is nothing to check.
    let unchecked = op(Type::SourceCopy, &[(0, 1)], &[(1, 1)]);

    PayloadBuilder {
        minor_version: Some(6),
        ..builder
    }
    .partition(
        TestPartition::new("system", target)
            .with_old_size(source.len() as u64)
            .with_op(copy, &[])
            .with_op(unchecked, &[]),
    )
    .build()
}

#[test]
fn verify_against_current_slot() {
    let key = signing_key(20);
    let public_key = key.to_public_key();
    let source = pattern(2, 0x12);
    let target = pattern(2, 0x34);
    let payload = delta_payload(PayloadBuilder::signed(&key), &source, &target);

    let device = TestDevice::new();
    device.write_partition("system", 0, &source);

    let metadata_path = device.dir.path().join("metadata");
    fs::write(&metadata_path, &payload.data[..payload.data_offset as usize]).unwrap();
    let payload_path = device.dir.path().join("payload.bin");
    fs::write(&payload_path, &payload.data).unwrap();

    for path in [&metadata_path, &payload_path] {
        applicable::verify_payload_applicable(path, &device.boot_control, Some(&public_key))
            .unwrap();
        applicable::verify_payload_applicable(path, &device.boot_control, None).unwrap();
    }

    let err = applicable::verify_payload_applicable(
        &metadata_path,
        &device.boot_control,
        Some(&signing_key(21).to_public_key()),
    )
    .unwrap_err();
    assert_matches!(err, Error::MetadataSignature(_));
    assert_eq!(err.code(), ErrorCode::MetadataSignatureError);

    // Only the block with a source hash matters.
    let mut modified = source.clone();
    modified[0] ^= 0xff;
    device.write_partition("system", 0, &modified);
    applicable::verify_payload_applicable(&metadata_path, &device.boot_control, Some(&public_key))
        .unwrap();

    modified[BLOCK_SIZE as usize] ^= 0xff;
    device.write_partition("system", 0, &modified);
    let err = applicable::verify_payload_applicable(
        &metadata_path,
        &device.boot_control,
        Some(&public_key),
    )
    .unwrap_err();
    assert_matches!(err, Error::SourceHashMismatch { .. });
    assert_eq!(err.code(), ErrorCode::SourceHashMismatch);
}

#[test]
fn reject_incomplete_metadata() {
    let source = pattern(2, 0x56);
    let payload = delta_payload(PayloadBuilder::default(), &source, &source);

    let device = TestDevice::new();
    device.write_partition("system", 0, &source);
    let path = device.dir.path().join("metadata");

    fs::write(&path, &payload.data[..10]).unwrap();
    assert_matches!(
        applicable::verify_payload_applicable(&path, &device.boot_control, None),
        Err(Error::MetadataParse(MetadataError::InsufficientData { .. }))
    );

    fs::write(&path, &payload.data[..payload.data_offset as usize - 1]).unwrap();
    assert_matches!(
        applicable::verify_payload_applicable(&path, &device.boot_control, None),
        Err(Error::MetadataParse(MetadataError::InsufficientData { .. }))
    );

    fs::write(&path, &payload.data[..payload.data_offset as usize]).unwrap();
    applicable::verify_payload_applicable(&path, &device.boot_control, None).unwrap();
}

#[test]
fn missing_source_partition() {
    let source = pattern(2, 0x78);
    let payload = delta_payload(PayloadBuilder::default(), &source, &source);

    let device = TestDevice::new();
    let path = device.dir.path().join("metadata");
    fs::write(&path, &payload.data).unwrap();

    let err = applicable::verify_payload_applicable(&path, &device.boot_control, None).unwrap_err();
    assert_matches!(err, Error::DeviceOpen { ref partition, .. } if partition == "system");
    assert_eq!(err.code(), ErrorCode::DeviceOpenError);
}
