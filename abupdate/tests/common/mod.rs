// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

#![allow(dead_code)]

use std::{
    fs,
    io::{Cursor, Read, Write},
    path::PathBuf,
};

use abupdate::{
    format::puffin::{self, PuffReader},
    hash::HashCalculator,
    protobuf::{
        chromeos_update_engine::{
            DeltaArchiveManifest, Extent, InstallOperation, PartitionInfo, PartitionUpdate,
            Signatures, install_operation::Type, signatures::Signature,
        },
        puffin::metadata::{BitExtent, PatchHeader, StreamInfo, patch_header::PatchType},
    },
    update::{
        self, DeltaPerformer, InstallPlan, WriteStatus,
        plan::{self, PayloadType},
        prefs::MemoryPrefs,
        system::{DirectoryBootControl, DownloadDelegate, StaticHardware},
        terminator::Terminator,
    },
};
use base64::{Engine, engine::general_purpose::STANDARD};
use bzip2::write::BzEncoder;
use flate2::write::DeflateEncoder;
use prost::Message;
use rand::{SeedableRng, rngs::StdRng};
use rsa::{
    Pkcs1v15Sign, RsaPrivateKey,
    pkcs8::{EncodePublicKey, LineEnding},
    traits::PublicKeyParts,
};
use sha2::Sha256;
use tempfile::TempDir;

pub const BLOCK_SIZE: u64 = 4096;

/// Deterministic key so that signature sizes are stable.
pub fn signing_key(seed: u64) -> RsaPrivateKey {
    let mut rng = StdRng::seed_from_u64(seed);
    RsaPrivateKey::new(&mut rng, 1024).unwrap()
}

pub fn public_key_base64(key: &RsaPrivateKey) -> String {
    let der = key.to_public_key().to_public_key_der().unwrap();
    STANDARD.encode(der.as_bytes())
}

pub fn public_key_pem(key: &RsaPrivateKey) -> String {
    key.to_public_key()
        .to_public_key_pem(LineEnding::LF)
        .unwrap()
}

pub fn sha256(data: &[u8]) -> Vec<u8> {
    HashCalculator::raw_hash_of_data(data).to_vec()
}

/// Bytes that differ per block so misplaced writes are detectable.
pub fn pattern(blocks: u64, seed: u8) -> Vec<u8> {
    (0..blocks * BLOCK_SIZE)
        .map(|i| (i / BLOCK_SIZE) as u8 ^ (i % 251) as u8 ^ seed)
        .collect()
}

pub fn block(data: &[u8], index: u64) -> &[u8] {
    &data[(index * BLOCK_SIZE) as usize..((index + 1) * BLOCK_SIZE) as usize]
}

pub fn op(kind: Type, src: &[(u64, u64)], dst: &[(u64, u64)]) -> InstallOperation {
    InstallOperation {
        r#type: kind.into(),
        src_extents: src.iter().map(|(s, n)| Extent::new(*s, *n)).collect(),
        dst_extents: dst.iter().map(|(s, n)| Extent::new(*s, *n)).collect(),
        ..Default::default()
    }
}

pub fn bzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = BzEncoder::new(Vec::new(), bzip2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

pub fn brotli(data: &[u8]) -> Vec<u8> {
    let mut out = vec![];
    {
        let mut writer = brotli::CompressorWriter::new(&mut out, 4096, 9, 22);
        writer.write_all(data).unwrap();
    }
    out
}

pub fn deflate(data: &[u8]) -> Vec<u8> {
    let mut encoder = DeflateEncoder::new(vec![], flate2::Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// A bsdiff patch with a single control entry that adds the whole diff to the
/// start of `old`. `bsdf2` selects the BSDF2 format with brotli streams instead
/// of BSDIFF40.
pub fn bsdiff(old: &[u8], new: &[u8], bsdf2: bool) -> Vec<u8> {
    let mut ctrl = vec![];
    for value in [new.len() as u64, 0, 0] {
        ctrl.extend_from_slice(&value.to_le_bytes());
    }

    let diff = new
        .iter()
        .enumerate()
        .map(|(i, b)| b.wrapping_sub(old.get(i).copied().unwrap_or(0)))
        .collect::<Vec<_>>();

    let (magic, compress): (&[u8; 8], fn(&[u8]) -> Vec<u8>) = if bsdf2 {
        (b"BSDF2\x02\x02\x02", brotli)
    } else {
        (b"BSDIFF40", bzip)
    };
    let streams = [compress(&ctrl), compress(&diff), compress(&[])];

    let mut patch = magic.to_vec();
    for len in [streams[0].len(), streams[1].len(), new.len()] {
        patch.extend_from_slice(&(len as u64).to_le_bytes());
    }
    for stream in streams {
        patch.extend_from_slice(&stream);
    }

    patch
}

/// `prefix`, the deflated `contents`, then `suffix`, like a zip entry.
pub fn archive(prefix: &[u8], contents: &[u8], suffix: &[u8]) -> (Vec<u8>, StreamInfo) {
    let compressed = deflate(contents);

    let mut data = prefix.to_vec();
    data.extend_from_slice(&compressed);
    data.extend_from_slice(suffix);

    let deflates = vec![BitExtent {
        offset: prefix.len() as u64 * 8,
        length: compressed.len() as u64 * 8,
    }];
    let info = puffin::stream_info(&data, deflates).unwrap();

    (data, info)
}

fn puffed(data: &[u8], info: &StreamInfo) -> Vec<u8> {
    let mut cursor = Cursor::new(data);
    let mut reader = PuffReader::new(&mut cursor, info, data.len() as u64, 0).unwrap();
    let mut puffed = vec![];
    reader.read_to_end(&mut puffed).unwrap();
    puffed
}

/// A puffin patch whose inner bsdiff patch operates on the puffed streams.
pub fn puffdiff(old: &[u8], src: &StreamInfo, new: &[u8], dst: &StreamInfo) -> Vec<u8> {
    let header = PatchHeader {
        version: 1,
        src: Some(src.clone()),
        dst: Some(dst.clone()),
        r#type: PatchType::Bsdiff.into(),
    }
    .encode_to_vec();

    let mut patch = b"PUF1".to_vec();
    patch.extend_from_slice(&(header.len() as u32).to_be_bytes());
    patch.extend_from_slice(&header);
    patch.extend_from_slice(&bsdiff(&puffed(old, src), &puffed(new, dst), false));

    patch
}

/// A partition in the payload. Each operation is paired with its data blob,
/// which may be empty.
#[derive(Clone, Debug, Default)]
pub struct TestPartition {
    pub name: String,
    pub old_size: Option<u64>,
    pub new_data: Vec<u8>,
    pub operations: Vec<(InstallOperation, Vec<u8>)>,
    /// Fields merged into the partition update, such as verity extents.
    pub extra: PartitionUpdate,
}

impl TestPartition {
    pub fn new(name: &str, new_data: &[u8]) -> Self {
        Self {
            name: name.to_owned(),
            new_data: new_data.to_vec(),
            ..Default::default()
        }
    }

    pub fn with_old_size(mut self, size: u64) -> Self {
        self.old_size = Some(size);
        self
    }

    pub fn with_op(mut self, op: InstallOperation, blob: &[u8]) -> Self {
        self.operations.push((op, blob.to_vec()));
        self
    }
}

#[derive(Clone, Debug)]
pub struct PayloadBuilder {
    pub major_version: u64,
    pub minor_version: Option<u32>,
    pub max_timestamp: i64,
    pub block_size: u32,
    pub partitions: Vec<TestPartition>,
    /// Signs both the metadata and the payload. For major version 1, the
    /// payload signature is also covered by a dummy REPLACE operation at the
    /// end of the kernel partition.
    pub key: Option<RsaPrivateKey>,
    /// Compute `data_sha256_hash` for every operation with data.
    pub op_hashes: bool,
    /// Fields merged into the manifest before it is signed.
    pub extra: DeltaArchiveManifest,
}

impl Default for PayloadBuilder {
    fn default() -> Self {
        Self {
            major_version: 2,
            minor_version: Some(0),
            max_timestamp: 1_700_000_000,
            block_size: BLOCK_SIZE as u32,
            partitions: vec![],
            key: None,
            op_hashes: true,
            extra: DeltaArchiveManifest::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TestPayload {
    pub data: Vec<u8>,
    pub metadata_size: u64,
    pub data_offset: u64,
    pub hash: Vec<u8>,
    /// Base64 raw signature of the metadata, for passing out of band.
    pub metadata_signature: String,
    /// Offsets of each operation's blob within the data section.
    pub blob_offsets: Vec<u64>,
}

fn signatures_blob(raw_signature: Vec<u8>) -> Vec<u8> {
    let size = raw_signature.len() as u32;

    Signatures {
        signatures: vec![Signature {
            data: Some(raw_signature),
            unpadded_signature_size: Some(size),
            ..Default::default()
        }],
    }
    .encode_to_vec()
}

fn sign(key: &RsaPrivateKey, data: &[u8]) -> Vec<u8> {
    let digest = HashCalculator::raw_hash_of_data(data);
    key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest).unwrap()
}

impl PayloadBuilder {
    pub fn signed(key: &RsaPrivateKey) -> Self {
        Self {
            key: Some(key.clone()),
            ..Default::default()
        }
    }

    pub fn partition(mut self, partition: TestPartition) -> Self {
        self.partitions.push(partition);
        self
    }

    pub fn build(&self) -> TestPayload {
        let mut manifest = self.extra.clone();
        manifest.block_size = Some(self.block_size);
        manifest.minor_version = self.minor_version;
        manifest.max_timestamp = Some(self.max_timestamp);

        let mut blobs = vec![];
        let mut blob_offsets = vec![];

        // Every signature has the same length for a given key, so the sizes
        // can be computed before anything is signed.
        let placeholder = self
            .key
            .as_ref()
            .map(|k| signatures_blob(vec![0u8; k.size()]));

        for partition in &self.partitions {
            let mut update = PartitionUpdate {
                partition_name: partition.name.clone(),
                new_partition_info: Some(PartitionInfo {
                    size: Some(partition.new_data.len() as u64),
                    hash: Some(sha256(&partition.new_data)),
                }),
                old_partition_info: partition.old_size.map(|size| PartitionInfo {
                    size: Some(size),
                    hash: None,
                }),
                ..partition.extra.clone()
            };

            for (op, blob) in &partition.operations {
                let mut op = op.clone();

                if !blob.is_empty() {
                    blob_offsets.push(blobs.len() as u64);
                    // Tests may deliberately point an operation elsewhere.
                    if op.data_offset.is_none() {
                        op.data_offset = Some(blobs.len() as u64);
                    }
                    op.data_length = Some(blob.len() as u64);
                    if self.op_hashes {
                        op.data_sha256_hash = Some(sha256(blob));
                    }
                    blobs.extend_from_slice(blob);
                }

                update.operations.push(op);
            }

            // Major version 1 only knows about the root and kernel partitions.
            if self.major_version >= 2 {
                manifest.partitions.push(update);
            } else if manifest.new_rootfs_info.is_none() {
                manifest.old_rootfs_info = update.old_partition_info;
                manifest.new_rootfs_info = update.new_partition_info;
                manifest.install_operations = update.operations;
            } else {
                manifest.old_kernel_info = update.old_partition_info;
                manifest.new_kernel_info = update.new_partition_info;
                manifest.kernel_install_operations = update.operations;
            }
        }

        if let Some(placeholder) = &placeholder {
            let size = placeholder.len() as u64;
            manifest.signatures_offset = Some(blobs.len() as u64);
            manifest.signatures_size = Some(size);

            if self.major_version < 2 {
                let mut signature_op = op(Type::Replace, &[], &[(0, size.div_ceil(BLOCK_SIZE))]);
                signature_op.data_offset = Some(blobs.len() as u64);
                signature_op.data_length = Some(size);
                manifest.kernel_install_operations.push(signature_op);
            }
        }

        let raw_manifest = manifest.encode_to_vec();
        let metadata_signature_size = if self.major_version >= 2 {
            placeholder.as_ref().map_or(0, Vec::len)
        } else {
            0
        };

        let mut metadata = vec![];
        metadata.extend_from_slice(b"CrAU");
        metadata.extend_from_slice(&self.major_version.to_be_bytes());
        metadata.extend_from_slice(&(raw_manifest.len() as u64).to_be_bytes());
        if self.major_version >= 2 {
            metadata.extend_from_slice(&(metadata_signature_size as u32).to_be_bytes());
        }
        metadata.extend_from_slice(&raw_manifest);

        let mut data = metadata.clone();
        let mut metadata_signature = String::new();

        match &self.key {
            Some(key) => {
                let raw = sign(key, &metadata);
                metadata_signature = STANDARD.encode(&raw);
                if self.major_version >= 2 {
                    data.extend_from_slice(&signatures_blob(raw));
                }

                // The payload signature covers the metadata and the blobs, but
                // not the metadata signature.
                let mut signed = metadata.clone();
                signed.extend_from_slice(&blobs);
                let payload_signature = signatures_blob(sign(key, &signed));

                data.extend_from_slice(&blobs);
                data.extend_from_slice(&payload_signature);
            }
            None => data.extend_from_slice(&blobs),
        }

        TestPayload {
            hash: sha256(&data),
            metadata_size: metadata.len() as u64,
            data_offset: (metadata.len() + metadata_signature_size) as u64,
            metadata_signature,
            blob_offsets,
            data,
        }
    }
}

/// A two slot device whose partitions are regular files in a temporary
/// directory. Slot 0 is running and slot 1 is the update target.
pub struct TestDevice {
    pub dir: TempDir,
    pub boot_control: DirectoryBootControl,
    pub hardware: StaticHardware,
    pub prefs: MemoryPrefs,
    pub terminator: Terminator,
}

impl TestDevice {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let boot_control = DirectoryBootControl::new(dir.path().to_owned(), 2, 0);

        Self {
            dir,
            boot_control,
            hardware: StaticHardware {
                official_build: false,
                build_timestamp: 1_600_000_000,
            },
            prefs: MemoryPrefs::new(),
            terminator: Terminator::new(),
        }
    }

    pub fn partition_path(&self, name: &str, slot: u32) -> PathBuf {
        let suffix = if slot == 0 { "_a" } else { "_b" };
        self.dir.path().join(format!("{name}{suffix}"))
    }

    pub fn write_partition(&self, name: &str, slot: u32, data: &[u8]) {
        fs::write(self.partition_path(name, slot), data).unwrap();
    }

    pub fn read_partition(&self, name: &str, slot: u32) -> Vec<u8> {
        fs::read(self.partition_path(name, slot)).unwrap()
    }

    /// Install plan matching what the update server would have announced.
    pub fn install_plan(&self, payload: &TestPayload) -> InstallPlan {
        InstallPlan {
            payload: plan::Payload {
                size: payload.data.len() as u64,
                metadata_size: payload.metadata_size,
                hash: payload.hash.clone(),
                payload_type: PayloadType::Unknown,
                ..Default::default()
            },
            hash_checks_mandatory: true,
            source_slot: Some(0),
            target_slot: Some(1),
            interactive: true,
            ..Default::default()
        }
    }

    /// Feed `data` in `chunk_size` pieces until the engine stops asking for
    /// more, then release the devices.
    pub fn apply(
        &mut self,
        install_plan: &mut InstallPlan,
        data: &[u8],
        chunk_size: usize,
        delegate: Option<&dyn DownloadDelegate>,
    ) -> update::Result<WriteStatus> {
        let mut performer = DeltaPerformer::new(
            &mut self.prefs,
            &mut self.boot_control,
            &self.hardware,
            &self.terminator,
            install_plan,
        );
        if let Some(delegate) = delegate {
            performer.set_delegate(delegate);
        }

        let mut status = WriteStatus::NeedMoreData;
        for chunk in data.chunks(chunk_size) {
            status = performer.write(chunk)?;
            if status != WriteStatus::NeedMoreData {
                break;
            }
        }

        performer.close()?;

        Ok(status)
    }

    /// Like [`Self::apply()`], but also checks the whole payload afterwards.
    pub fn apply_and_verify(
        &mut self,
        install_plan: &mut InstallPlan,
        payload: &TestPayload,
        chunk_size: usize,
    ) -> update::Result<WriteStatus> {
        let mut performer = DeltaPerformer::new(
            &mut self.prefs,
            &mut self.boot_control,
            &self.hardware,
            &self.terminator,
            install_plan,
        );

        let mut status = WriteStatus::NeedMoreData;
        for chunk in payload.data.chunks(chunk_size) {
            status = performer.write(chunk)?;
            if status != WriteStatus::NeedMoreData {
                break;
            }
        }

        performer.close()?;

        if status == WriteStatus::Complete {
            performer.verify_payload(&payload.hash, payload.data.len() as u64)?;
        }

        Ok(status)
    }
}
