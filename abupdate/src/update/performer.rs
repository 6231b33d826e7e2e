// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! The payload application state machine.
//!
//! Payload bytes are fed in with [`DeltaPerformer::write()`] in chunks of any
//! size. Only as much data as the current step needs is buffered: first the
//! header and manifest, then one operation's data blob at a time. Operations
//! are applied strictly in manifest order and progress is checkpointed to
//! [`Prefs`] so that an interrupted update can continue where it left off.

use std::{
    io::{self, Cursor, Read, SeekFrom, Write},
    mem,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use base64::{Engine, engine::general_purpose::STANDARD};
use prost::Message;
use ring::digest::{Context, SHA256};
use rsa::RsaPublicKey;
use tracing::{debug, error, info, warn};

use crate::{
    crypto,
    extent::{self, DirectExtentWriter, DisplayExtents, ExtentReader, ExtentWriter},
    fd::{self, BlkIoctl, CachedFileDescriptor, FecFileDescriptor, FileDescriptor, RawFileDescriptor},
    format::{
        bspatch, ext4,
        payload::{
            self, BRILLO_MAJOR_PAYLOAD_VERSION, CHROMEOS_MAJOR_PAYLOAD_VERSION,
            FULL_PAYLOAD_MINOR_VERSION, IN_PLACE_MINOR_PAYLOAD_VERSION,
            MAX_PAYLOAD_HEADER_SIZE, MAX_SUPPORTED_MINOR_PAYLOAD_VERSION,
            MIN_SUPPORTED_MINOR_PAYLOAD_VERSION, MetadataParseResult, PayloadMetadata,
        },
        puffin,
    },
    hash::HashCalculator,
    protobuf::chromeos_update_engine::{
        DeltaArchiveManifest, Extent, InstallOperation, PartitionUpdate, Signatures,
        install_operation::Type,
    },
    stream::{WriteZerosExt, copy_n_inspect},
    update::{
        buffer::PayloadBuffer,
        error::{Error, PubKeyError, Result},
        legacy,
        plan::{InstallPlan, Partition, PayloadType},
        prefs::{self, Prefs},
        system::{BootControl, DownloadDelegate, Hardware, PartitionGroup, PartitionMetadata},
        terminator::Terminator,
        verity,
    },
    util::{self, NumBytes},
};

/// Resumed attempts allowed before an update must start over.
pub const MAX_RESUMED_UPDATE_FAILURES: i64 = 10;

const UPDATE_STATE_OPERATION_INVALID: i64 = -1;

const CHECKPOINT_FREQUENCY: Duration = Duration::from_secs(1);

const PROGRESS_LOG_MAX_CHUNKS: u32 = 10;
const PROGRESS_LOG_TIMEOUT: Duration = Duration::from_secs(30);
const PROGRESS_DOWNLOAD_WEIGHT: u32 = 50;
const PROGRESS_OPERATIONS_WEIGHT: u32 = 50;

const DEFAULT_POSTINSTALL_PATH: &str = "postinst";

/// Outcome of a successful [`DeltaPerformer::write()`] call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteStatus {
    /// Every byte was consumed. Call again with more data.
    NeedMoreData,
    /// All operations were applied and the payload signature (if any) was
    /// received. Remaining input, if any, was ignored.
    Complete,
    /// The install plan says the target slot already contains this payload.
    AlreadyApplied,
}

/// Which source descriptor an operation reads from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SourceChoice {
    Raw,
    ErrorCorrected,
}

fn required_fd<'f>(
    fd: &'f mut Option<Box<dyn FileDescriptor>>,
    what: &str,
) -> Result<&'f mut dyn FileDescriptor> {
    match fd {
        Some(fd) => Ok(fd.as_mut()),
        None => Err(Error::InvalidOperation(format!("No {what} partition is open"))),
    }
}

fn to_usize(value: u64) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::InvalidOperation(format!("Size too large: {value}")))
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| Error::InvalidState(format!("Value too large: {value}")))
}

/// Byte offset and length of a single extent.
fn extent_byte_range(extent: &Extent, block_size: u64) -> Option<(u64, u64)> {
    let offset = extent.start_block().checked_mul(block_size)?;
    let length = extent.num_blocks().checked_mul(block_size)?;
    offset.checked_add(length)?;

    Some((offset, length))
}

/// `(a * b) / c` without intermediate overflow.
fn int_ratio(part: u64, total: u64, norm: u32) -> u32 {
    if total == 0 {
        return 0;
    }

    (u128::from(part) * u128::from(norm) / u128::from(total)) as u32
}

pub(crate) fn hash_of_extents(
    source: &mut dyn FileDescriptor,
    target: Option<&mut dyn FileDescriptor>,
    src_extents: &[Extent],
    dst_extents: &[Extent],
    block_size: u64,
) -> Result<Vec<u8>> {
    let mut reader = ExtentReader::new(source, src_extents, block_size)?;
    let size = reader.size();
    let mut context = Context::new(&SHA256);

    match target {
        Some(target) => {
            let dst_size = extent::blocks_in_extents(dst_extents)
                .checked_mul(block_size)
                .ok_or(extent::Error::ExtentsTooLarge)?;
            if dst_size != size {
                return Err(Error::InvalidOperation(format!(
                    "Source extents ({size} bytes) and destination extents ({dst_size} bytes) differ in size",
                )));
            }

            let writer = DirectExtentWriter::new(target, dst_extents, block_size)?;
            copy_n_inspect(&mut reader, writer, size, |data| context.update(data))?;
        }
        None => {
            copy_n_inspect(&mut reader, io::sink(), size, |data| context.update(data))?;
        }
    }

    Ok(context.finish().as_ref().to_vec())
}

/// Open a target partition for writing. NAND and UBI devices get their own
/// descriptors when support is compiled in.
fn open_target_fd(path: &Path, interactive: bool) -> io::Result<Box<dyn FileDescriptor>> {
    #[cfg(all(feature = "mtd", target_os = "linux"))]
    {
        use crate::fd::mtd;

        if mtd::is_mtd_device(path) {
            return Ok(Box::new(mtd::MtdFileDescriptor::open(path, true)?));
        } else if mtd::is_ubi_device(path) {
            return Ok(Box::new(mtd::UbiFileDescriptor::open(path, true)?));
        }
    }

    let fd = RawFileDescriptor::open(path, true, interactive)?;
    let fd = CachedFileDescriptor::new(fd, fd::cached::DEFAULT_CACHE_SIZE)?;

    Ok(Box::new(fd))
}

/// Trim everything past the end of the new image. Failure is harmless.
fn discard_partition_tail(fd: &mut dyn FileDescriptor, data_size: u64) {
    let part_size = fd.block_dev_size();
    if part_size == 0 || part_size <= data_size {
        return;
    }

    let tail = part_size - data_size;
    if !fd::discard_range(fd, data_size, tail) {
        warn!("Failed to discard the last {:?} of the partition", NumBytes(tail));
    }
}

pub struct DeltaPerformer<'a> {
    prefs: &'a mut dyn Prefs,
    boot_control: &'a mut dyn BootControl,
    hardware: &'a dyn Hardware,
    delegate: Option<&'a dyn DownloadDelegate>,
    terminator: &'a Terminator,
    install_plan: &'a mut InstallPlan,
    public_key_path: Option<PathBuf>,

    metadata: PayloadMetadata,
    manifest: DeltaArchiveManifest,
    manifest_valid: bool,
    block_size: u64,

    partitions: Vec<PartitionUpdate>,
    /// Running total of operations up to and including each partition.
    acc_num_operations: Vec<usize>,
    num_total_operations: usize,
    next_operation_num: usize,
    current_partition: usize,

    buffer: PayloadBuffer,
    signatures_message_data: Option<Vec<u8>>,

    source_fd: Option<Box<dyn FileDescriptor>>,
    source_ecc_fd: Option<Box<dyn FileDescriptor>>,
    source_ecc_open_failure: bool,
    source_ecc_recovered_failures: u64,
    target_fd: Option<Box<dyn FileDescriptor>>,

    total_bytes_received: u64,
    overall_progress: u32,
    last_progress_chunk: u32,
    forced_progress_log_time: Option<Instant>,

    last_updated_buffer_offset: Option<u64>,
    update_checkpoint_time: Option<Instant>,
    update_checkpoint_wait: Duration,
}

impl<'a> DeltaPerformer<'a> {
    pub fn new(
        prefs: &'a mut dyn Prefs,
        boot_control: &'a mut dyn BootControl,
        hardware: &'a dyn Hardware,
        terminator: &'a Terminator,
        install_plan: &'a mut InstallPlan,
    ) -> Self {
        Self {
            prefs,
            boot_control,
            hardware,
            delegate: None,
            terminator,
            install_plan,
            public_key_path: None,
            metadata: PayloadMetadata::new(),
            manifest: DeltaArchiveManifest::default(),
            manifest_valid: false,
            block_size: 0,
            partitions: vec![],
            acc_num_operations: vec![],
            num_total_operations: 0,
            next_operation_num: 0,
            current_partition: 0,
            buffer: PayloadBuffer::new(),
            signatures_message_data: None,
            source_fd: None,
            source_ecc_fd: None,
            source_ecc_open_failure: false,
            source_ecc_recovered_failures: 0,
            target_fd: None,
            total_bytes_received: 0,
            overall_progress: 0,
            last_progress_chunk: 0,
            forced_progress_log_time: None,
            last_updated_buffer_offset: None,
            update_checkpoint_time: None,
            update_checkpoint_wait: CHECKPOINT_FREQUENCY,
        }
    }

    /// PEM public key used to verify the metadata and payload signatures. The
    /// file is only used if it exists.
    pub fn set_public_key_path(&mut self, path: impl Into<PathBuf>) {
        self.public_key_path = Some(path.into());
    }

    /// Consulted once per operation for whether the update should stop.
    pub fn set_delegate(&mut self, delegate: &'a dyn DownloadDelegate) {
        self.delegate = Some(delegate);
    }

    /// Minimum time between two unforced checkpoints.
    pub fn set_checkpoint_interval(&mut self, interval: Duration) {
        self.update_checkpoint_wait = interval;
    }

    pub fn is_manifest_valid(&self) -> bool {
        self.manifest_valid
    }

    pub fn manifest(&self) -> &DeltaArchiveManifest {
        &self.manifest
    }

    pub fn next_operation_num(&self) -> usize {
        self.next_operation_num
    }

    pub fn num_total_operations(&self) -> usize {
        self.num_total_operations
    }

    /// Overall progress in percent.
    pub fn overall_progress(&self) -> u32 {
        self.overall_progress
    }

    pub fn total_bytes_received(&self) -> u64 {
        self.total_bytes_received
    }

    /// Number of operations whose source data was only correct after FEC.
    pub fn source_ecc_recovered_failures(&self) -> u64 {
        self.source_ecc_recovered_failures
    }

    /// Minor version in effect. Payloads without one are assumed to be the
    /// newest delta format or a full payload.
    fn minor_version(&self) -> u32 {
        match self.manifest.minor_version {
            Some(v) => v,
            None if self.install_plan.payload.payload_type == PayloadType::Delta => {
                MAX_SUPPORTED_MINOR_PAYLOAD_VERSION
            }
            None => FULL_PAYLOAD_MINOR_VERSION,
        }
    }

    fn load_public_key(&self) -> std::result::Result<Option<RsaPublicKey>, crypto::Error> {
        if let Some(path) = self.public_key_path.as_deref().filter(|p| p.exists()) {
            info!("Verifying using public key: {path:?}");
            return crypto::read_pem_public_key_file(path).map(Some);
        }

        // Official builds only trust their built-in key.
        if !self.hardware.is_official_build() && !self.install_plan.public_key_rsa.is_empty() {
            info!("Verifying using public key from install plan");
            return crypto::parse_base64_public_key(&self.install_plan.public_key_rsa).map(Some);
        }

        Ok(None)
    }

    /// Feed the next chunk of the payload.
    ///
    /// When resuming, the caller must feed the metadata first and then
    /// continue at the offset returned by [`Self::resume_offsets()`].
    pub fn write(&mut self, bytes: &[u8]) -> Result<WriteStatus> {
        let mut input = bytes;

        self.total_bytes_received += bytes.len() as u64;
        self.update_overall_progress(false, "Completed ");

        while !self.manifest_valid {
            let target_len = if self.metadata.is_header_parsed() {
                usize::try_from(self.metadata.data_offset()).unwrap_or(usize::MAX)
            } else {
                MAX_PAYLOAD_HEADER_SIZE
            };
            self.buffer.fill(&mut input, target_len);

            if self.parse_payload_metadata()? == MetadataParseResult::InsufficientData {
                // The header may have just been parsed, revealing how much more
                // data is needed.
                if input.is_empty() {
                    return Ok(WriteStatus::NeedMoreData);
                }
                continue;
            }

            self.validate_manifest()?;
            self.manifest_valid = true;

            let metadata_size = to_usize(self.metadata.metadata_size())?;
            self.buffer.discard(false, metadata_size);

            self.parse_manifest_partitions()?;

            if self.install_plan.payload.already_applied {
                info!("Payload was already applied to the target slot");
                return Ok(WriteStatus::AlreadyApplied);
            }

            let mut total = 0;
            self.acc_num_operations = self
                .partitions
                .iter()
                .map(|p| {
                    total += p.operations.len();
                    total
                })
                .collect();
            self.num_total_operations = total;

            for (key, value) in [
                (prefs::KEY_MANIFEST_METADATA_SIZE, self.metadata.metadata_size()),
                (
                    prefs::KEY_MANIFEST_SIGNATURE_SIZE,
                    self.metadata.metadata_signature_size().into(),
                ),
            ] {
                if let Err(e) = to_i64(value).and_then(|v| Ok(self.prefs.set_int64(key, v)?)) {
                    warn!("Unable to save {key}: {e}");
                }
            }

            self.prime_update_state()
                .map_err(|e| Error::StateInitialization(Box::new(e)))?;

            self.current_partition = self
                .acc_num_operations
                .iter()
                .position(|n| *n > self.next_operation_num)
                .unwrap_or(self.partitions.len());

            if self.next_operation_num < self.num_total_operations {
                self.open_current_partition()?;
            }

            if self.next_operation_num > 0 {
                self.update_overall_progress(true, "Resuming after ");
            }

            info!("Starting to apply update payload operations");
        }

        while self.next_operation_num < self.num_total_operations {
            // Cancellation is only possible between operations.
            if let Some(code) = self.delegate.and_then(|d| d.should_cancel()) {
                info!("Update canceled: {code}");
                return Err(Error::Canceled(code));
            }

            while self.next_operation_num >= self.acc_num_operations[self.current_partition] {
                self.close_current_partition()?;
                self.current_partition += 1;

                if self.next_operation_num < self.acc_num_operations[self.current_partition] {
                    self.open_current_partition()?;
                }
            }

            let partition_start = self.partition_start(self.current_partition);
            let op = self.partitions[self.current_partition].operations
                [self.next_operation_num - partition_start]
                .clone();

            if op.data_offset.is_some() || op.data_length.is_some() {
                // Blobs are consumed strictly in order. Anything else means
                // the payload is corrupt or was fed out of order.
                if op.data_offset() != self.buffer.offset() {
                    return Err(Error::DataOffsetMismatch {
                        expected: op.data_offset(),
                        actual: self.buffer.offset(),
                    });
                }

                let data_length = to_usize(op.data_length())?;
                self.buffer.fill(&mut input, data_length);

                if self.buffer.len() < data_length {
                    return Ok(WriteStatus::NeedMoreData);
                }
            }

            // The operation hashes can only be trusted if the manifest was
            // signed.
            if self.has_metadata_signature() {
                if let Err(e) = self.validate_operation_hash(&op) {
                    if self.install_plan.hash_checks_mandatory {
                        error!("Mandatory operation hash check failed");
                        return Err(e);
                    }

                    warn!("Ignoring operation validation error: {e}");
                }
            }

            // Defer termination until this operation is fully applied and
            // checkpointed.
            let terminator = self.terminator;
            terminator.set_exit_blocked(true);
            let _unblocker = terminator.exit_unblocker();

            let kind = Type::try_from(op.r#type).map_err(|_| {
                Error::InvalidOperation(format!("Unknown operation type: {}", op.r#type))
            })?;

            self.perform_operation(kind, &op)
                .map_err(|e| match e {
                    e @ (Error::Canceled(_) | Error::StateInitialization(_)) => e,
                    e => Error::OperationExecution {
                        index: self.next_operation_num,
                        kind: format!("{kind:?}"),
                        source: Box::new(e),
                    },
                })?;

            if self.next_operation_num + 1 == self.acc_num_operations[self.current_partition] {
                self.write_partition_verity()?;
            }

            if let Some(fd) = &mut self.target_fd {
                fd.flush()?;
            }

            self.next_operation_num += 1;
            self.update_overall_progress(false, "Completed ");

            // Replaying an in-place operation is not idempotent.
            self.checkpoint_update_progress(kind.is_in_place())?;
        }

        // Major version 2 payloads have no dummy signature operation. The
        // signature blob directly follows the last operation's data.
        if self.metadata.major_version() == BRILLO_MAJOR_PAYLOAD_VERSION
            && self.manifest.signatures_offset.is_some()
            && self.manifest.signatures_size.is_some()
            && self.signatures_message_data.is_none()
        {
            if self.manifest.signatures_offset() != self.buffer.offset() {
                return Err(Error::SignatureOffsetMismatch {
                    expected: self.manifest.signatures_offset(),
                    actual: self.buffer.offset(),
                });
            }

            let signatures_size = to_usize(self.manifest.signatures_size())?;
            self.buffer.fill(&mut input, signatures_size);

            if self.buffer.len() < signatures_size {
                return Ok(WriteStatus::NeedMoreData);
            }

            self.extract_signature_message()?;
            self.buffer.discard(true, 0);

            let terminator = self.terminator;
            let _unblocker = terminator.exit_unblocker();
            self.checkpoint_update_progress(true)?;
        }

        if !input.is_empty() {
            warn!("Ignoring {:?} past the end of the payload", NumBytes(input.len()));
        }

        Ok(WriteStatus::Complete)
    }

    fn has_metadata_signature(&self) -> bool {
        !self.install_plan.payload.metadata_signature.is_empty()
            || self.metadata.metadata_signature_size() > 0
    }

    fn partition_start(&self, index: usize) -> usize {
        if index == 0 {
            0
        } else {
            self.acc_num_operations[index - 1]
        }
    }

    fn parse_payload_metadata(&mut self) -> Result<MetadataParseResult> {
        if !self.metadata.is_header_parsed() {
            let result = self
                .metadata
                .parse_payload_header(self.buffer.data())
                .map_err(|e| match e {
                    payload::Error::UnsupportedMajorVersion(v) => Error::UnsupportedMajorVersion(v),
                    e => Error::MetadataParse(e),
                })?;
            if result == MetadataParseResult::InsufficientData {
                return Ok(result);
            }

            // Reject a bad size before buffering attacker controlled data.
            if self.install_plan.hash_checks_mandatory
                && self.install_plan.payload.metadata_size != self.metadata.metadata_size()
            {
                return Err(Error::InvalidMetadataSize {
                    expected: self.install_plan.payload.metadata_size,
                    actual: self.metadata.metadata_size(),
                });
            }
        }

        if (self.buffer.len() as u64) < self.metadata.data_offset() {
            return Ok(MetadataParseResult::InsufficientData);
        }

        if self.install_plan.payload.metadata_size == self.metadata.metadata_size() {
            info!("Metadata size in payload matches the install plan");
        } else {
            warn!(
                "Ignoring missing or incorrect metadata size ({}) in install plan; \
                 trusting metadata size in payload: {}",
                self.install_plan.payload.metadata_size,
                self.metadata.metadata_size(),
            );
        }

        let public_key = self.load_public_key().map_err(Error::MetadataPublicKey)?;

        if let Err(e) = self.metadata.validate_metadata_signature(
            self.buffer.data(),
            &self.install_plan.payload.metadata_signature,
            public_key.as_ref(),
        ) {
            if self.install_plan.hash_checks_mandatory {
                error!("Mandatory metadata signature validation failed");
                return Err(match e {
                    payload::Error::SignatureMissing => Error::MetadataSignatureMissing,
                    e => Error::MetadataSignature(e),
                });
            }

            warn!("Ignoring metadata signature validation failure: {e}");
        }

        self.manifest = self
            .metadata
            .manifest(self.buffer.data())
            .map_err(Error::MetadataParse)?;

        Ok(MetadataParseResult::Success)
    }

    fn validate_manifest(&mut self) -> Result<()> {
        let manifest = &self.manifest;
        let major_version = self.metadata.major_version();

        // The presence of an old partition hash is the sole indicator for a
        // delta update.
        let has_old_fields = manifest.old_kernel_info.is_some()
            || manifest.old_rootfs_info.is_some()
            || manifest.partitions.iter().any(|p| p.old_partition_info.is_some());
        let actual_type = if has_old_fields {
            PayloadType::Delta
        } else {
            PayloadType::Full
        };

        let payload = &mut self.install_plan.payload;
        if payload.payload_type == PayloadType::Unknown {
            info!("Detected a {actual_type} payload");
            payload.payload_type = actual_type;
        } else if payload.payload_type != actual_type {
            return Err(Error::PayloadMismatchedType(format!(
                "Install plan expects a {} payload, but the manifest describes a {actual_type} payload",
                payload.payload_type,
            )));
        }

        let minor_version = manifest.minor_version();
        if actual_type == PayloadType::Full {
            if minor_version != FULL_PAYLOAD_MINOR_VERSION {
                return Err(Error::UnsupportedMinorVersion {
                    kind: "full",
                    minor: minor_version,
                });
            }
        } else if !(MIN_SUPPORTED_MINOR_PAYLOAD_VERSION..=MAX_SUPPORTED_MINOR_PAYLOAD_VERSION)
            .contains(&minor_version)
        {
            return Err(Error::UnsupportedMinorVersion {
                kind: "delta",
                minor: minor_version,
            });
        }

        if major_version != CHROMEOS_MAJOR_PAYLOAD_VERSION
            && (manifest.old_rootfs_info.is_some()
                || manifest.new_rootfs_info.is_some()
                || manifest.old_kernel_info.is_some()
                || manifest.new_kernel_info.is_some()
                || !manifest.install_operations.is_empty()
                || !manifest.kernel_install_operations.is_empty())
        {
            return Err(Error::PayloadMismatchedType(format!(
                "Manifest contains fields that are only supported in major version \
                 {CHROMEOS_MAJOR_PAYLOAD_VERSION}, but the payload has major version {major_version}",
            )));
        }

        let build_timestamp = self.hardware.build_timestamp();
        if manifest.max_timestamp() < build_timestamp {
            return Err(Error::PayloadTimestamp {
                max_timestamp: manifest.max_timestamp(),
                build_timestamp,
            });
        }

        if major_version == CHROMEOS_MAJOR_PAYLOAD_VERSION
            && manifest.dynamic_partition_metadata.is_some()
        {
            return Err(Error::PayloadMismatchedType(format!(
                "Dynamic partition metadata requires major version {BRILLO_MAJOR_PAYLOAD_VERSION} or newer",
            )));
        }

        Ok(())
    }

    fn parse_manifest_partitions(&mut self) -> Result<()> {
        self.block_size = u64::from(self.manifest.block_size());
        if self.block_size == 0 {
            return Err(Error::PayloadMismatchedType("Block size is 0".to_owned()));
        }

        self.partitions = if self.metadata.major_version() == BRILLO_MAJOR_PAYLOAD_VERSION {
            mem::take(&mut self.manifest.partitions)
        } else {
            legacy::normalize(&mut self.manifest, !self.install_plan.android)
        };

        let block_size = self.block_size;
        let mut install_partitions = Vec::with_capacity(self.partitions.len());

        for update in &self.partitions {
            let name = &update.partition_name;
            let invalid = |reason: &str| Error::NewPartitionInfo {
                partition: name.clone(),
                reason: reason.to_owned(),
            };

            let mut partition = Partition {
                name: name.clone(),
                block_size: self.manifest.block_size(),
                run_postinstall: update.run_postinstall(),
                ..Default::default()
            };

            if partition.run_postinstall {
                partition.postinstall_path = update
                    .postinstall_path
                    .clone()
                    .unwrap_or_else(|| DEFAULT_POSTINSTALL_PATH.to_owned());
                partition.filesystem_type = update.filesystem_type().to_owned();
                partition.postinstall_optional = update.postinstall_optional();
            }

            if let Some(info) = &update.old_partition_info {
                partition.source_size = info.size();
                partition.source_hash = info.hash().to_vec();
            }

            let Some(info) = &update.new_partition_info else {
                return Err(invalid("Missing new_partition_info"));
            };
            partition.target_size = info.size();
            partition.target_hash = info.hash().to_vec();

            if let Some(tree_extent) = &update.hash_tree_extent {
                let data_extent = update
                    .hash_tree_data_extent
                    .as_ref()
                    .ok_or_else(|| invalid("Hash tree extent without hash tree data extent"))?;
                let (data_offset, data_size) = extent_byte_range(data_extent, block_size)
                    .ok_or_else(|| invalid("Hash tree data extent out of bounds"))?;
                let (tree_offset, tree_size) = extent_byte_range(tree_extent, block_size)
                    .ok_or_else(|| invalid("Hash tree extent out of bounds"))?;

                // The tree is written right after the data is complete.
                if tree_offset < data_offset + data_size {
                    return Err(invalid("Hash tree overlaps its data"));
                }

                partition.hash_tree_algorithm = update.hash_tree_algorithm().to_owned();
                partition.hash_tree_salt = update.hash_tree_salt().to_vec();
                partition.hash_tree_data_offset = data_offset;
                partition.hash_tree_data_size = data_size;
                partition.hash_tree_offset = tree_offset;
                partition.hash_tree_size = tree_size;

                info!(
                    "Hash tree of {name:?} covers {data_offset}+{data_size} and is stored at {tree_offset}+{tree_size}",
                );
            }

            if let Some(fec_extent) = &update.fec_extent {
                let data_extent = update
                    .fec_data_extent
                    .as_ref()
                    .ok_or_else(|| invalid("FEC extent without FEC data extent"))?;
                let (data_offset, data_size) = extent_byte_range(data_extent, block_size)
                    .ok_or_else(|| invalid("FEC data extent out of bounds"))?;
                let (fec_offset, fec_size) = extent_byte_range(fec_extent, block_size)
                    .ok_or_else(|| invalid("FEC extent out of bounds"))?;

                if fec_offset < data_offset + data_size {
                    return Err(invalid("FEC overlaps its data"));
                }

                partition.fec_data_offset = data_offset;
                partition.fec_data_size = data_size;
                partition.fec_offset = fec_offset;
                partition.fec_size = fec_size;
                partition.fec_roots = update.fec_roots();

                info!(
                    "FEC of {name:?} covers {data_offset}+{data_size} and is stored at {fec_offset}+{fec_size}",
                );
            }

            debug!(
                "Partition {name:?}: {} operations, old size {}, new size {}",
                update.operations.len(),
                partition.source_size,
                partition.target_size,
            );

            install_partitions.push(partition);
        }

        self.install_plan.partitions = install_partitions;

        if let Some(slot) = self.install_plan.target_slot {
            self.init_partition_metadata(slot)?;
        }

        if !self
            .install_plan
            .load_partitions_from_slots(&*self.boot_control)
        {
            return Err(Error::PartitionDevices);
        }

        self.install_plan.dump();

        Ok(())
    }

    fn init_partition_metadata(&mut self, slot: u32) -> Result<()> {
        let mut metadata = PartitionMetadata::default();

        if let Some(dynamic) = &self.manifest.dynamic_partition_metadata {
            for group in &dynamic.groups {
                let mut entry = PartitionGroup {
                    name: group.name.clone(),
                    size: group.size(),
                    partitions: vec![],
                };

                for name in &group.partition_names {
                    let Some(p) = self.install_plan.partitions.iter().find(|p| &p.name == name)
                    else {
                        return Err(Error::PartitionMetadata(
                            format!("Dynamic partition {name:?} is not part of the manifest")
                                .into(),
                        ));
                    };

                    entry.partitions.push((name.clone(), p.target_size));
                }

                metadata.groups.push(entry);
            }
        }

        let metadata_updated = self
            .prefs
            .get_boolean(prefs::KEY_DYNAMIC_PARTITION_METADATA_UPDATED)?
            .unwrap_or(false);

        self.boot_control
            .init_partition_metadata(slot, &metadata, !metadata_updated)
            .map_err(|e| Error::PartitionMetadata(Box::new(e)))?;

        self.prefs
            .set_boolean(prefs::KEY_DYNAMIC_PARTITION_METADATA_UPDATED, true)?;

        info!("Initialized partition metadata for slot {slot}");

        Ok(())
    }

    fn open_current_partition(&mut self) -> Result<()> {
        let interactive = self.install_plan.interactive;
        let minor_version = self.minor_version();
        let partition = &self.install_plan.partitions[self.current_partition];
        let device_error = |path: Option<&Path>, source: io::Error| Error::DeviceOpen {
            partition: partition.name.clone(),
            path: path.map(|p| p.display().to_string()).unwrap_or_default(),
            source,
        };
        let no_path = || io::Error::new(io::ErrorKind::NotFound, "No device path");

        // Full payloads and in-place deltas never read from the other slot.
        if self.install_plan.payload.payload_type == PayloadType::Delta
            && minor_version != IN_PLACE_MINOR_PAYLOAD_VERSION
            && partition.source_size > 0
        {
            let path = partition
                .source_path
                .as_deref()
                .ok_or_else(|| device_error(None, no_path()))?;
            let fd = RawFileDescriptor::open(path, false, interactive)
                .map_err(|e| device_error(Some(path), e))?;

            self.source_fd = Some(Box::new(fd));
        }

        let path = partition
            .target_path
            .as_deref()
            .ok_or_else(|| device_error(None, no_path()))?;
        let mut fd = open_target_fd(path, interactive).map_err(|e| device_error(Some(path), e))?;

        info!(
            "Applying {} operations to partition {:?}",
            self.partitions[self.current_partition].operations.len(),
            partition.name,
        );

        discard_partition_tail(fd.as_mut(), partition.target_size);
        self.target_fd = Some(fd);

        // Starting a partition from its first operation means the verity data
        // of the previous partition is no longer relevant.
        if self.next_operation_num == self.partition_start(self.current_partition) {
            self.prefs.delete(prefs::KEY_VERITY_WRITTEN)?;
        }

        Ok(())
    }

    /// Lazily open the error corrected view of the current source partition.
    /// Returns whether it is available.
    fn open_current_ecc_partition(&mut self) -> bool {
        if self.source_ecc_fd.is_some() {
            return true;
        } else if self.source_ecc_open_failure {
            return false;
        } else if self.install_plan.payload.payload_type == PayloadType::Full
            || self.minor_version() == IN_PLACE_MINOR_PAYLOAD_VERSION
        {
            return false;
        }

        let partition = &self.install_plan.partitions[self.current_partition];

        let Some(layout) = self.install_plan.source_fec.get(&partition.name).copied() else {
            debug!("No FEC layout for source partition {:?}", partition.name);
            self.source_ecc_open_failure = true;
            return false;
        };
        let Some(path) = partition.source_path.as_deref() else {
            self.source_ecc_open_failure = true;
            return false;
        };

        let fd = match RawFileDescriptor::open(path, false, self.install_plan.interactive) {
            Ok(fd) => fd,
            Err(e) => {
                warn!("Failed to open {path:?} for error correction: {e}");
                self.source_ecc_open_failure = true;
                return false;
            }
        };

        match FecFileDescriptor::new(fd, layout) {
            Ok(fd) => {
                info!("Opened {path:?} with error correction");
                self.source_ecc_fd = Some(Box::new(fd));
                true
            }
            Err(e) => {
                warn!("Invalid FEC layout for {path:?}: {e}");
                self.source_ecc_open_failure = true;
                false
            }
        }
    }

    fn close_current_partition(&mut self) -> Result<()> {
        for (name, fd) in [("source", &mut self.source_fd), ("ECC source", &mut self.source_ecc_fd)] {
            if let Some(mut fd) = fd.take() {
                if let Err(e) = fd.close() {
                    error!("Failed to close {name} partition: {e}");
                }
            }
        }
        self.source_ecc_open_failure = false;

        if let Some(mut fd) = self.target_fd.take() {
            fd.close()?;
        }

        Ok(())
    }

    /// Release all devices and finalize the payload hashes. Fails if payload
    /// bytes were received but never consumed.
    pub fn close(&mut self) -> Result<()> {
        let result = self.close_current_partition();

        self.buffer.payload_hash().finalize();
        self.buffer.signed_hash().finalize();

        if !self.buffer.is_empty() {
            error!("Discarding {:?} of unused payload data", NumBytes(self.buffer.len()));
            result?;
            return Err(Error::UnconsumedData(self.buffer.len()));
        }

        result
    }

    fn validate_operation_hash(&self, op: &InstallOperation) -> Result<()> {
        let index = self.next_operation_num;

        let Some(expected) = op.data_sha256_hash.as_deref().filter(|h| !h.is_empty()) else {
            // The metadata that describes data-less operations was already
            // verified.
            if op.data_length() == 0 {
                return Ok(());
            }

            // The legacy signature operation is created before its own hash
            // is known.
            if self.manifest.signatures_offset() != 0
                && self.manifest.signatures_offset() == op.data_offset()
            {
                info!("Skipping hash verification for signature operation #{index}");
            } else if self.install_plan.hash_checks_mandatory {
                return Err(Error::OperationHashMissing { index });
            } else {
                warn!("Cannot validate operation #{index} because it has no data hash");
            }

            return Ok(());
        };

        let data_length = to_usize(op.data_length())?;
        let actual = HashCalculator::raw_hash_of_data(&self.buffer.data()[..data_length]);

        if actual.as_slice() != expected {
            return Err(Error::OperationHashMismatch {
                index,
                expected: hex::encode(expected),
                actual: hex::encode(actual),
            });
        }

        Ok(())
    }

    fn perform_operation(&mut self, kind: Type, op: &InstallOperation) -> Result<()> {
        debug!(
            "Applying operation #{} ({kind:?}): {} -> {}",
            self.next_operation_num,
            DisplayExtents(&op.src_extents),
            DisplayExtents(&op.dst_extents),
        );

        match kind {
            Type::Replace | Type::ReplaceBz | Type::ReplaceXz => {
                self.perform_replace_operation(kind, op)
            }
            Type::Zero | Type::Discard => self.perform_zero_or_discard_operation(kind, op),
            Type::Move => self.perform_move_operation(op),
            Type::Bsdiff => self.perform_bsdiff_operation(op),
            Type::SourceCopy => self.perform_source_copy_operation(op),
            Type::SourceBsdiff | Type::BrotliBsdiff | Type::Puffdiff => {
                self.perform_source_diff_operation(kind, op)
            }
        }
    }

    fn check_block_aligned(&self, op: &InstallOperation) -> Result<()> {
        for (name, length) in [("src_length", op.src_length), ("dst_length", op.dst_length)] {
            if let Some(length) = length {
                if length % self.block_size != 0 {
                    return Err(Error::InvalidOperation(format!(
                        "{name} {length} is not a multiple of the block size {}",
                        self.block_size,
                    )));
                }
            }
        }

        Ok(())
    }

    /// Source extents must lie within the size of the source partition
    /// declared in the manifest.
    fn check_source_extents(&self, op: &InstallOperation) -> Result<()> {
        let partition = &self.install_plan.partitions[self.current_partition];

        for extent in op.src_extents.iter().filter(|e| !e.is_sparse_hole()) {
            let in_bounds = extent_byte_range(extent, self.block_size)
                .is_some_and(|(start, length)| start + length <= partition.source_size);

            if !in_bounds {
                return Err(Error::InvalidOperation(format!(
                    "Source extent ({}, {}) exceeds the source size of {:?} ({} bytes)",
                    extent.start_block(),
                    extent.num_blocks(),
                    partition.name,
                    partition.source_size,
                )));
            }
        }

        Ok(())
    }

    fn perform_replace_operation(&mut self, kind: Type, op: &InstallOperation) -> Result<()> {
        // Legacy payloads carry the payload signature as a dummy operation.
        if self.extract_signature_message_from_operation(op)? {
            self.buffer.discard(true, 0);
            return Ok(());
        }

        let block_size = self.block_size;
        let target = required_fd(&mut self.target_fd, "target")?;

        let mut writer = match kind {
            Type::ReplaceBz => ExtentWriter::bzip(target, &op.dst_extents, block_size)?,
            Type::ReplaceXz => ExtentWriter::xz(target, &op.dst_extents, block_size)?,
            _ => ExtentWriter::direct(target, &op.dst_extents, block_size)?,
        };

        writer.write(self.buffer.data())?;
        writer.finish()?;

        let len = self.buffer.len();
        self.buffer.discard(true, len);

        Ok(())
    }

    fn perform_zero_or_discard_operation(&mut self, kind: Type, op: &InstallOperation) -> Result<()> {
        if op.data_offset.is_some() || op.data_length.is_some() {
            return Err(Error::InvalidOperation(format!(
                "{kind:?} operation must not have data",
            )));
        }

        let request = if kind == Type::Zero {
            BlkIoctl::ZeroOut
        } else {
            BlkIoctl::Discard
        };
        let block_size = self.block_size;
        let target = required_fd(&mut self.target_fd, "target")?;
        let mut attempt_ioctl = true;

        for extent in op.dst_extents.iter().filter(|e| !e.is_sparse_hole()) {
            let (start, length) =
                extent_byte_range(extent, block_size).ok_or(extent::Error::ExtentsTooLarge)?;

            if attempt_ioctl {
                match target.blk_ioctl(request, start, length) {
                    Ok(()) => continue,
                    Err(e) => {
                        debug!("{request:?} not usable, falling back to writing zeros: {e}");
                        attempt_ioctl = false;
                    }
                }
            }

            target.seek(SeekFrom::Start(start))?;
            target.write_zeros_exact(length)?;
        }

        Ok(())
    }

    /// Read all source blocks of an in-place operation from the target
    /// partition.
    fn read_in_place_source(&mut self, op: &InstallOperation) -> Result<Vec<u8>> {
        if op.src_extents.iter().any(Extent::is_sparse_hole) {
            return Err(Error::InvalidOperation(
                "In-place operation reads from a sparse hole".to_owned(),
            ));
        }

        let block_size = self.block_size;
        let target = required_fd(&mut self.target_fd, "target")?;
        let mut reader = ExtentReader::new(target, &op.src_extents, block_size)?;
        let mut data = vec![0u8; to_usize(reader.size())?];

        reader.read_exact(&mut data)?;

        Ok(data)
    }

    fn perform_move_operation(&mut self, op: &InstallOperation) -> Result<()> {
        // The whole source is buffered, so overlapping extents are fine.
        let data = self.read_in_place_source(op)?;

        let block_size = self.block_size;
        let target = required_fd(&mut self.target_fd, "target")?;
        let mut writer = DirectExtentWriter::new(target, &op.dst_extents, block_size)?;
        writer.write(&data)?;

        Ok(())
    }

    fn perform_bsdiff_operation(&mut self, op: &InstallOperation) -> Result<()> {
        let mut old = self.read_in_place_source(op)?;
        if let Some(src_length) = op.src_length {
            old.truncate(to_usize(src_length)?);
        }
        let old_size = old.len() as u64;

        let block_size = self.block_size;
        let target = required_fd(&mut self.target_fd, "target")?;

        {
            let mut writer = DirectExtentWriter::new(&mut *target, &op.dst_extents, block_size)?;
            bspatch::bspatch(&mut Cursor::new(old), old_size, &mut writer, self.buffer.data())?;
        }

        let len = self.buffer.len();
        self.buffer.discard(true, len);

        // Zero out the rest of the final block.
        let remainder = op.dst_length() % block_size;
        if remainder != 0 {
            let last = op.dst_extents.last().ok_or_else(|| {
                Error::InvalidOperation("Operation has no destination extents".to_owned())
            })?;
            let (start, length) =
                extent_byte_range(last, block_size).ok_or(extent::Error::ExtentsTooLarge)?;
            let zeros = block_size - remainder;

            target.seek(SeekFrom::Start(start + length - zeros))?;
            target.write_zeros_exact(zeros)?;
        }

        Ok(())
    }

    fn source_hash_mismatch(
        &mut self,
        op: &InstallOperation,
        calculated: Option<&[u8]>,
    ) -> Error {
        let expected = hex::encode(op.src_sha256_hash());
        let actual = util::hex_or_none(calculated);

        error!(
            "The hash of the source data on disk for this operation does not match the \
             expected value. The payload may be for a different version or the source \
             partition may have been modified, for example, by mounting it.",
        );
        error!("Expected:   sha256|hex = {expected}");
        error!("Calculated: sha256|hex = {actual}");
        error!("Operation source blocks: {}", DisplayExtents(&op.src_extents));

        if let Some(fd) = &mut self.source_fd {
            ext4::log_mount_history(&mut **fd);
        }

        Error::SourceHashMismatch { expected, actual }
    }

    fn record_ecc_recovery(&mut self) -> Result<()> {
        self.source_ecc_recovered_failures += 1;
        let count = self.source_ecc_recovered_failures;

        warn!("Recovered source data with error correction ({count} times so far)");

        if self
            .install_plan
            .max_source_ecc_recoveries
            .is_some_and(|max| count > max)
        {
            return Err(Error::TooManyEccRecoveries(count));
        }

        Ok(())
    }

    fn perform_source_copy_operation(&mut self, op: &InstallOperation) -> Result<()> {
        self.check_block_aligned(op)?;
        self.check_source_extents(op)?;

        let block_size = self.block_size;
        let src = &op.src_extents;
        let dst = &op.dst_extents;

        if self.source_fd.is_none() {
            return Err(Error::InvalidOperation("No source partition is open".to_owned()));
        }

        let Some(expected) = op.src_sha256_hash.as_deref() else {
            // Without a hash, the raw data cannot be checked, so prefer the
            // error corrected device. It may be shorter than the partition.
            if self.open_current_ecc_partition() {
                let ecc = required_fd(&mut self.source_ecc_fd, "ECC source")?;
                let target = required_fd(&mut self.target_fd, "target")?;

                match hash_of_extents(ecc, Some(target), src, dst, block_size) {
                    Ok(_) => return Ok(()),
                    Err(e) => warn!("Failed to copy from error corrected device: {e}"),
                }
            }

            let source = required_fd(&mut self.source_fd, "source")?;
            let target = required_fd(&mut self.target_fd, "target")?;
            hash_of_extents(source, Some(target), src, dst, block_size)?;

            return Ok(());
        };

        let raw_hash = {
            let source = required_fd(&mut self.source_fd, "source")?;
            let target = required_fd(&mut self.target_fd, "target")?;

            match hash_of_extents(source, Some(target), src, dst, block_size) {
                Ok(h) if h == expected => return Ok(()),
                Ok(h) => Some(h),
                Err(e) => {
                    warn!("Failed to copy from source device: {e}");
                    None
                }
            }
        };

        if !self.open_current_ecc_partition() {
            return Err(self.source_hash_mismatch(op, raw_hash.as_deref()));
        }

        warn!(
            "Source hash from raw device mismatched: found {}, expected {}",
            util::hex_or_none(raw_hash.as_deref()),
            hex::encode(expected),
        );

        let ecc_hash = {
            let ecc = required_fd(&mut self.source_ecc_fd, "ECC source")?;
            let target = required_fd(&mut self.target_fd, "target")?;
            hash_of_extents(ecc, Some(target), src, dst, block_size)?
        };

        if ecc_hash != expected {
            return Err(self.source_hash_mismatch(op, Some(&ecc_hash)));
        }

        self.record_ecc_recovery()
    }

    /// Pick the source descriptor whose data matches the operation's source
    /// hash, falling back to error correction as needed.
    fn choose_source_fd(&mut self, op: &InstallOperation) -> Result<SourceChoice> {
        let block_size = self.block_size;

        if self.source_fd.is_none() {
            return Err(Error::InvalidOperation("No source partition is open".to_owned()));
        }

        let Some(expected) = op.src_sha256_hash.as_deref() else {
            // The error corrected device can only be used if every extent is
            // readable through it.
            if self.open_current_ecc_partition() {
                let ecc = required_fd(&mut self.source_ecc_fd, "ECC source")?;

                if hash_of_extents(ecc, None, &op.src_extents, &[], block_size).is_ok() {
                    return Ok(SourceChoice::ErrorCorrected);
                }
            }

            return Ok(SourceChoice::Raw);
        };

        let raw_hash = {
            let source = required_fd(&mut self.source_fd, "source")?;

            match hash_of_extents(source, None, &op.src_extents, &[], block_size) {
                Ok(h) if h == expected => return Ok(SourceChoice::Raw),
                Ok(h) => Some(h),
                Err(e) => {
                    warn!("Failed to read source device: {e}");
                    None
                }
            }
        };

        if !self.open_current_ecc_partition() {
            return Err(self.source_hash_mismatch(op, raw_hash.as_deref()));
        }

        warn!(
            "Source hash from raw device mismatched: found {}, expected {}",
            util::hex_or_none(raw_hash.as_deref()),
            hex::encode(expected),
        );

        let ecc_hash = {
            let ecc = required_fd(&mut self.source_ecc_fd, "ECC source")?;
            hash_of_extents(ecc, None, &op.src_extents, &[], block_size)?
        };

        if ecc_hash != expected {
            return Err(self.source_hash_mismatch(op, Some(&ecc_hash)));
        }

        self.record_ecc_recovery()?;

        Ok(SourceChoice::ErrorCorrected)
    }

    fn perform_source_diff_operation(&mut self, kind: Type, op: &InstallOperation) -> Result<()> {
        if kind != Type::Puffdiff {
            self.check_block_aligned(op)?;
        }
        self.check_source_extents(op)?;

        let choice = self.choose_source_fd(op)?;
        let block_size = self.block_size;

        let source = match choice {
            SourceChoice::Raw => required_fd(&mut self.source_fd, "source")?,
            SourceChoice::ErrorCorrected => required_fd(&mut self.source_ecc_fd, "ECC source")?,
        };
        let target = required_fd(&mut self.target_fd, "target")?;

        let mut reader = ExtentReader::new(source, &op.src_extents, block_size)?;
        let old_size = reader.size();
        let mut writer = DirectExtentWriter::new(target, &op.dst_extents, block_size)?;
        let patch = self.buffer.data();

        if kind == Type::Puffdiff {
            puffin::puffpatch(&mut reader, old_size, &mut writer, patch, puffin::DEFAULT_CACHE_SIZE)?;
        } else {
            bspatch::bspatch(&mut reader, old_size, &mut writer, patch)?;
        }

        let len = self.buffer.len();
        self.buffer.discard(true, len);

        Ok(())
    }

    /// Write the hash tree and FEC data once the last operation of a
    /// partition has been applied.
    fn write_partition_verity(&mut self) -> Result<()> {
        let partition = &self.install_plan.partitions[self.current_partition];
        if !partition.has_verity() {
            return Ok(());
        }

        if self.prefs.get_boolean(prefs::KEY_VERITY_WRITTEN)?.unwrap_or(false) {
            info!("Verity data of {:?} was already written", partition.name);
            return Ok(());
        }

        let target = required_fd(&mut self.target_fd, "target")?;
        verity::write_verity(target, partition).map_err(|e| Error::Verity {
            partition: partition.name.clone(),
            source: Box::new(e),
        })?;

        self.prefs.set_boolean(prefs::KEY_VERITY_WRITTEN, true)?;

        Ok(())
    }

    fn extract_signature_message_from_operation(&mut self, op: &InstallOperation) -> Result<bool> {
        if op.r#type != i32::from(Type::Replace)
            || self.manifest.signatures_offset.is_none()
            || self.manifest.signatures_offset() != op.data_offset()
        {
            return Ok(false);
        }

        if self.manifest.signatures_size != Some(op.data_length()) {
            return Err(Error::InvalidOperation(format!(
                "Signature operation has {} bytes, but manifest declares {:?}",
                op.data_length(),
                self.manifest.signatures_size,
            )));
        }

        self.extract_signature_message()?;

        Ok(true)
    }

    fn extract_signature_message(&mut self) -> Result<()> {
        if self.signatures_message_data.is_some() {
            return Err(Error::InvalidState("Signature was already extracted".to_owned()));
        } else if self.buffer.offset() != self.manifest.signatures_offset() {
            return Err(Error::SignatureOffsetMismatch {
                expected: self.manifest.signatures_offset(),
                actual: self.buffer.offset(),
            });
        }

        let size = to_usize(self.manifest.signatures_size())?;
        if self.buffer.len() < size {
            return Err(Error::InvalidState(format!(
                "Need {size} bytes of signature data, but have {}",
                self.buffer.len(),
            )));
        }

        let data = self.buffer.data()[..size].to_vec();

        // The download phase is not repeated on resume, so the blob must be
        // saved.
        if let Err(e) = self
            .prefs
            .set_string(prefs::KEY_UPDATE_STATE_SIGNATURE_BLOB, &STANDARD.encode(&data))
        {
            warn!("Unable to store the signature blob: {e}");
        }

        info!(
            "Extracted signature data of size {size} at {}",
            self.manifest.signatures_offset(),
        );

        self.signatures_message_data = Some(data);

        Ok(())
    }

    /// Check the size, the hash and the signature of the whole payload. Must
    /// only be called after all data has been written.
    pub fn verify_payload(&mut self, expected_hash: &[u8], expected_size: u64) -> Result<()> {
        let public_key = self
            .load_public_key()
            .map_err(|e| Error::PayloadSignature(PubKeyError::Load(e)))?;

        let actual_size = self.metadata.data_offset() + self.buffer.offset();
        if actual_size != expected_size {
            return Err(Error::PayloadSizeMismatch {
                expected: expected_size,
                actual: actual_size,
            });
        }

        if expected_hash.is_empty() {
            return Err(Error::PayloadHashUnavailable);
        }

        let actual_hash = self.buffer.payload_hash().finalize();
        if actual_hash.as_slice() != expected_hash {
            return Err(Error::PayloadHashMismatch {
                expected: hex::encode(expected_hash),
                actual: hex::encode(actual_hash),
            });
        }

        let Some(public_key) = public_key else {
            warn!("Not verifying payload signature: no public key");
            return Ok(());
        };

        let blob = self
            .signatures_message_data
            .as_deref()
            .filter(|d| !d.is_empty())
            .ok_or(Error::SignatureBlobMissing)?;
        let signatures = Signatures::decode(blob)
            .map_err(|e| Error::PayloadSignature(PubKeyError::Parse(e)))?;

        let signed_hash = self.buffer.signed_hash().finalize();
        crypto::verify_signatures(&public_key, &signed_hash, &signatures)
            .map_err(|e| Error::PayloadSignature(PubKeyError::Verify(e)))?;

        info!("Payload hash and signature match");

        Ok(())
    }

    fn update_overall_progress(&mut self, force_log: bool, message_prefix: &str) {
        let mut force_log = force_log;
        let mut new_overall_progress = 0;
        let payload_size = self.install_plan.payload.size;

        // Download progress is capped in case more data arrives than expected.
        // Without a known size, operations carry the whole weight.
        let mut operations_weight = PROGRESS_OPERATIONS_WEIGHT;
        if payload_size > 0 {
            new_overall_progress +=
                int_ratio(self.total_bytes_received, payload_size, PROGRESS_DOWNLOAD_WEIGHT)
                    .min(PROGRESS_DOWNLOAD_WEIGHT);
        } else {
            operations_weight += PROGRESS_DOWNLOAD_WEIGHT;
        }

        if self.num_total_operations > 0 {
            new_overall_progress += int_ratio(
                self.next_operation_num as u64,
                self.num_total_operations as u64,
                operations_weight,
            );
        }

        if new_overall_progress < self.overall_progress {
            warn!(
                "Progress counter receded from {}% to {new_overall_progress}%",
                self.overall_progress,
            );
            force_log = true;
        }
        self.overall_progress = new_overall_progress;

        let now = Instant::now();
        let progress_chunk = self.overall_progress * PROGRESS_LOG_MAX_CHUNKS / 100;

        if force_log
            || progress_chunk > self.last_progress_chunk
            || self.forced_progress_log_time.is_none_or(|t| now > t)
        {
            self.forced_progress_log_time = Some(now + PROGRESS_LOG_TIMEOUT);
            self.log_progress(message_prefix);
        }

        self.last_progress_chunk = progress_chunk;
    }

    fn log_progress(&self, message_prefix: &str) {
        let (total_operations, operations_percent) = if self.num_total_operations > 0 {
            (
                self.num_total_operations.to_string(),
                format!(
                    " ({}%)",
                    int_ratio(
                        self.next_operation_num as u64,
                        self.num_total_operations as u64,
                        100,
                    ),
                ),
            )
        } else {
            ("?".to_owned(), String::new())
        };

        let payload_size = self.install_plan.payload.size;
        let (size, downloaded_percent) = if payload_size > 0 {
            (
                payload_size.to_string(),
                format!(" ({}%)", int_ratio(self.total_bytes_received, payload_size, 100)),
            )
        } else {
            ("?".to_owned(), String::new())
        };

        info!(
            "{message_prefix}{}/{total_operations} operations{operations_percent}, \
             {}/{size} bytes downloaded{downloaded_percent}, overall progress {}%",
            self.next_operation_num, self.total_bytes_received, self.overall_progress,
        );
    }

    /// Persist enough state to continue from the next operation. Unless
    /// `force` is set, this is throttled.
    fn checkpoint_update_progress(&mut self, force: bool) -> Result<()> {
        let now = Instant::now();
        if !force && self.update_checkpoint_time.is_some_and(|t| now <= t) {
            return Ok(());
        }
        self.update_checkpoint_time = Some(now + self.update_checkpoint_wait);

        self.terminator.set_exit_blocked(true);

        let buffer_offset = self.buffer.offset();

        if self.last_updated_buffer_offset != Some(buffer_offset) {
            // Invalidate the checkpoint in case the process dies halfway
            // through writing it.
            Self::reset_update_progress(&mut *self.prefs, true)?;

            let payload_context = self.buffer.payload_hash().context();
            let signed_context = self.buffer.signed_hash().context();

            self.prefs
                .set_string(prefs::KEY_UPDATE_STATE_SHA256_CONTEXT, &payload_context)?;
            self.prefs
                .set_string(prefs::KEY_UPDATE_STATE_SIGNED_SHA256_CONTEXT, &signed_context)?;
            self.prefs
                .set_int64(prefs::KEY_UPDATE_STATE_NEXT_DATA_OFFSET, to_i64(buffer_offset)?)?;
            self.last_updated_buffer_offset = Some(buffer_offset);

            let next_data_length = if self.next_operation_num < self.num_total_operations {
                let index = self
                    .acc_num_operations
                    .iter()
                    .position(|n| *n > self.next_operation_num)
                    .unwrap_or(self.partitions.len() - 1);
                let op_index = self.next_operation_num - self.partition_start(index);

                self.partitions[index].operations[op_index].data_length()
            } else {
                0
            };

            self.prefs
                .set_int64(prefs::KEY_UPDATE_STATE_NEXT_DATA_LENGTH, to_i64(next_data_length)?)?;
        }

        self.prefs.set_int64(
            prefs::KEY_UPDATE_STATE_NEXT_OPERATION,
            to_i64(self.next_operation_num as u64)?,
        )?;

        debug!(
            "Checkpointed at operation {} and data offset {buffer_offset}",
            self.next_operation_num,
        );

        Ok(())
    }

    /// Restore the state of an interrupted update, if there is one.
    fn prime_update_state(&mut self) -> Result<()> {
        let next_operation = self
            .prefs
            .get_int64(prefs::KEY_UPDATE_STATE_NEXT_OPERATION)?
            .unwrap_or(UPDATE_STATE_OPERATION_INVALID);
        if next_operation <= 0 {
            // A new update. There is nothing to restore.
            return Ok(());
        }

        let next_operation = usize::try_from(next_operation)
            .ok()
            .filter(|n| *n <= self.num_total_operations)
            .ok_or_else(|| {
                Error::InvalidState(format!(
                    "Next operation {next_operation} exceeds total operations {}",
                    self.num_total_operations,
                ))
            })?;

        let next_data_offset = self
            .prefs
            .get_int64(prefs::KEY_UPDATE_STATE_NEXT_DATA_OFFSET)?
            .and_then(|o| u64::try_from(o).ok())
            .ok_or_else(|| Error::InvalidState("Missing next data offset".to_owned()))?;

        let mut signed_hash = self.buffer.signed_hash().clone();
        if let Some(context) = self
            .prefs
            .get_string(prefs::KEY_UPDATE_STATE_SIGNED_SHA256_CONTEXT)?
            .filter(|c| !c.is_empty())
        {
            signed_hash.set_context(&context)?;
        }

        // The signature blob only exists if the interrupted attempt got that
        // far.
        if let Some(blob) = self
            .prefs
            .get_string(prefs::KEY_UPDATE_STATE_SIGNATURE_BLOB)?
            .filter(|b| !b.is_empty())
        {
            let data = STANDARD
                .decode(blob)
                .map_err(|e| Error::InvalidState(format!("Invalid signature blob: {e}")))?;
            self.signatures_message_data = Some(data);
        }

        let context = self
            .prefs
            .get_string(prefs::KEY_UPDATE_STATE_SHA256_CONTEXT)?
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::InvalidState("Missing payload hash context".to_owned()))?;
        let mut payload_hash = HashCalculator::new();
        payload_hash.set_context(&context)?;

        let metadata_size = self.prefs.get_int64(prefs::KEY_MANIFEST_METADATA_SIZE)?;
        if metadata_size != Some(to_i64(self.metadata.metadata_size())?) {
            return Err(Error::InvalidState(format!(
                "Saved metadata size {metadata_size:?} does not match payload ({})",
                self.metadata.metadata_size(),
            )));
        }

        let signature_size = self.prefs.get_int64(prefs::KEY_MANIFEST_SIGNATURE_SIZE)?;
        if signature_size != Some(self.metadata.metadata_signature_size().into()) {
            return Err(Error::InvalidState(format!(
                "Saved metadata signature size {signature_size:?} does not match payload ({})",
                self.metadata.metadata_signature_size(),
            )));
        }

        self.next_operation_num = next_operation;
        self.buffer.restore(next_data_offset, payload_hash, signed_hash);
        self.last_updated_buffer_offset = Some(next_data_offset);

        // Data before the offset does not need to be downloaded again.
        self.total_bytes_received += next_data_offset;

        // Count the resume as a failure until it succeeds.
        let failures = self
            .prefs
            .get_int64(prefs::KEY_RESUMED_UPDATE_FAILURES)?
            .unwrap_or(0)
            + 1;
        self.prefs
            .set_int64(prefs::KEY_RESUMED_UPDATE_FAILURES, failures)?;

        info!(
            "Resuming update at operation {next_operation} and data offset {next_data_offset} \
             (resumed {failures} times)",
        );

        Ok(())
    }

    /// Whether the persisted state describes a resumable attempt at the update
    /// identified by `response_hash`.
    pub fn can_resume_update(prefs: &dyn Prefs, response_hash: &str) -> bool {
        let check = || -> std::result::Result<bool, prefs::Error> {
            let next_operation = prefs.get_int64(prefs::KEY_UPDATE_STATE_NEXT_OPERATION)?;
            if !next_operation.is_some_and(|n| n > 0) {
                return Ok(false);
            }

            let interrupted_hash = prefs.get_string(prefs::KEY_UPDATE_CHECK_RESPONSE_HASH)?;
            if !interrupted_hash.is_some_and(|h| !h.is_empty() && h == response_hash) {
                return Ok(false);
            }

            // This is optional, but must be within the limit if present.
            let failures = prefs.get_int64(prefs::KEY_RESUMED_UPDATE_FAILURES)?;
            if failures.is_some_and(|f| f > MAX_RESUMED_UPDATE_FAILURES) {
                return Ok(false);
            }

            let next_data_offset = prefs.get_int64(prefs::KEY_UPDATE_STATE_NEXT_DATA_OFFSET)?;
            if !next_data_offset.is_some_and(|o| o >= 0) {
                return Ok(false);
            }

            let context = prefs.get_string(prefs::KEY_UPDATE_STATE_SHA256_CONTEXT)?;
            if !context.is_some_and(|c| !c.is_empty()) {
                return Ok(false);
            }

            let metadata_size = prefs.get_int64(prefs::KEY_MANIFEST_METADATA_SIZE)?;
            if !metadata_size.is_some_and(|s| s > 0) {
                return Ok(false);
            }

            let signature_size = prefs.get_int64(prefs::KEY_MANIFEST_SIGNATURE_SIZE)?;

            Ok(signature_size.is_some_and(|s| s >= 0))
        };

        check().unwrap_or_else(|e| {
            warn!("Failed to read update state: {e}");
            false
        })
    }

    /// Invalidate the persisted progress. A quick reset only invalidates the
    /// next operation, which is enough to prevent resuming.
    pub fn reset_update_progress(prefs: &mut dyn Prefs, quick: bool) -> Result<()> {
        prefs.set_int64(
            prefs::KEY_UPDATE_STATE_NEXT_OPERATION,
            UPDATE_STATE_OPERATION_INVALID,
        )?;

        if !quick {
            prefs.set_int64(prefs::KEY_UPDATE_STATE_NEXT_DATA_OFFSET, -1)?;
            prefs.set_int64(prefs::KEY_UPDATE_STATE_NEXT_DATA_LENGTH, 0)?;
            prefs.set_string(prefs::KEY_UPDATE_STATE_SHA256_CONTEXT, "")?;
            prefs.set_string(prefs::KEY_UPDATE_STATE_SIGNED_SHA256_CONTEXT, "")?;
            prefs.set_string(prefs::KEY_UPDATE_STATE_SIGNATURE_BLOB, "")?;
            prefs.set_int64(prefs::KEY_MANIFEST_METADATA_SIZE, -1)?;
            prefs.set_int64(prefs::KEY_MANIFEST_SIGNATURE_SIZE, -1)?;
            prefs.set_int64(prefs::KEY_RESUMED_UPDATE_FAILURES, 0)?;
            prefs.delete(prefs::KEY_VERITY_WRITTEN)?;
            prefs.delete(prefs::KEY_DYNAMIC_PARTITION_METADATA_UPDATED)?;
        }

        Ok(())
    }

    /// Where a resumed attempt should read the payload from: the metadata
    /// (header, manifest and signature) spans `[0, .0)` and must be fed
    /// first, followed by the data starting at `.0 + .1`.
    pub fn resume_offsets(prefs: &dyn Prefs) -> Result<Option<(u64, u64)>> {
        let metadata_size = prefs.get_int64(prefs::KEY_MANIFEST_METADATA_SIZE)?;
        let signature_size = prefs.get_int64(prefs::KEY_MANIFEST_SIGNATURE_SIZE)?;
        let next_data_offset = prefs.get_int64(prefs::KEY_UPDATE_STATE_NEXT_DATA_OFFSET)?;

        let (Some(metadata_size), Some(signature_size), Some(next_data_offset)) = (
            metadata_size.and_then(|s| u64::try_from(s).ok()).filter(|s| *s > 0),
            signature_size.and_then(|s| u64::try_from(s).ok()),
            next_data_offset.and_then(|o| u64::try_from(o).ok()),
        ) else {
            return Ok(None);
        };

        let data_offset = metadata_size
            .checked_add(signature_size)
            .ok_or_else(|| Error::InvalidState("Metadata size overflows".to_owned()))?;

        Ok(Some((data_offset, next_data_offset)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::prefs::MemoryPrefs;

    fn resumable_state(prefs: &mut dyn Prefs) {
        prefs.set_int64(prefs::KEY_UPDATE_STATE_NEXT_OPERATION, 3).unwrap();
        prefs.set_string(prefs::KEY_UPDATE_CHECK_RESPONSE_HASH, "abc").unwrap();
        prefs.set_int64(prefs::KEY_UPDATE_STATE_NEXT_DATA_OFFSET, 4096).unwrap();
        prefs
            .set_string(prefs::KEY_UPDATE_STATE_SHA256_CONTEXT, &HashCalculator::new().context())
            .unwrap();
        prefs.set_int64(prefs::KEY_MANIFEST_METADATA_SIZE, 100).unwrap();
        prefs.set_int64(prefs::KEY_MANIFEST_SIGNATURE_SIZE, 0).unwrap();
    }

    #[test]
    fn can_resume() {
        let mut prefs = MemoryPrefs::new();
        assert!(!DeltaPerformer::can_resume_update(&prefs, "abc"));

        resumable_state(&mut prefs);
        assert!(DeltaPerformer::can_resume_update(&prefs, "abc"));
        assert!(!DeltaPerformer::can_resume_update(&prefs, "def"));
        assert_eq!(
            DeltaPerformer::resume_offsets(&prefs).unwrap(),
            Some((100, 4096)),
        );

        prefs
            .set_int64(prefs::KEY_RESUMED_UPDATE_FAILURES, MAX_RESUMED_UPDATE_FAILURES)
            .unwrap();
        assert!(DeltaPerformer::can_resume_update(&prefs, "abc"));
        prefs
            .set_int64(prefs::KEY_RESUMED_UPDATE_FAILURES, MAX_RESUMED_UPDATE_FAILURES + 1)
            .unwrap();
        assert!(!DeltaPerformer::can_resume_update(&prefs, "abc"));
    }

    #[test]
    fn reset_progress() {
        let mut prefs = MemoryPrefs::new();
        resumable_state(&mut prefs);
        prefs.set_boolean(prefs::KEY_VERITY_WRITTEN, true).unwrap();

        DeltaPerformer::reset_update_progress(&mut prefs, true).unwrap();
        assert!(!DeltaPerformer::can_resume_update(&prefs, "abc"));
        assert_eq!(
            prefs.get_int64(prefs::KEY_UPDATE_STATE_NEXT_DATA_OFFSET).unwrap(),
            Some(4096),
        );

        DeltaPerformer::reset_update_progress(&mut prefs, false).unwrap();
        assert_eq!(
            prefs.get_int64(prefs::KEY_UPDATE_STATE_NEXT_DATA_OFFSET).unwrap(),
            Some(-1),
        );
        assert_eq!(prefs.get_boolean(prefs::KEY_VERITY_WRITTEN).unwrap(), None);
        assert_eq!(DeltaPerformer::resume_offsets(&prefs).unwrap(), None);
        // The response hash identifies the update and survives.
        assert_eq!(
            prefs.get_string(prefs::KEY_UPDATE_CHECK_RESPONSE_HASH).unwrap(),
            Some("abc".to_owned()),
        );
    }

    #[test]
    fn ratios() {
        assert_eq!(int_ratio(1, 3, 100), 33);
        assert_eq!(int_ratio(u64::MAX, u64::MAX, 50), 50);
        assert_eq!(int_ratio(5, 0, 50), 0);
    }

    #[test]
    fn extent_ranges() {
        assert_eq!(extent_byte_range(&Extent::new(2, 3), 4096), Some((8192, 12288)));
        assert_eq!(extent_byte_range(&Extent::new(u64::MAX, 1), 4096), None);
    }
}
