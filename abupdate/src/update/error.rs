// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, io};

use thiserror::Error;

use crate::{crypto, extent, format, hash, update::prefs};

/// Flat result codes reported to whoever drives the update. Several distinct
/// [`Error`] variants may map to the same code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Success,
    MetadataParseError,
    MetadataSignatureError,
    DownloadInvalidMetadataSize,
    DownloadMetadataSignatureMissingError,
    UnsupportedMajorPayloadVersion,
    UnsupportedMinorVersion,
    PayloadMismatchedType,
    PayloadTimestampError,
    NewPartitionInfoError,
    OperationExecutionError,
    OperationHashMismatch,
    OperationHashMissing,
    SourceHashMismatch,
    DeviceOpenError,
    StateInitializationError,
    PayloadVerificationError,
    PayloadSizeMismatchError,
    PayloadHashMismatchError,
    SignedDeltaPayloadExpectedError,
    PubKeyVerificationError,
    FilesystemVerifierError,
    UserCanceled,
    InternalLibError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to parse payload metadata")]
    MetadataParse(#[source] format::payload::Error),
    #[error("Metadata size in payload ({actual}) does not match install plan ({expected})")]
    InvalidMetadataSize { expected: u64, actual: u64 },
    #[error("Metadata signature is required, but missing")]
    MetadataSignatureMissing,
    #[error("Failed to verify metadata signature")]
    MetadataSignature(#[source] format::payload::Error),
    #[error("Failed to load public key for metadata verification")]
    MetadataPublicKey(#[source] crypto::Error),
    #[error("Unsupported major payload version: {0}")]
    UnsupportedMajorVersion(u64),
    #[error("Unsupported minor version {minor} for {kind} payload")]
    UnsupportedMinorVersion { kind: &'static str, minor: u32 },
    #[error("Payload type mismatch: {0}")]
    PayloadMismatchedType(String),
    #[error("Payload timestamp {max_timestamp} is older than build timestamp {build_timestamp}")]
    PayloadTimestamp {
        max_timestamp: i64,
        build_timestamp: i64,
    },
    #[error("Invalid partition {partition:?}: {reason}")]
    NewPartitionInfo { partition: String, reason: String },
    #[error("Failed to open partition {partition:?} at {path:?}")]
    DeviceOpen {
        partition: String,
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to initialize partition metadata")]
    PartitionMetadata(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Unable to determine all partition device paths")]
    PartitionDevices,
    #[error("Operation #{index} ({kind}) failed")]
    OperationExecution {
        index: usize,
        kind: String,
        #[source]
        source: Box<Error>,
    },
    #[error("Operation failed: {0}")]
    InvalidOperation(String),
    #[error("Expected data offset {expected}, but buffer is at {actual}")]
    DataOffsetMismatch { expected: u64, actual: u64 },
    #[error("Operation #{index} data hash mismatch: expected {expected}, but have {actual}")]
    OperationHashMismatch {
        index: usize,
        expected: String,
        actual: String,
    },
    #[error("Operation #{index} has no data hash")]
    OperationHashMissing { index: usize },
    #[error("Source hash mismatch: expected {expected}, but have {actual}")]
    SourceHashMismatch { expected: String, actual: String },
    #[error("Too many source blocks had to be recovered with FEC: {0}")]
    TooManyEccRecoveries(u64),
    #[error("Failed to access update state")]
    State(#[from] prefs::Error),
    #[error("Invalid update state: {0}")]
    InvalidState(String),
    #[error("Failed to restore update state")]
    StateInitialization(#[source] Box<Error>),
    #[error("Signature blob location {actual} does not match expected {expected}")]
    SignatureOffsetMismatch { expected: u64, actual: u64 },
    #[error("Payload hash is not available")]
    PayloadHashUnavailable,
    #[error("Payload size mismatch: expected {expected}, but have {actual}")]
    PayloadSizeMismatch { expected: u64, actual: u64 },
    #[error("Payload hash mismatch: expected {expected}, but have {actual}")]
    PayloadHashMismatch { expected: String, actual: String },
    #[error("Payload is expected to be signed, but has no signature")]
    SignatureBlobMissing,
    #[error("Failed to verify payload signature")]
    PayloadSignature(#[source] PubKeyError),
    #[error("Failed to write verity data for {partition:?}")]
    Verity {
        partition: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Update canceled: {0}")]
    Canceled(ErrorCode),
    #[error("{0} bytes of payload data were not consumed")]
    UnconsumedData(usize),
    #[error("Failed to apply bsdiff patch")]
    Bspatch(#[from] format::bspatch::Error),
    #[error("Failed to apply puffin patch")]
    Puffpatch(#[from] format::puffin::Error),
    #[error("Extent error")]
    Extent(#[from] extent::Error),
    #[error("Hash context error")]
    Hash(#[from] hash::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

/// Reasons the whole-payload signature could not be checked.
#[derive(Debug, Error)]
pub enum PubKeyError {
    #[error("Failed to load public key")]
    Load(#[source] crypto::Error),
    #[error("Failed to parse signature blob")]
    Parse(#[source] prost::DecodeError),
    #[error("Signature does not match")]
    Verify(#[source] crypto::Error),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::MetadataParse(_) => ErrorCode::MetadataParseError,
            Self::InvalidMetadataSize { .. } => ErrorCode::DownloadInvalidMetadataSize,
            Self::MetadataSignatureMissing => ErrorCode::DownloadMetadataSignatureMissingError,
            Self::MetadataSignature(_) | Self::MetadataPublicKey(_) => {
                ErrorCode::MetadataSignatureError
            }
            Self::UnsupportedMajorVersion(_) => ErrorCode::UnsupportedMajorPayloadVersion,
            Self::UnsupportedMinorVersion { .. } => ErrorCode::UnsupportedMinorVersion,
            Self::PayloadMismatchedType(_) => ErrorCode::PayloadMismatchedType,
            Self::PayloadTimestamp { .. } => ErrorCode::PayloadTimestampError,
            Self::NewPartitionInfo { .. } => ErrorCode::NewPartitionInfoError,
            Self::DeviceOpen { .. } | Self::PartitionMetadata(_) | Self::PartitionDevices => {
                ErrorCode::DeviceOpenError
            }
            Self::OperationExecution { source, .. } => match source.code() {
                // Hash and cancellation failures keep their specific codes.
                c @ (ErrorCode::SourceHashMismatch
                | ErrorCode::StateInitializationError
                | ErrorCode::OperationHashMismatch
                | ErrorCode::OperationHashMissing) => c,
                _ => ErrorCode::OperationExecutionError,
            },
            Self::InvalidOperation(_)
            | Self::DataOffsetMismatch { .. }
            | Self::Bspatch(_)
            | Self::Puffpatch(_)
            | Self::Extent(_)
            | Self::Io(_) => ErrorCode::OperationExecutionError,
            Self::OperationHashMismatch { .. } => ErrorCode::OperationHashMismatch,
            Self::OperationHashMissing { .. } => ErrorCode::OperationHashMissing,
            Self::SourceHashMismatch { .. } => ErrorCode::SourceHashMismatch,
            Self::TooManyEccRecoveries(_)
            | Self::InvalidState(_)
            | Self::StateInitialization(_) => ErrorCode::StateInitializationError,
            Self::State(_) | Self::Hash(_) => ErrorCode::InternalLibError,
            Self::SignatureOffsetMismatch { .. } | Self::PayloadHashUnavailable => {
                ErrorCode::PayloadVerificationError
            }
            Self::PayloadSizeMismatch { .. } => ErrorCode::PayloadSizeMismatchError,
            Self::PayloadHashMismatch { .. } => ErrorCode::PayloadHashMismatchError,
            Self::SignatureBlobMissing => ErrorCode::SignedDeltaPayloadExpectedError,
            Self::PayloadSignature(_) => ErrorCode::PubKeyVerificationError,
            Self::Verity { .. } => ErrorCode::FilesystemVerifierError,
            Self::Canceled(c) => *c,
            Self::UnconsumedData(_) => ErrorCode::OperationExecutionError,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
