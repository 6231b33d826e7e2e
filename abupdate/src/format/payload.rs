// SPDX-FileCopyrightText: 2022-2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Payload header and manifest parsing.
//!
//! A payload begins with:
//!
//! ```text
//! magic               "CrAU"
//! major_version       u64 BE
//! manifest_size       u64 BE
//! metadata_sig_size   u32 BE          (major version 2 only)
//! manifest            [manifest_size]
//! metadata_signature  [metadata_sig_size]
//! ```
//!
//! The header plus the manifest is the "metadata". The data blobs referenced
//! by the operations follow the metadata signature.

use std::mem;

use base64::{Engine, engine::general_purpose::STANDARD};
use prost::Message;
use rsa::RsaPublicKey;
use thiserror::Error;
use tracing::{debug, info};
use zerocopy::{FromBytes, byteorder::big_endian};
use zerocopy_derive::{FromBytes, Immutable, KnownLayout, Unaligned};

use crate::{
    crypto,
    hash::HashCalculator,
    protobuf::chromeos_update_engine::{DeltaArchiveManifest, Signatures},
};

pub const PAYLOAD_MAGIC: &[u8; 4] = b"CrAU";

/// Legacy layout with separate root and kernel operation lists.
pub const CHROMEOS_MAJOR_PAYLOAD_VERSION: u64 = 1;
/// Layout with a partition list and an in-band metadata signature.
pub const BRILLO_MAJOR_PAYLOAD_VERSION: u64 = 2;

pub const MIN_SUPPORTED_MAJOR_PAYLOAD_VERSION: u64 = CHROMEOS_MAJOR_PAYLOAD_VERSION;
pub const MAX_SUPPORTED_MAJOR_PAYLOAD_VERSION: u64 = BRILLO_MAJOR_PAYLOAD_VERSION;

pub const FULL_PAYLOAD_MINOR_VERSION: u32 = 0;
/// `MOVE` and `BSDIFF` within the target partition.
pub const IN_PLACE_MINOR_PAYLOAD_VERSION: u32 = 1;
/// `SOURCE_COPY` and `SOURCE_BSDIFF` from the source slot.
pub const SOURCE_MINOR_PAYLOAD_VERSION: u32 = 2;
/// Adds `src_sha256_hash`.
pub const OP_SRC_HASH_MINOR_PAYLOAD_VERSION: u32 = 3;
pub const BROTLI_BSDIFF_MINOR_PAYLOAD_VERSION: u32 = 4;
pub const PUFFDIFF_MINOR_PAYLOAD_VERSION: u32 = 5;
/// Adds the hash tree and FEC extents.
pub const VERITY_MINOR_PAYLOAD_VERSION: u32 = 6;

pub const MIN_SUPPORTED_MINOR_PAYLOAD_VERSION: u32 = IN_PLACE_MINOR_PAYLOAD_VERSION;
pub const MAX_SUPPORTED_MINOR_PAYLOAD_VERSION: u32 = VERITY_MINOR_PAYLOAD_VERSION;

/// Fixed portion of the header shared by all major versions.
#[derive(Clone, Copy, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawHeader {
    magic: [u8; 4],
    major_version: big_endian::U64,
    manifest_size: big_endian::U64,
}

const RAW_HEADER_SIZE: usize = mem::size_of::<RawHeader>();

/// Size of the major version 2 metadata signature size field.
const METADATA_SIGNATURE_SIZE_FIELD: usize = mem::size_of::<u32>();

/// Largest header across all supported major versions.
pub const MAX_PAYLOAD_HEADER_SIZE: usize = RAW_HEADER_SIZE + METADATA_SIGNATURE_SIZE_FIELD;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown magic: {0:?}")]
    UnknownMagic([u8; 4]),
    #[error("Unsupported major payload version: {0}")]
    UnsupportedMajorVersion(u64),
    #[error("Metadata size overflows: manifest is {0} bytes")]
    MetadataTooLarge(u64),
    #[error("Header has not been parsed")]
    HeaderNotParsed,
    #[error("Need {needed} bytes of metadata, but have {available}")]
    InsufficientData { needed: u64, available: usize },
    #[error("Missing metadata signature in both the install plan and the payload")]
    SignatureMissing,
    #[error("No public key is available for verifying the metadata signature")]
    NoPublicKey,
    #[error("Failed to decode base64 metadata signature")]
    SignatureBase64(#[source] base64::DecodeError),
    #[error("Failed to parse metadata signature message")]
    SignatureParse(#[source] prost::DecodeError),
    #[error("Metadata signature does not match")]
    SignatureMismatch(#[source] crypto::Error),
    #[error("Failed to parse manifest")]
    ManifestParse(#[source] prost::DecodeError),
}

type Result<T> = std::result::Result<T, Error>;

/// Outcome of feeding a possibly incomplete buffer to the parser.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetadataParseResult {
    Success,
    /// The buffer is too short. Call again once more data is available.
    InsufficientData,
}

/// Header fields of a payload. Starts empty and is filled in by
/// [`Self::parse_payload_header()`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PayloadMetadata {
    major_version: u64,
    manifest_offset: u64,
    manifest_size: u64,
    metadata_size: u64,
    metadata_signature_size: u32,
}

impl PayloadMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the fixed header at the start of `payload`. This can be called
    /// repeatedly with a growing buffer until it stops returning
    /// [`MetadataParseResult::InsufficientData`]. Calling it again after a
    /// successful parse is a no-op.
    pub fn parse_payload_header(&mut self, payload: &[u8]) -> Result<MetadataParseResult> {
        if self.is_header_parsed() {
            return Ok(MetadataParseResult::Success);
        }

        let Ok((header, _)) = RawHeader::read_from_prefix(payload) else {
            // Reject bad magic as early as possible.
            let n = payload.len().min(PAYLOAD_MAGIC.len());
            if payload[..n] != PAYLOAD_MAGIC[..n] {
                let mut magic = [0u8; 4];
                magic[..n].copy_from_slice(&payload[..n]);
                return Err(Error::UnknownMagic(magic));
            }

            return Ok(MetadataParseResult::InsufficientData);
        };

        if header.magic != *PAYLOAD_MAGIC {
            return Err(Error::UnknownMagic(header.magic));
        }

        let major_version = header.major_version.get();
        if !(MIN_SUPPORTED_MAJOR_PAYLOAD_VERSION..=MAX_SUPPORTED_MAJOR_PAYLOAD_VERSION)
            .contains(&major_version)
        {
            return Err(Error::UnsupportedMajorVersion(major_version));
        }

        let mut header_size = RAW_HEADER_SIZE;
        let mut metadata_signature_size = 0;

        if major_version >= BRILLO_MAJOR_PAYLOAD_VERSION {
            let Ok((size, _)) = big_endian::U32::read_from_prefix(&payload[RAW_HEADER_SIZE..])
            else {
                return Ok(MetadataParseResult::InsufficientData);
            };

            metadata_signature_size = size.get();
            header_size += METADATA_SIGNATURE_SIZE_FIELD;
        }

        let manifest_size = header.manifest_size.get();
        let metadata_size = manifest_size
            .checked_add(header_size as u64)
            .filter(|s| s.checked_add(metadata_signature_size.into()).is_some())
            .ok_or(Error::MetadataTooLarge(manifest_size))?;

        *self = Self {
            major_version,
            manifest_offset: header_size as u64,
            manifest_size,
            metadata_size,
            metadata_signature_size,
        };

        debug!("Parsed payload header: {self:?}");

        Ok(MetadataParseResult::Success)
    }

    pub fn is_header_parsed(&self) -> bool {
        self.metadata_size != 0
    }

    pub fn major_version(&self) -> u64 {
        self.major_version
    }

    pub fn manifest_size(&self) -> u64 {
        self.manifest_size
    }

    /// Size of the header plus the manifest.
    pub fn metadata_size(&self) -> u64 {
        self.metadata_size
    }

    /// Size of the in-band metadata signature following the manifest.
    pub fn metadata_signature_size(&self) -> u32 {
        self.metadata_signature_size
    }

    /// Size of the metadata plus its signature. Payload data blobs start here.
    pub fn data_offset(&self) -> u64 {
        self.metadata_size + u64::from(self.metadata_signature_size)
    }

    fn check_available(&self, payload: &[u8]) -> Result<()> {
        if !self.is_header_parsed() {
            return Err(Error::HeaderNotParsed);
        } else if (payload.len() as u64) < self.data_offset() {
            return Err(Error::InsufficientData {
                needed: self.data_offset(),
                available: payload.len(),
            });
        }

        Ok(())
    }

    /// Verify the metadata against a signature. A non-empty out-of-band
    /// signature (base64-encoded raw RSA signature) takes precedence.
    /// Otherwise, the in-band [`Signatures`] message is used.
    pub fn validate_metadata_signature(
        &self,
        payload: &[u8],
        out_of_band_signature: &str,
        public_key: Option<&RsaPublicKey>,
    ) -> Result<()> {
        self.check_available(payload)?;

        let metadata_size = self.metadata_size as usize;
        let in_band = &payload[metadata_size..self.data_offset() as usize];

        if out_of_band_signature.is_empty() && in_band.is_empty() {
            return Err(Error::SignatureMissing);
        }

        let public_key = public_key.ok_or(Error::NoPublicKey)?;
        let digest = HashCalculator::raw_hash_of_data(&payload[..metadata_size]);

        if !out_of_band_signature.is_empty() {
            let signature = STANDARD
                .decode(out_of_band_signature.trim())
                .map_err(Error::SignatureBase64)?;

            crypto::verify_raw_signature(public_key, &digest, &signature)
                .map_err(Error::SignatureMismatch)?;
        } else {
            let signatures = Signatures::decode(in_band).map_err(Error::SignatureParse)?;

            crypto::verify_signatures(public_key, &digest, &signatures)
                .map_err(Error::SignatureMismatch)?;
        }

        info!("Metadata signature matches");

        Ok(())
    }

    /// Decode the manifest from a buffer holding at least the full metadata.
    pub fn manifest(&self, payload: &[u8]) -> Result<DeltaArchiveManifest> {
        self.check_available(payload)?;

        let start = self.manifest_offset as usize;
        let end = self.metadata_size as usize;

        DeltaArchiveManifest::decode(&payload[start..end]).map_err(Error::ManifestParse)
    }
}
