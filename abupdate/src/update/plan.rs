// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{collections::BTreeMap, fmt, path::PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::{fd::fec::FecLayout, update::system::BootControl};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadType {
    #[default]
    Unknown,
    Full,
    Delta,
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unknown",
            Self::Full => "full",
            Self::Delta => "delta",
        })
    }
}

/// What the update channel said about the payload before it was downloaded.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Payload {
    /// Expected total payload size in bytes. 0 if unknown.
    pub size: u64,
    /// Expected metadata size in bytes. 0 if unknown.
    pub metadata_size: u64,
    /// Base64-encoded raw RSA signature of the metadata.
    pub metadata_signature: String,
    /// Expected SHA-256 of the whole payload.
    pub hash: Vec<u8>,
    pub payload_type: PayloadType,
    /// The target slot already contains this payload.
    pub already_applied: bool,
}

/// A partition to be written, resolved against the device's slots.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Partition {
    pub name: String,

    pub source_path: Option<PathBuf>,
    pub source_size: u64,
    pub source_hash: Vec<u8>,

    pub target_path: Option<PathBuf>,
    pub target_size: u64,
    pub target_hash: Vec<u8>,

    pub block_size: u32,

    pub run_postinstall: bool,
    pub postinstall_path: String,
    pub filesystem_type: String,
    pub postinstall_optional: bool,

    pub hash_tree_algorithm: String,
    pub hash_tree_salt: Vec<u8>,
    pub hash_tree_data_offset: u64,
    pub hash_tree_data_size: u64,
    pub hash_tree_offset: u64,
    pub hash_tree_size: u64,

    pub fec_data_offset: u64,
    pub fec_data_size: u64,
    pub fec_offset: u64,
    pub fec_size: u64,
    pub fec_roots: u32,
}

impl Partition {
    pub fn has_verity(&self) -> bool {
        self.hash_tree_size > 0 || self.fec_size > 0
    }
}

#[derive(Clone, Debug, Default)]
pub struct InstallPlan {
    pub is_resume: bool,
    pub payload: Payload,
    /// Verification failures are fatal instead of warnings.
    pub hash_checks_mandatory: bool,
    /// Base64-encoded RSA public key (DER or PEM) to use when the device has
    /// no built-in key. Only honored on non-official builds.
    pub public_key_rsa: String,
    pub source_slot: Option<u32>,
    pub target_slot: Option<u32>,
    pub partitions: Vec<Partition>,
    /// Reed-Solomon layouts of the source partitions, for recovering from
    /// corrupted source reads.
    pub source_fec: BTreeMap<String, FecLayout>,
    /// Upper bound on source reads recovered through FEC before the update is
    /// considered untrustworthy.
    pub max_source_ecc_recoveries: Option<u64>,
    /// Legacy payloads on Android never run postinstall on the root partition.
    pub android: bool,
    /// A user is waiting on the update. Writes skip `O_DSYNC`.
    pub interactive: bool,
    /// Switch the active slot once the payload has been applied.
    pub switch_slot_on_reboot: bool,
}

impl InstallPlan {
    /// Fill in the source and target device paths of every partition. Returns
    /// whether every lookup succeeded.
    pub fn load_partitions_from_slots(&mut self, boot_control: &dyn BootControl) -> bool {
        let mut result = true;

        for partition in &mut self.partitions {
            partition.source_path = None;
            partition.target_path = None;

            if let Some(slot) = self.source_slot.filter(|_| partition.source_size > 0) {
                match boot_control.get_partition_device(&partition.name, slot) {
                    Ok(p) => partition.source_path = Some(p),
                    Err(e) => {
                        error!("Failed to find source of {:?}: {e}", partition.name);
                        result = false;
                    }
                }
            }

            if let Some(slot) = self.target_slot.filter(|_| partition.target_size > 0) {
                match boot_control.get_partition_device(&partition.name, slot) {
                    Ok(p) => partition.target_path = Some(p),
                    Err(e) => {
                        error!("Failed to find target of {:?}: {e}", partition.name);
                        result = false;
                    }
                }
            }
        }

        result
    }

    pub fn dump(&self) {
        info!(
            "Install plan: resume={}, type={}, size={}, metadata_size={}, mandatory={}, \
             source_slot={:?}, target_slot={:?}",
            self.is_resume,
            self.payload.payload_type,
            self.payload.size,
            self.payload.metadata_size,
            self.hash_checks_mandatory,
            self.source_slot,
            self.target_slot,
        );

        for p in &self.partitions {
            info!(
                "Partition {:?}: source={:?} ({} bytes, {}), target={:?} ({} bytes, {})",
                p.name,
                p.source_path,
                p.source_size,
                hex::encode(&p.source_hash),
                p.target_path,
                p.target_size,
                hex::encode(&p.target_hash),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::system::DirectoryBootControl;

    #[test]
    fn resolve_devices() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["system_a", "system_b", "vendor_b"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let boot_control = DirectoryBootControl::new(dir.path().to_owned(), 2, 0);

        let mut plan = InstallPlan {
            source_slot: Some(0),
            target_slot: Some(1),
            partitions: vec![
                Partition {
                    name: "system".to_owned(),
                    source_size: 4096,
                    target_size: 4096,
                    ..Default::default()
                },
                Partition {
                    name: "vendor".to_owned(),
                    target_size: 4096,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        assert!(plan.load_partitions_from_slots(&boot_control));
        assert_eq!(
            plan.partitions[0].source_path,
            Some(dir.path().join("system_a")),
        );
        assert_eq!(
            plan.partitions[0].target_path,
            Some(dir.path().join("system_b")),
        );
        assert_eq!(plan.partitions[1].source_path, None);

        // vendor_a does not exist.
        plan.partitions[1].source_size = 4096;
        assert!(!plan.load_partitions_from_slots(&boot_control));
    }
}
