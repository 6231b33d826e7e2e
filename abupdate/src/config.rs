// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! TOML description of an update: what the payload is expected to be and how
//! the device is laid out.
//!
//! ```toml
//! prefs_dir = "/data/misc/abupdate/prefs"
//! public_key = "/etc/abupdate/payload-key.pem"
//! hash_checks_mandatory = true
//!
//! [payload]
//! size = 1048576
//! metadata_size = 4096
//! hash = "<hex sha256>"
//! type = "delta"
//!
//! [boot_control]
//! device_dir = "/dev/block/by-name"
//! num_slots = 2
//! current_slot = 0
//!
//! [source_fec.system]
//! data_size = 268435456
//! fec_offset = 270532608
//! roots = 2
//! ```

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    fd::fec::FecLayout,
    update::{
        plan::{InstallPlan, Payload, PayloadType},
        system::{DirectoryBootControl, StaticHardware},
    },
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read config: {0:?}")]
    Read(PathBuf, #[source] io::Error),
    #[error("Failed to parse config: {0:?}")]
    Parse(PathBuf, #[source] toml_edit::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PayloadConfig {
    pub size: u64,
    pub metadata_size: u64,
    /// Base64-encoded raw RSA signature of the metadata.
    pub metadata_signature: String,
    #[serde(with = "hex")]
    pub hash: Vec<u8>,
    #[serde(rename = "type")]
    pub payload_type: PayloadType,
    pub already_applied: bool,
    /// Identifies the update across attempts. An interrupted update is only
    /// resumed if this matches.
    pub response_hash: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub official_build: bool,
    pub build_timestamp: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootControlConfig {
    pub device_dir: PathBuf,
    pub num_slots: u32,
    pub current_slot: u32,
    /// Device paths of individual partitions, one per slot.
    pub overrides: BTreeMap<String, Vec<PathBuf>>,
}

impl Default for BootControlConfig {
    fn default() -> Self {
        Self {
            device_dir: PathBuf::from("/dev/block/by-name"),
            num_slots: 2,
            current_slot: 0,
            overrides: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub prefs_dir: Option<PathBuf>,
    /// PEM-encoded RSA public key. Ignored if the file does not exist.
    pub public_key: Option<PathBuf>,
    /// Base64-encoded RSA public key. Only used on non-official builds.
    pub public_key_rsa: String,
    pub hash_checks_mandatory: bool,
    pub android: bool,
    pub interactive: bool,
    pub switch_slot_on_reboot: bool,
    pub max_source_ecc_recoveries: Option<u64>,
    pub payload: PayloadConfig,
    pub hardware: HardwareConfig,
    pub boot_control: BootControlConfig,
    pub source_fec: BTreeMap<String, FecLayout>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).map_err(|e| Error::Read(path.to_owned(), e))?;
        let config: Self =
            toml_edit::de::from_str(&data).map_err(|e| Error::Parse(path.to_owned(), e))?;

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let bc = &self.boot_control;

        if bc.num_slots == 0 {
            return Err(Error::Invalid("num_slots must not be 0".into()));
        } else if bc.current_slot >= bc.num_slots {
            return Err(Error::Invalid(format!(
                "current_slot {} is out of range for {} slots",
                bc.current_slot, bc.num_slots,
            )));
        }

        for (name, paths) in &bc.overrides {
            if paths.len() != bc.num_slots as usize {
                return Err(Error::Invalid(format!(
                    "Partition {name:?} has {} device overrides, but there are {} slots",
                    paths.len(),
                    bc.num_slots,
                )));
            }
        }

        if !self.payload.hash.is_empty() && self.payload.hash.len() != 32 {
            return Err(Error::Invalid(format!(
                "Payload hash must be 32 bytes, but is {} bytes",
                self.payload.hash.len(),
            )));
        }

        Ok(())
    }

    /// The slot the update is written to. Devices with a single slot update
    /// in place.
    pub fn target_slot(&self) -> u32 {
        let bc = &self.boot_control;

        if bc.num_slots > 1 {
            (bc.current_slot + 1) % bc.num_slots
        } else {
            bc.current_slot
        }
    }

    pub fn install_plan(&self, is_resume: bool) -> InstallPlan {
        let payload = &self.payload;
        let bc = &self.boot_control;

        InstallPlan {
            is_resume,
            payload: Payload {
                size: payload.size,
                metadata_size: payload.metadata_size,
                metadata_signature: payload.metadata_signature.clone(),
                hash: payload.hash.clone(),
                payload_type: payload.payload_type,
                already_applied: payload.already_applied,
            },
            hash_checks_mandatory: self.hash_checks_mandatory,
            public_key_rsa: self.public_key_rsa.clone(),
            source_slot: (bc.num_slots > 1).then_some(bc.current_slot),
            target_slot: Some(self.target_slot()),
            partitions: vec![],
            source_fec: self.source_fec.clone(),
            max_source_ecc_recoveries: self.max_source_ecc_recoveries,
            android: self.android,
            interactive: self.interactive,
            switch_slot_on_reboot: self.switch_slot_on_reboot,
        }
    }

    pub fn boot_control(&self) -> DirectoryBootControl {
        let bc = &self.boot_control;

        let mut boot_control =
            DirectoryBootControl::new(bc.device_dir.clone(), bc.num_slots, bc.current_slot);
        boot_control.overrides = bc.overrides.clone();

        boot_control
    }

    pub fn hardware(&self) -> StaticHardware {
        StaticHardware {
            official_build: self.hardware.official_build,
            build_timestamp: self.hardware.build_timestamp,
        }
    }
}
