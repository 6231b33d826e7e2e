// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Capabilities the engine needs from the device it runs on.

use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use thiserror::Error;
use tracing::{debug, info};

use crate::update::error::ErrorCode;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid slot {slot} (device has {num_slots} slots)")]
    InvalidSlot { slot: u32, num_slots: u32 },
    #[error("No device for partition {name:?} in slot {slot}")]
    NoDevice { name: String, slot: u32 },
    #[error("Group {group:?} is {used} bytes, but its size limit is {size}")]
    GroupTooLarge { group: String, used: u64, size: u64 },
    #[error("Partition {0:?} is listed in more than one group")]
    DuplicatePartition(String),
}

type Result<T> = std::result::Result<T, Error>;

/// Slot letter used in partition device names.
pub fn slot_suffix(slot: u32) -> String {
    match u8::try_from(slot).ok().and_then(|s| s.checked_add(b'a')) {
        Some(c) if c <= b'z' => format!("_{}", c as char),
        _ => format!("_{slot}"),
    }
}

/// Sizes for one dynamic partition group in the target slot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartitionGroup {
    pub name: String,
    /// Maximum total size of the partitions in the group. 0 means unlimited.
    pub size: u64,
    /// Partition names and their new sizes.
    pub partitions: Vec<(String, u64)>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartitionMetadata {
    pub groups: Vec<PartitionGroup>,
}

/// Slot and partition bookkeeping.
pub trait BootControl: Send {
    fn num_slots(&self) -> u32;

    fn current_slot(&self) -> u32;

    /// Path of the device node for a partition in a slot.
    fn get_partition_device(&self, name: &str, slot: u32) -> Result<PathBuf>;

    /// Resize or create dynamic partitions in `slot`. When `update_metadata` is
    /// false, the metadata was already written by a previous attempt and only
    /// needs to be mapped.
    fn init_partition_metadata(
        &mut self,
        slot: u32,
        metadata: &PartitionMetadata,
        update_metadata: bool,
    ) -> Result<()>;

    fn set_active_boot_slot(&mut self, slot: u32) -> Result<()>;
}

/// Partitions are device nodes named `<name>_<slot letter>` inside a directory,
/// unless overridden per partition.
#[derive(Clone, Debug)]
pub struct DirectoryBootControl {
    pub device_dir: PathBuf,
    pub num_slots: u32,
    pub current_slot: u32,
    /// Per-partition device paths, indexed by slot.
    pub overrides: BTreeMap<String, Vec<PathBuf>>,
    pub active_slot: Option<u32>,
    pub partition_metadata: Option<PartitionMetadata>,
}

impl DirectoryBootControl {
    pub fn new(device_dir: PathBuf, num_slots: u32, current_slot: u32) -> Self {
        Self {
            device_dir,
            num_slots,
            current_slot,
            overrides: BTreeMap::new(),
            active_slot: None,
            partition_metadata: None,
        }
    }

    fn check_slot(&self, slot: u32) -> Result<()> {
        if slot >= self.num_slots {
            return Err(Error::InvalidSlot {
                slot,
                num_slots: self.num_slots,
            });
        }

        Ok(())
    }
}

impl BootControl for DirectoryBootControl {
    fn num_slots(&self) -> u32 {
        self.num_slots
    }

    fn current_slot(&self) -> u32 {
        self.current_slot
    }

    fn get_partition_device(&self, name: &str, slot: u32) -> Result<PathBuf> {
        self.check_slot(slot)?;

        if let Some(paths) = self.overrides.get(name) {
            return paths
                .get(slot as usize)
                .cloned()
                .ok_or_else(|| Error::NoDevice {
                    name: name.to_owned(),
                    slot,
                });
        }

        let path = self.device_dir.join(format!("{name}{}", slot_suffix(slot)));
        if !path.exists() {
            return Err(Error::NoDevice {
                name: name.to_owned(),
                slot,
            });
        }

        Ok(path)
    }

    fn init_partition_metadata(
        &mut self,
        slot: u32,
        metadata: &PartitionMetadata,
        update_metadata: bool,
    ) -> Result<()> {
        self.check_slot(slot)?;

        let mut seen = std::collections::BTreeSet::new();

        for group in &metadata.groups {
            let mut used = 0u64;

            for (name, size) in &group.partitions {
                if !seen.insert(name) {
                    return Err(Error::DuplicatePartition(name.clone()));
                }
                used = used.saturating_add(*size);
            }

            if group.size != 0 && used > group.size {
                return Err(Error::GroupTooLarge {
                    group: group.name.clone(),
                    used,
                    size: group.size,
                });
            }

            debug!("Group {:?}: {used}/{} bytes", group.name, group.size);
        }

        if update_metadata {
            info!("Updating partition metadata for slot {slot}");
            self.partition_metadata = Some(metadata.clone());
        } else {
            info!("Partition metadata for slot {slot} was already updated");
        }

        Ok(())
    }

    fn set_active_boot_slot(&mut self, slot: u32) -> Result<()> {
        self.check_slot(slot)?;
        info!("Marking slot {slot} as active");
        self.active_slot = Some(slot);
        Ok(())
    }
}

/// Facts about the running system image.
pub trait Hardware: Send + Sync {
    fn is_official_build(&self) -> bool;

    /// Build timestamp of the running system in seconds since the epoch.
    fn build_timestamp(&self) -> i64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct StaticHardware {
    pub official_build: bool,
    pub build_timestamp: i64,
}

impl Hardware for StaticHardware {
    fn is_official_build(&self) -> bool {
        self.official_build
    }

    fn build_timestamp(&self) -> i64 {
        self.build_timestamp
    }
}

/// Asked between operations whether the update should stop.
pub trait DownloadDelegate: Send + Sync {
    fn should_cancel(&self) -> Option<ErrorCode>;
}

/// Cancels once the shared flag is set, usually from a signal handler.
#[derive(Clone, Debug, Default)]
pub struct CancelSignal(Arc<AtomicBool>);

impl CancelSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl DownloadDelegate for CancelSignal {
    fn should_cancel(&self) -> Option<ErrorCode> {
        self.is_canceled().then_some(ErrorCode::UserCanceled)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn partition_devices() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("system_b"), b"").unwrap();

        let mut boot_control = DirectoryBootControl::new(dir.path().to_owned(), 2, 0);
        assert_eq!(
            boot_control.get_partition_device("system", 1).unwrap(),
            dir.path().join("system_b"),
        );
        assert_matches!(
            boot_control.get_partition_device("system", 0),
            Err(Error::NoDevice { slot: 0, .. })
        );
        assert_matches!(
            boot_control.get_partition_device("system", 2),
            Err(Error::InvalidSlot { slot: 2, .. })
        );

        boot_control
            .overrides
            .insert("boot".to_owned(), vec!["/dev/a".into(), "/dev/b".into()]);
        assert_eq!(
            boot_control.get_partition_device("boot", 0).unwrap(),
            PathBuf::from("/dev/a"),
        );

        boot_control.set_active_boot_slot(1).unwrap();
        assert_eq!(boot_control.active_slot, Some(1));
    }

    #[test]
    fn partition_metadata_limits() {
        let mut boot_control = DirectoryBootControl::new(PathBuf::new(), 2, 0);
        let mut metadata = PartitionMetadata {
            groups: vec![PartitionGroup {
                name: "group".to_owned(),
                size: 100,
                partitions: vec![("a".to_owned(), 60), ("b".to_owned(), 40)],
            }],
        };

        boot_control
            .init_partition_metadata(1, &metadata, true)
            .unwrap();
        assert_eq!(boot_control.partition_metadata.as_ref(), Some(&metadata));

        metadata.groups[0].partitions[1].1 = 41;
        assert_matches!(
            boot_control.init_partition_metadata(1, &metadata, true),
            Err(Error::GroupTooLarge { used: 101, .. })
        );
    }

    #[test]
    fn cancel_signal() {
        let signal = CancelSignal::new();
        let delegate: &dyn DownloadDelegate = &signal;
        assert_eq!(delegate.should_cancel(), None);

        signal.clone().cancel();
        assert_eq!(delegate.should_cancel(), Some(ErrorCode::UserCanceled));
    }

    #[test]
    fn suffixes() {
        assert_eq!(slot_suffix(0), "_a");
        assert_eq!(slot_suffix(1), "_b");
        assert_eq!(slot_suffix(100), "_100");
    }
}
