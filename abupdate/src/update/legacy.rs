// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Compatibility shim for major version 1 payloads, which describe exactly two
//! partitions through dedicated manifest fields instead of the partition list.

use std::mem;

use tracing::warn;

use crate::protobuf::chromeos_update_engine::{DeltaArchiveManifest, PartitionUpdate};

pub const PARTITION_NAME_ROOT: &str = "root";
pub const PARTITION_NAME_KERNEL: &str = "kernel";

/// Move the legacy root and kernel fields out of `manifest` into a synthetic
/// `[root, kernel]` partition list. `root_runs_postinstall` controls whether
/// the root partition is marked for postinstall.
pub fn normalize(
    manifest: &mut DeltaArchiveManifest,
    root_runs_postinstall: bool,
) -> Vec<PartitionUpdate> {
    if !root_runs_postinstall {
        warn!("Legacy payload on this platform; assuming no postinstall");
    }

    let root = PartitionUpdate {
        partition_name: PARTITION_NAME_ROOT.to_owned(),
        run_postinstall: Some(root_runs_postinstall),
        old_partition_info: manifest.old_rootfs_info.take(),
        new_partition_info: manifest.new_rootfs_info.take(),
        operations: mem::take(&mut manifest.install_operations),
        ..Default::default()
    };

    let kernel = PartitionUpdate {
        partition_name: PARTITION_NAME_KERNEL.to_owned(),
        run_postinstall: Some(false),
        old_partition_info: manifest.old_kernel_info.take(),
        new_partition_info: manifest.new_kernel_info.take(),
        operations: mem::take(&mut manifest.kernel_install_operations),
        ..Default::default()
    };

    vec![root, kernel]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protobuf::chromeos_update_engine::{
        InstallOperation, PartitionInfo, install_operation::Type,
    };

    fn info(size: u64) -> Option<PartitionInfo> {
        Some(PartitionInfo {
            size: Some(size),
            hash: Some(vec![size as u8; 32]),
        })
    }

    fn op(kind: Type) -> InstallOperation {
        InstallOperation {
            r#type: kind.into(),
            ..Default::default()
        }
    }

    #[test]
    fn split_into_root_and_kernel() {
        let mut manifest = DeltaArchiveManifest {
            install_operations: vec![op(Type::Replace), op(Type::Zero)],
            kernel_install_operations: vec![op(Type::ReplaceBz)],
            old_rootfs_info: info(1),
            new_rootfs_info: info(2),
            new_kernel_info: info(3),
            ..Default::default()
        };

        let partitions = normalize(&mut manifest, true);
        assert_eq!(partitions.len(), 2);

        assert_eq!(partitions[0].partition_name, PARTITION_NAME_ROOT);
        assert_eq!(partitions[0].run_postinstall, Some(true));
        assert_eq!(partitions[0].operations.len(), 2);
        assert_eq!(partitions[0].old_partition_info, info(1));
        assert_eq!(partitions[0].new_partition_info, info(2));

        assert_eq!(partitions[1].partition_name, PARTITION_NAME_KERNEL);
        assert_eq!(partitions[1].run_postinstall, Some(false));
        assert_eq!(partitions[1].operations, vec![op(Type::ReplaceBz)]);
        assert_eq!(partitions[1].old_partition_info, None);
        assert_eq!(partitions[1].new_partition_info, info(3));

        // The legacy fields have been moved out.
        assert!(manifest.install_operations.is_empty());
        assert!(manifest.kernel_install_operations.is_empty());
        assert_eq!(manifest.new_rootfs_info, None);

        let partitions = normalize(&mut DeltaArchiveManifest::default(), false);
        assert_eq!(partitions[0].run_postinstall, Some(false));
    }
}
