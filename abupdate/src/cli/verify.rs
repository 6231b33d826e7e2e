// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::warn;

use crate::{cli::ConfigGroup, crypto, update::applicable};

pub fn verify_applicable_main(cli: &VerifyApplicableCli) -> Result<()> {
    let config = cli.config.load()?;
    let boot_control = config.boot_control();

    let key_path = cli.public_key.as_ref().or(config.public_key.as_ref());
    let public_key = match key_path {
        Some(path) if path.exists() => Some(
            crypto::read_pem_public_key_file(path)
                .with_context(|| format!("Failed to load public key: {path:?}"))?,
        ),
        Some(path) => {
            warn!("Public key does not exist: {path:?}");
            None
        }
        None => None,
    };

    applicable::verify_payload_applicable(&cli.metadata, &boot_control, public_key.as_ref())
        .with_context(|| format!("Payload is not applicable: {:?}", cli.metadata))?;

    println!("Payload is applicable to slot {}", config.boot_control.current_slot);

    Ok(())
}

/// Check that a delta payload can be applied on top of the current slot.
///
/// Only the payload metadata is needed. Every source hash in the manifest is
/// checked against the current slot's partitions.
#[derive(Debug, Parser)]
pub struct VerifyApplicableCli {
    #[command(flatten)]
    pub config: ConfigGroup,

    /// Path to the payload metadata.
    ///
    /// This can be the full payload or just its first `metadata_size` plus
    /// metadata signature size bytes.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub metadata: PathBuf,

    /// Path to PEM-encoded public key.
    ///
    /// Overrides `public_key` in the config.
    #[arg(short = 'k', long, value_name = "FILE", value_parser)]
    pub public_key: Option<PathBuf>,
}
