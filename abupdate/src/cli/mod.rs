// SPDX-FileCopyrightText: 2023-2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Args;

use crate::{
    config::Config,
    update::prefs::{FilePrefs, MemoryPrefs, Prefs},
};

pub mod apply;
pub mod args;
pub mod state;
pub mod verify;

/// Options shared by every subcommand that needs the device description.
#[derive(Debug, Args)]
pub struct ConfigGroup {
    /// Path to install plan config TOML.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub config: PathBuf,

    /// Directory for persisted update state.
    ///
    /// Overrides `prefs_dir` in the config.
    #[arg(long, value_name = "DIR", value_parser)]
    pub prefs_dir: Option<PathBuf>,
}

impl ConfigGroup {
    pub fn load(&self) -> Result<Config> {
        let mut config = Config::load(&self.config)?;

        if let Some(dir) = &self.prefs_dir {
            config.prefs_dir = Some(dir.clone());
        }

        Ok(config)
    }
}

fn open_file_prefs(dir: &Path) -> Result<FilePrefs> {
    FilePrefs::new(dir).with_context(|| format!("Failed to open prefs directory: {dir:?}"))
}

/// Persistent prefs if a directory is configured. Otherwise, progress is kept
/// in memory and an interrupted update cannot be resumed.
pub fn open_prefs(config: &Config) -> Result<Box<dyn Prefs>> {
    match &config.prefs_dir {
        Some(dir) => Ok(Box::new(open_file_prefs(dir)?)),
        None => {
            tracing::warn!("No prefs directory configured; progress will not be saved");
            Ok(Box::new(MemoryPrefs::new()))
        }
    }
}

/// Like [`open_prefs()`], but for commands that only make sense with persisted
/// state.
pub fn open_required_prefs(config: &Config) -> Result<FilePrefs> {
    let Some(dir) = &config.prefs_dir else {
        bail!("No prefs directory configured");
    };

    open_file_prefs(dir)
}
