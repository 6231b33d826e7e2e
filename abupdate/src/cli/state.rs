// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use crate::{
    cli::{self, ConfigGroup},
    update::{
        DeltaPerformer,
        prefs::{self, Prefs},
    },
};

pub fn reset_main(cli: &ResetCli) -> Result<()> {
    let config = cli.config.load()?;
    let mut prefs = cli::open_required_prefs(&config)?;

    DeltaPerformer::reset_update_progress(&mut prefs, cli.quick)
        .context("Failed to reset update progress")?;

    info!("Update progress has been reset");

    Ok(())
}

pub fn status_main(cli: &StatusCli) -> Result<()> {
    let config = cli.config.load()?;
    let prefs = cli::open_required_prefs(&config)?;

    for key in prefs::UPDATE_STATE_KEYS
        .iter()
        .chain([&prefs::KEY_UPDATE_CHECK_RESPONSE_HASH])
    {
        let value = prefs
            .get_string(key)
            .with_context(|| format!("Failed to read {key}"))?;

        match value {
            // Hash contexts and signatures are long and not very useful to
            // look at.
            Some(v) if v.len() > 64 && !cli.verbose => {
                println!("{key}: <{} bytes>", v.len());
            }
            Some(v) => println!("{key}: {v}"),
            None => println!("{key}: <unset>"),
        }
    }

    let resumable =
        DeltaPerformer::can_resume_update(&prefs, &config.payload.response_hash);
    println!("resumable: {resumable}");

    if let Some((data_offset, next_data_offset)) = DeltaPerformer::resume_offsets(&prefs)? {
        println!("resume offset: {}", data_offset.saturating_add(next_data_offset));
    }

    Ok(())
}

/// Discard the checkpoint of an interrupted update.
#[derive(Debug, Parser)]
pub struct ResetCli {
    #[command(flatten)]
    pub config: ConfigGroup,

    /// Only invalidate the next operation.
    ///
    /// This prevents resuming, but leaves the rest of the state in place for
    /// inspection.
    #[arg(long)]
    pub quick: bool,
}

/// Show the persisted update state.
#[derive(Debug, Parser)]
pub struct StatusCli {
    #[command(flatten)]
    pub config: ConfigGroup,

    /// Print long values in full.
    #[arg(short, long)]
    pub verbose: bool,
}
