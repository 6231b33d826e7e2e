// SPDX-FileCopyrightText: 2023-2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    io,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::Level;

use crate::{
    cli::{apply, state, verify},
    update::{system::CancelSignal, terminator::Terminator},
};

#[derive(Debug, Subcommand)]
pub enum Command {
    Apply(apply::ApplyCli),
    VerifyApplicable(verify::VerifyApplicableCli),
    Reset(state::ResetCli),
    Status(state::StatusCli),
}

#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Lowest log message level to show.
    #[arg(long, global = true, value_name = "LEVEL", default_value = "info")]
    pub log_level: Level,
}

fn init_logging(level: Level, logging_initialized: &AtomicBool) {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_max_level(level)
        .with_target(false)
        .init();

    logging_initialized.store(true, Ordering::SeqCst);
}

pub fn main(
    logging_initialized: &AtomicBool,
    cancel_signal: &CancelSignal,
    terminator: &Terminator,
) -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.log_level, logging_initialized);

    match cli.command {
        Command::Apply(c) => apply::apply_main(&c, cancel_signal, terminator),
        Command::VerifyApplicable(c) => verify::verify_applicable_main(&c),
        Command::Reset(c) => state::reset_main(&c),
        Command::Status(c) => state::status_main(&c),
    }
}
