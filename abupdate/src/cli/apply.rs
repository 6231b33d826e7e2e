// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::{BufReader, Read, Seek, SeekFrom},
    num::NonZeroUsize,
    path::PathBuf,
};

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use tracing::{info, warn};

use crate::{
    cli::{self, ConfigGroup},
    update::{
        self, DeltaPerformer, WriteStatus,
        prefs,
        system::{BootControl, CancelSignal},
        terminator::Terminator,
    },
    util::NumBytes,
};

fn engine_error(e: update::Error) -> anyhow::Error {
    let code = e.code();
    anyhow!(e).context(format!("Update failed: {code}"))
}

/// Feed `reader` to the engine until it stops asking for data or `reader`
/// reaches EOF. Returns [`None`] on EOF.
fn feed(
    performer: &mut DeltaPerformer<'_>,
    mut reader: impl Read,
    chunk_size: usize,
) -> Result<Option<WriteStatus>> {
    let mut buf = vec![0u8; chunk_size];

    loop {
        let n = reader.read(&mut buf).context("Failed to read payload")?;
        if n == 0 {
            return Ok(None);
        }

        match performer.write(&buf[..n]).map_err(engine_error)? {
            WriteStatus::NeedMoreData => {}
            status => return Ok(Some(status)),
        }
    }
}

pub fn apply_main(cli: &ApplyCli, cancel_signal: &CancelSignal, terminator: &Terminator) -> Result<()> {
    let config = cli.config.load()?;
    let mut prefs = cli::open_prefs(&config)?;
    let mut boot_control = config.boot_control();
    let hardware = config.hardware();

    let response_hash = &config.payload.response_hash;
    let is_resume = !cli.no_resume
        && !response_hash.is_empty()
        && DeltaPerformer::can_resume_update(&*prefs, response_hash);

    if is_resume {
        info!("Resuming interrupted update");
    } else {
        DeltaPerformer::reset_update_progress(&mut *prefs, false)
            .context("Failed to reset update progress")?;
        prefs.set_string(prefs::KEY_UPDATE_CHECK_RESPONSE_HASH, response_hash)?;
    }

    let resume_offsets = if is_resume {
        DeltaPerformer::resume_offsets(&*prefs)?
    } else {
        None
    };

    let file = File::open(&cli.payload)
        .with_context(|| format!("Failed to open payload: {:?}", cli.payload))?;
    let file_size = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let mut install_plan = config.install_plan(is_resume);
    if install_plan.payload.size == 0 {
        install_plan.payload.size = file_size;
    }
    let expected_size = install_plan.payload.size;
    let expected_hash = install_plan.payload.hash.clone();

    info!("Applying {:?} payload {:?}", NumBytes(file_size), cli.payload);

    let status = {
        let mut performer = DeltaPerformer::new(
            &mut *prefs,
            &mut boot_control,
            &hardware,
            terminator,
            &mut install_plan,
        );
        performer.set_delegate(cancel_signal);
        if let Some(path) = &config.public_key {
            performer.set_public_key_path(path);
        }

        let result = (|| -> Result<WriteStatus> {
            let status = match resume_offsets {
                Some((data_offset, next_data_offset)) => {
                    let metadata = (&mut reader).take(data_offset);

                    match feed(&mut performer, metadata, cli.chunk_size.get())? {
                        Some(status) => Some(status),
                        None => {
                            let offset = data_offset
                                .checked_add(next_data_offset)
                                .context("Resume offset overflows")?;
                            info!("Skipping to payload offset {offset}");

                            reader.seek(SeekFrom::Start(offset))?;
                            feed(&mut performer, &mut reader, cli.chunk_size.get())?
                        }
                    }
                }
                None => feed(&mut performer, &mut reader, cli.chunk_size.get())?,
            };

            status.context("Payload ended prematurely")
        })();

        let status = match result {
            Ok(s) => s,
            Err(e) => {
                if let Err(close_error) = performer.close() {
                    warn!("Failed to clean up after error: {close_error}");
                }
                return Err(e);
            }
        };

        performer.close().map_err(engine_error)?;

        if status == WriteStatus::Complete {
            performer
                .verify_payload(&expected_hash, expected_size)
                .map_err(engine_error)?;

            if performer.source_ecc_recovered_failures() > 0 {
                warn!(
                    "{} operations needed error correction of the source data",
                    performer.source_ecc_recovered_failures(),
                );
            }
        }

        status
    };

    match status {
        WriteStatus::AlreadyApplied => {
            info!("Nothing to do");
            return Ok(());
        }
        WriteStatus::Complete => {}
        WriteStatus::NeedMoreData => bail!("Payload ended prematurely"),
    }

    // The update is done. A new attempt must not resume it.
    DeltaPerformer::reset_update_progress(&mut *prefs, false)
        .context("Failed to reset update progress")?;

    if let Some(slot) = install_plan.target_slot.filter(|_| install_plan.switch_slot_on_reboot) {
        boot_control
            .set_active_boot_slot(slot)
            .with_context(|| format!("Failed to mark slot {slot} as active"))?;
    }

    info!("Successfully applied payload");

    Ok(())
}

/// Stream a payload into the target slot.
///
/// If the previous attempt at the same update was interrupted, it is resumed
/// from the last checkpoint.
#[derive(Debug, Parser)]
pub struct ApplyCli {
    #[command(flatten)]
    pub config: ConfigGroup,

    /// Path to payload.bin.
    #[arg(short, long, value_name = "FILE", value_parser)]
    pub payload: PathBuf,

    /// Always start from the beginning.
    #[arg(long)]
    pub no_resume: bool,

    /// Size of each write to the engine.
    #[arg(long, value_name = "BYTES", default_value = "1048576")]
    pub chunk_size: NonZeroUsize,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::ApplyCli;

    #[test]
    fn chunk_size_must_be_positive() {
        let parse = |size: &str| {
            ApplyCli::try_parse_from([
                "apply",
                "--config",
                "plan.toml",
                "--payload",
                "payload.bin",
                "--chunk-size",
                size,
            ])
        };

        assert_eq!(parse("4096").unwrap().chunk_size.get(), 4096);
        assert!(parse("0").is_err());
        assert_eq!(
            ApplyCli::try_parse_from(["apply", "-c", "plan.toml", "-p", "payload.bin"])
                .unwrap()
                .chunk_size
                .get(),
            1024 * 1024,
        );
    }
}
