// SPDX-FileCopyrightText: 2023-2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    process::ExitCode,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use abupdate::update::{system::CancelSignal, terminator::Terminator};
use tracing::error;

static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

fn main() -> ExitCode {
    // The first interrupt stops the update after the current operation. A
    // second one exits as soon as the update state is consistent.
    let cancel_signal = CancelSignal::new();
    let terminator = Arc::new(Terminator::new());
    {
        let signal = cancel_signal.clone();
        let terminator = terminator.clone();

        ctrlc::set_handler(move || {
            if signal.is_canceled() {
                terminator.request_exit();
            } else {
                signal.cancel();
            }
        })
        .expect("Failed to set signal handler");
    }

    match abupdate::cli::args::main(&LOGGING_INITIALIZED, &cancel_signal, &terminator) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if LOGGING_INITIALIZED.load(Ordering::SeqCst) {
                error!("{e:?}");
            } else {
                eprintln!("{e:?}");
            }
            ExitCode::FAILURE
        }
    }
}
