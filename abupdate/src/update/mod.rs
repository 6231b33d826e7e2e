// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

pub mod applicable;
pub mod buffer;
pub mod error;
pub mod legacy;
pub mod performer;
pub mod plan;
pub mod prefs;
pub mod system;
pub mod terminator;
pub mod verity;

pub use error::{Error, ErrorCode, Result};
pub use performer::{DeltaPerformer, WriteStatus};
pub use plan::InstallPlan;
