// SPDX-FileCopyrightText: 2023-2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! An A/B system update engine. Payloads are streamed into
//! [`update::DeltaPerformer`], which applies their operations to the inactive
//! slot's partitions and checkpoints its progress so an interrupted update can
//! be resumed.
//!
//! The CLI source files use concrete types wherever possible for simplicity,
//! while the "library"-style source files aim to be generic.

pub mod cli;
pub mod config;
pub mod crypto;
pub mod extent;
pub mod fd;
pub mod format;
pub mod hash;
pub mod protobuf;
pub mod stream;
pub mod update;
pub mod util;
