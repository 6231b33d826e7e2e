// SPDX-FileCopyrightText: 2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

#![allow(clippy::all)]
#![allow(clippy::nursery)]
#![allow(clippy::pedantic)]

pub mod chromeos_update_engine {
    include!(concat!(env!("OUT_DIR"), "/chromeos_update_engine.rs"));
}

pub mod puffin {
    pub mod metadata {
        include!(concat!(env!("OUT_DIR"), "/puffin.metadata.rs"));
    }
}

use chromeos_update_engine::{Extent, install_operation::Type};

/// Marker value for [`Extent::start_block`] indicating that the extent is a
/// hole that is never read from or written to.
pub const SPARSE_HOLE: u64 = u64::MAX;

impl Extent {
    pub fn new(start_block: u64, num_blocks: u64) -> Self {
        Self {
            start_block: Some(start_block),
            num_blocks: Some(num_blocks),
        }
    }

    pub fn is_sparse_hole(&self) -> bool {
        self.start_block() == SPARSE_HOLE
    }
}

impl Type {
    /// Whether the operation reads from the partition it writes to.
    pub fn is_in_place(self) -> bool {
        matches!(self, Self::Move | Self::Bsdiff)
    }

    /// Whether the operation's payload blob is literal replacement data.
    pub fn is_replace(self) -> bool {
        matches!(self, Self::Replace | Self::ReplaceBz | Self::ReplaceXz)
    }
}
