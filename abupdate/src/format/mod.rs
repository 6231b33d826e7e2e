// SPDX-FileCopyrightText: 2023-2026 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

pub mod bspatch;
pub mod ext4;
pub mod fec;
pub mod hashtree;
pub mod payload;
pub mod puffin;
pub mod verityrs;
