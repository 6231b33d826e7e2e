// SPDX-FileCopyrightText: 2023 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

// The gf256 library generates each RS(255, K) codec at compile time with a proc
// macro. dm-verity allows 2 to 24 roots, so every K from 231 to 253 is needed.

#![allow(non_snake_case)]

use gf256::rs::rs;
use phf::phf_map;

#[rs(block = 255, data = 231)]
mod rs255w231 {}
#[rs(block = 255, data = 232)]
mod rs255w232 {}
#[rs(block = 255, data = 233)]
mod rs255w233 {}
#[rs(block = 255, data = 234)]
mod rs255w234 {}
#[rs(block = 255, data = 235)]
mod rs255w235 {}
#[rs(block = 255, data = 236)]
mod rs255w236 {}
#[rs(block = 255, data = 237)]
mod rs255w237 {}
#[rs(block = 255, data = 238)]
mod rs255w238 {}
#[rs(block = 255, data = 239)]
mod rs255w239 {}
#[rs(block = 255, data = 240)]
mod rs255w240 {}
#[rs(block = 255, data = 241)]
mod rs255w241 {}
#[rs(block = 255, data = 242)]
mod rs255w242 {}
#[rs(block = 255, data = 243)]
mod rs255w243 {}
#[rs(block = 255, data = 244)]
mod rs255w244 {}
#[rs(block = 255, data = 245)]
mod rs255w245 {}
#[rs(block = 255, data = 246)]
mod rs255w246 {}
#[rs(block = 255, data = 247)]
mod rs255w247 {}
#[rs(block = 255, data = 248)]
mod rs255w248 {}
#[rs(block = 255, data = 249)]
mod rs255w249 {}
#[rs(block = 255, data = 250)]
mod rs255w250 {}
#[rs(block = 255, data = 251)]
mod rs255w251 {}
#[rs(block = 255, data = 252)]
mod rs255w252 {}
#[rs(block = 255, data = 253)]
mod rs255w253 {}

/// Entry points for a single RS(255, K) configuration.
pub struct RsCodec {
    /// Fill in the parity bytes of a 255-byte codeword.
    pub encode: fn(&mut [u8]),
    /// Check whether a codeword contains no errors.
    pub is_correct: fn(&[u8]) -> bool,
    /// Correct errors at unknown locations in place, returning the number of
    /// corrected bytes. Each generated codec has its own error type, but they
    /// can only fail one way (too many corrupt bytes), so `None` is returned
    /// instead.
    pub correct_errors: fn(&mut [u8]) -> Option<usize>,
}

/// Codecs keyed by the number of data bytes per codeword.
pub static CODECS: phf::Map<u8, RsCodec> = phf_map! {
    231u8 => RsCodec {
        encode: rs255w231::encode,
        is_correct: rs255w231::is_correct,
        correct_errors: |data: &mut [u8]| rs255w231::correct_errors(data).ok(),
    },
    232u8 => RsCodec {
        encode: rs255w232::encode,
        is_correct: rs255w232::is_correct,
        correct_errors: |data: &mut [u8]| rs255w232::correct_errors(data).ok(),
    },
    233u8 => RsCodec {
        encode: rs255w233::encode,
        is_correct: rs255w233::is_correct,
        correct_errors: |data: &mut [u8]| rs255w233::correct_errors(data).ok(),
    },
    234u8 => RsCodec {
        encode: rs255w234::encode,
        is_correct: rs255w234::is_correct,
        correct_errors: |data: &mut [u8]| rs255w234::correct_errors(data).ok(),
    },
    235u8 => RsCodec {
        encode: rs255w235::encode,
        is_correct: rs255w235::is_correct,
        correct_errors: |data: &mut [u8]| rs255w235::correct_errors(data).ok(),
    },
    236u8 => RsCodec {
        encode: rs255w236::encode,
        is_correct: rs255w236::is_correct,
        correct_errors: |data: &mut [u8]| rs255w236::correct_errors(data).ok(),
    },
    237u8 => RsCodec {
        encode: rs255w237::encode,
        is_correct: rs255w237::is_correct,
        correct_errors: |data: &mut [u8]| rs255w237::correct_errors(data).ok(),
    },
    238u8 => RsCodec {
        encode: rs255w238::encode,
        is_correct: rs255w238::is_correct,
        correct_errors: |data: &mut [u8]| rs255w238::correct_errors(data).ok(),
    },
    239u8 => RsCodec {
        encode: rs255w239::encode,
        is_correct: rs255w239::is_correct,
        correct_errors: |data: &mut [u8]| rs255w239::correct_errors(data).ok(),
    },
    240u8 => RsCodec {
        encode: rs255w240::encode,
        is_correct: rs255w240::is_correct,
        correct_errors: |data: &mut [u8]| rs255w240::correct_errors(data).ok(),
    },
    241u8 => RsCodec {
        encode: rs255w241::encode,
        is_correct: rs255w241::is_correct,
        correct_errors: |data: &mut [u8]| rs255w241::correct_errors(data).ok(),
    },
    242u8 => RsCodec {
        encode: rs255w242::encode,
        is_correct: rs255w242::is_correct,
        correct_errors: |data: &mut [u8]| rs255w242::correct_errors(data).ok(),
    },
    243u8 => RsCodec {
        encode: rs255w243::encode,
        is_correct: rs255w243::is_correct,
        correct_errors: |data: &mut [u8]| rs255w243::correct_errors(data).ok(),
    },
    244u8 => RsCodec {
        encode: rs255w244::encode,
        is_correct: rs255w244::is_correct,
        correct_errors: |data: &mut [u8]| rs255w244::correct_errors(data).ok(),
    },
    245u8 => RsCodec {
        encode: rs255w245::encode,
        is_correct: rs255w245::is_correct,
        correct_errors: |data: &mut [u8]| rs255w245::correct_errors(data).ok(),
    },
    246u8 => RsCodec {
        encode: rs255w246::encode,
        is_correct: rs255w246::is_correct,
        correct_errors: |data: &mut [u8]| rs255w246::correct_errors(data).ok(),
    },
    247u8 => RsCodec {
        encode: rs255w247::encode,
        is_correct: rs255w247::is_correct,
        correct_errors: |data: &mut [u8]| rs255w247::correct_errors(data).ok(),
    },
    248u8 => RsCodec {
        encode: rs255w248::encode,
        is_correct: rs255w248::is_correct,
        correct_errors: |data: &mut [u8]| rs255w248::correct_errors(data).ok(),
    },
    249u8 => RsCodec {
        encode: rs255w249::encode,
        is_correct: rs255w249::is_correct,
        correct_errors: |data: &mut [u8]| rs255w249::correct_errors(data).ok(),
    },
    250u8 => RsCodec {
        encode: rs255w250::encode,
        is_correct: rs255w250::is_correct,
        correct_errors: |data: &mut [u8]| rs255w250::correct_errors(data).ok(),
    },
    251u8 => RsCodec {
        encode: rs255w251::encode,
        is_correct: rs255w251::is_correct,
        correct_errors: |data: &mut [u8]| rs255w251::correct_errors(data).ok(),
    },
    252u8 => RsCodec {
        encode: rs255w252::encode,
        is_correct: rs255w252::is_correct,
        correct_errors: |data: &mut [u8]| rs255w252::correct_errors(data).ok(),
    },
    253u8 => RsCodec {
        encode: rs255w253::encode,
        is_correct: rs255w253::is_correct,
        correct_errors: |data: &mut [u8]| rs255w253::correct_errors(data).ok(),
    },
};
