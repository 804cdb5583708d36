// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Derivation of the stable 3-character identity code from a raw session token.
//!
//! The output has to stay bit-for-bit identical to codes already shown to (and written down by)
//! operators, so every step here is fixed: loose base64 decode, 8-byte raw identity, a 16-byte
//! fingerprint carrying a CRC-32 of that identity, two rounds of MD5, and a glyph remap.

use crate::ids::{StableCode, ValidationError};
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use md5::{Digest, Md5};

/// Tokens are produced by a lenient encoder; accept non-zero trailing bits but insist on
/// canonical padding so the retry ladder below decides how padding is repaired.
const TOKEN_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_allow_trailing_bits(true)
        .with_decode_padding_mode(DecodePaddingMode::RequireCanonical),
);

const RAW_IDENTITY_LEN: usize = 8;
const FINGERPRINT_LEN: usize = 16;

/// Derive the stable code for `token`, or `None` if it isn't a usable identity token.
pub fn derive(token: &str) -> Option<StableCode> {
    try_derive(token).ok()
}

/// As [`derive`], reporting why a token was rejected.
pub fn try_derive(token: &str) -> Result<StableCode, ValidationError> {
    let raw = raw_identity(token)?;
    let fingerprint = fingerprint(&raw);
    let encoded = STANDARD.encode(fingerprint);
    let code = short_code(encoded.as_bytes());
    StableCode::parse(&code)
}

/// Decode the token and return its 8-byte raw identity half.
pub fn raw_identity(token: &str) -> Result<[u8; RAW_IDENTITY_LEN], ValidationError> {
    let compact: String = token.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Err(ValidationError::InvalidToken(token.to_string()));
    }

    let decoded = ["", "=", "=="]
        .iter()
        .find_map(|pad| TOKEN_ENGINE.decode(format!("{compact}{pad}")).ok())
        .ok_or_else(|| ValidationError::InvalidToken(token.to_string()))?;

    // A 16-byte token embeds the raw identity in its first half.
    match decoded.len() {
        8 | 16 => {
            let mut raw = [0u8; RAW_IDENTITY_LEN];
            raw.copy_from_slice(&decoded[..RAW_IDENTITY_LEN]);
            Ok(raw)
        }
        _ => Err(ValidationError::InvalidToken(token.to_string())),
    }
}

fn fingerprint(raw: &[u8; RAW_IDENTITY_LEN]) -> [u8; FINGERPRINT_LEN] {
    let mut out = [0u8; FINGERPRINT_LEN];
    out[..RAW_IDENTITY_LEN].copy_from_slice(raw);
    // Bytes 8..12 stay zero.
    out[12..].copy_from_slice(&crc32fast::hash(raw).to_be_bytes());
    out
}

fn short_code(encoded_fingerprint: &[u8]) -> String {
    let first = Md5::digest(encoded_fingerprint);

    let mut hasher = Md5::new();
    hasher.update(first);
    hasher.update(encoded_fingerprint);
    let second = hasher.finalize();

    STANDARD
        .encode(second)
        .chars()
        .take(3)
        .map(remap_glyph)
        .collect()
}

/// Avoid glyphs that are easy to misread in the in-game font.
fn remap_glyph(c: char) -> char {
    match c {
        'k' => 'K',
        'S' => 's',
        'l' => 'L',
        '+' => 'A',
        '/' => 'B',
        other => other,
    }
}
