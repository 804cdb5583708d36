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

//! Integrity envelopes for persisted files.
//!
//! Every file carries `integrityAlgo`, `integritySha256` and `integrityTime` next to its payload.
//! The digest is SHA-256 over a canonical text rendering of the payload: a format tag and schema
//! version header, then every field in a fixed order. Strings are written as `<utf8 len>:<text>`
//! so no choice of content can shift a field boundary; `-1:` stands for an absent value. Map keys
//! and sequence fields are sorted, so the digest depends on content only and not on insertion
//! history. The envelope fields themselves are not part of the digest.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use spdb_common::Millis;
use std::fmt::{Display, Formatter, Write as _};

pub const ALGORITHM_ID: &str = "sha256-v1";

/// Schema version written into every file we sign.
pub const CURRENT_SCHEMA: u32 = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity_algo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity_sha256: Option<String>,
    #[serde(default)]
    pub integrity_time: Millis,
}

impl IntegrityEnvelope {
    fn is_absent(&self) -> bool {
        let blank = |v: &Option<String>| v.as_deref().is_none_or(|s| s.trim().is_empty());
        blank(&self.integrity_algo) || blank(&self.integrity_sha256)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityState {
    Valid,
    /// No envelope at all. Accepted, and re-signed on the next save.
    Missing,
    Mismatch,
    Unsupported,
}

impl IntegrityState {
    /// Whether content in this state may be applied to live state.
    pub fn is_acceptable(self) -> bool {
        matches!(self, Self::Valid | Self::Missing)
    }
}

impl Display for IntegrityState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Valid => "valid",
            Self::Missing => "missing integrity metadata",
            Self::Mismatch => "digest mismatch",
            Self::Unsupported => "unsupported integrity algorithm",
        };
        f.write_str(text)
    }
}

/// Builds the canonical text for a payload.
#[derive(Default)]
pub struct CanonicalWriter {
    buf: String,
}

impl CanonicalWriter {
    pub fn new(format_tag: &str, schema: u32) -> Self {
        let mut w = Self::default();
        w.line(format_tag);
        w.number(i64::from(schema));
        w
    }

    fn line(&mut self, raw: &str) {
        self.buf.push_str(raw);
        self.buf.push('\n');
    }

    pub fn number(&mut self, value: i64) {
        // Writing into a String cannot fail.
        let _ = writeln!(self.buf, "{value}");
    }

    pub fn count(&mut self, value: usize) {
        let _ = writeln!(self.buf, "{value}");
    }

    pub fn token(&mut self, value: Option<&str>) {
        match value {
            None => self.buf.push_str("-1:"),
            Some(v) => {
                let _ = write!(self.buf, "{}:{v}", v.len());
            }
        }
        self.buf.push('\n');
    }

    pub fn text(&mut self, value: &str) {
        self.token(Some(value));
    }

    /// A sequence field, written in sorted order.
    pub fn sorted_seq<'a>(&mut self, values: impl IntoIterator<Item = &'a String>) {
        let mut sorted: Vec<&String> = values.into_iter().collect();
        sorted.sort();
        self.count(sorted.len());
        for v in sorted {
            self.text(v);
        }
    }

    pub fn finish(self) -> String {
        self.buf
    }
}

/// A persisted payload that can be rendered canonically and carries an envelope.
pub trait Canonical {
    const FORMAT_TAG: &'static str;

    fn schema(&self) -> u32;
    fn set_schema(&mut self, schema: u32);
    fn envelope(&self) -> &IntegrityEnvelope;
    fn envelope_mut(&mut self) -> &mut IntegrityEnvelope;

    /// Write the payload fields (everything after the header) in canonical order.
    fn write_body(&self, w: &mut CanonicalWriter);
}

pub fn canonicalize<T: Canonical>(payload: &T) -> String {
    let mut w = CanonicalWriter::new(T::FORMAT_TAG, payload.schema());
    payload.write_body(&mut w);
    w.finish()
}

pub fn digest_hex<T: Canonical>(payload: &T) -> String {
    let digest = Sha256::digest(canonicalize(payload).as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Stamp `payload` with a fresh envelope at the current schema version.
pub fn sign<T: Canonical>(payload: &mut T, now: Millis) {
    payload.set_schema(CURRENT_SCHEMA);
    let digest = digest_hex(payload);
    let envelope = payload.envelope_mut();
    envelope.integrity_algo = Some(ALGORITHM_ID.to_string());
    envelope.integrity_sha256 = Some(digest);
    envelope.integrity_time = now;
}

pub fn verify<T: Canonical>(payload: &T) -> IntegrityState {
    let envelope = payload.envelope();
    if envelope.is_absent() {
        return IntegrityState::Missing;
    }
    let algo = envelope.integrity_algo.as_deref().unwrap_or_default().trim();
    if algo != ALGORITHM_ID {
        return IntegrityState::Unsupported;
    }
    let stored = envelope
        .integrity_sha256
        .as_deref()
        .unwrap_or_default()
        .trim();
    if stored.eq_ignore_ascii_case(&digest_hex(payload)) {
        IntegrityState::Valid
    } else {
        IntegrityState::Mismatch
    }
}
