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

//! Validated identifiers: session ids (pids), stable codes (uids) and addresses.
//!
//! Everything that enters the registry or the ledger goes through one of these first. Callers at
//! the mutation surface turn a `ValidationError` into a no-op, so nothing here is fatal.

use std::fmt::{Display, Formatter};
use std::net::IpAddr;
use std::str::FromStr;
use thiserror::Error;

/// Prefix carried by session ids synthesised from a connection slot.
pub const FALLBACK_PID_PREFIX: &str = "pid:";

/// Longest session id we accept. Tokens are ~24 characters; this leaves room for fallback ids
/// built from long server addresses.
pub const MAX_PID_LEN: usize = 256;

pub const STABLE_CODE_LEN: usize = 3;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("session id is empty")]
    EmptySessionId,
    #[error("session id is malformed: {0:?}")]
    MalformedSessionId(String),
    #[error("stable code must be {STABLE_CODE_LEN} ASCII alphanumerics, got {0:?}")]
    InvalidStableCode(String),
    #[error("not an IP address: {0:?}")]
    InvalidAddress(String),
    #[error("identity token does not decode to an 8 or 16 byte value: {0:?}")]
    InvalidToken(String),
}

/// An ephemeral per-connection identifier. Trimmed, non-empty, no control characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn parse(text: &str) -> Result<Self, ValidationError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptySessionId);
        }
        if trimmed.len() > MAX_PID_LEN || trimmed.chars().any(char::is_control) {
            return Err(ValidationError::MalformedSessionId(trimmed.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    /// The placeholder id used before any extended identity evidence arrives for a slot.
    pub fn fallback(slot: u32, server: &str) -> Self {
        Self(format!(
            "{FALLBACK_PID_PREFIX}{slot}@{}",
            normalize_server(server)
        ))
    }

    pub fn is_fallback(&self) -> bool {
        self.0.starts_with(FALLBACK_PID_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl Display for SessionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for SessionId {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

/// The 3-character derived identity code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StableCode(String);

impl StableCode {
    pub fn parse(text: &str) -> Result<Self, ValidationError> {
        let trimmed = text.trim();
        if trimmed.len() == STABLE_CODE_LEN && trimmed.bytes().all(|b| b.is_ascii_alphanumeric())
        {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(ValidationError::InvalidStableCode(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl Display for StableCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for StableCode {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

/// A network address as observed for a player. Stored in the canonical textual form of the
/// parsed address so `::1` and `0:0::1` collapse to one key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(String);

impl Address {
    pub fn parse(text: &str) -> Result<Self, ValidationError> {
        let trimmed = text.trim();
        let bare = trimmed
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .unwrap_or(trimmed);
        IpAddr::from_str(bare)
            .map(|ip| Self(ip.to_string()))
            .map_err(|_| ValidationError::InvalidAddress(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for Address {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

/// Server keys are free-form `host:port` strings; blank means "unknown" and spaces are not
/// allowed to survive into file names or dedupe keys.
pub fn normalize_server(server: &str) -> String {
    let trimmed = server.trim();
    if trimmed.is_empty() {
        return "unknown".to_string();
    }
    trimmed.replace(' ', "_")
}

/// Remove `[color]` / `[#rrggbb]` / `[]` markup from a display string. `[[` is an escaped bracket.
pub fn strip_colors(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c != '[' {
            out.push(c);
            i += 1;
            continue;
        }
        if chars.get(i + 1) == Some(&'[') {
            out.push('[');
            i += 2;
            continue;
        }
        let close = chars[i + 1..].iter().position(|&c| c == ']');
        match close {
            Some(offset) if is_color_tag(&chars[i + 1..i + 1 + offset]) => {
                i += offset + 2;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

fn is_color_tag(inner: &[char]) -> bool {
    match inner.split_first() {
        None => true,
        Some(('#', hex)) => {
            matches!(hex.len(), 3 | 4 | 6 | 8) && hex.iter().all(|c| c.is_ascii_hexdigit())
        }
        Some(_) => inner.iter().all(|c| c.is_ascii_alphabetic()),
    }
}

/// Display names are stored without markup and surrounding whitespace. A name that is nothing
/// but markup keeps its raw text rather than collapsing to empty.
pub fn safe_name(name: &str) -> String {
    let stripped = strip_colors(name);
    let stripped = stripped.trim();
    if stripped.is_empty() {
        name.trim().to_string()
    } else {
        stripped.to_string()
    }
}

/// Message bodies: markup removed, trimmed.
pub fn safe_message(message: &str) -> String {
    strip_colors(message).trim().to_string()
}
