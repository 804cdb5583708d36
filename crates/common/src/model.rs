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

//! Record types shared by the registry, the ledger and their on-disk files.
//!
//! Field names follow the persisted JSON layout (camelCase). All timestamps are milliseconds since
//! the Unix epoch.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Milliseconds since the epoch, as every timestamp in this crate is expressed.
pub type Millis = i64;

pub fn now_millis() -> Millis {
    chrono::Utc::now().timestamp_millis()
}

/// Everything known about one session id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PlayerRecord {
    pub pid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default)]
    pub ips: Vec<String>,
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub first_seen: Millis,
    #[serde(default)]
    pub last_seen: Millis,
}

impl PlayerRecord {
    pub fn new(pid: impl Into<String>, seen_at: Millis) -> Self {
        Self {
            pid: pid.into(),
            first_seen: seen_at,
            last_seen: seen_at,
            ..Default::default()
        }
    }

    /// The name most recently added, used as the display name.
    pub fn latest_name(&self) -> Option<&str> {
        self.names.last().map(String::as_str)
    }
}

/// Append `value` to an insertion-ordered set. Empty values are never stored.
pub fn add_unique(seq: &mut Vec<String>, value: String) -> bool {
    if value.is_empty() || seq.contains(&value) {
        return false;
    }
    seq.push(value);
    true
}

/// One observed chat message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEntry {
    pub uid: String,
    #[serde(default)]
    pub sender_name: String,
    pub message: String,
    #[serde(default)]
    pub server: String,
    #[serde(alias = "timestamp")]
    pub time: Millis,
}

/// Entries sharing a key are the same message seen twice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DedupeKey {
    pub uid: String,
    pub time: Millis,
    pub server: String,
    pub message: String,
}

impl ChatEntry {
    pub fn dedupe_key(&self) -> DedupeKey {
        DedupeKey {
            uid: self.uid.clone(),
            time: self.time,
            server: self.server.clone(),
            message: self.message.clone(),
        }
    }

    /// Total order used wherever entries are written or hashed: time, then uid, server, sender and
    /// message.
    pub fn canonical_cmp(&self, other: &Self) -> Ordering {
        self.time
            .cmp(&other.time)
            .then_with(|| self.uid.cmp(&other.uid))
            .then_with(|| self.server.cmp(&other.server))
            .then_with(|| self.sender_name.cmp(&other.sender_name))
            .then_with(|| self.message.cmp(&other.message))
    }
}

/// Records that have been seen from the same address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SameIpGroup {
    pub ip: String,
    pub players: Vec<PlayerRecord>,
    pub latest_seen: Millis,
}
