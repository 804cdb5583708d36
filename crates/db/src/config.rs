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

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_MAX_CACHED_SHARDS: usize = 8;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DatabaseConfig {
    /// How many day shards to keep resident. Dirty shards are pinned and may push residency past
    /// this until they are flushed.
    pub max_cached_shards: usize,
    /// Drop chat shards older than this many days. `None` keeps everything.
    pub retention_days: Option<u32>,

    /// File and directory names, relative to the data directory.
    pub players_file: PathBuf,
    pub chats_dir: PathBuf,
    /// Relative to `chats_dir`.
    pub chat_index_file: PathBuf,
    pub legacy_chats_file: PathBuf,
    pub legacy_archive_file: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            max_cached_shards: DEFAULT_MAX_CACHED_SHARDS,
            retention_days: None,
            players_file: PathBuf::from("players.json"),
            chats_dir: PathBuf::from("chats"),
            chat_index_file: PathBuf::from("chat_index.json"),
            legacy_chats_file: PathBuf::from("chats.json"),
            legacy_archive_file: PathBuf::from("chats_legacy_migrated.json"),
        }
    }
}
