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

//! Where the registry and the ledger keep their files.
//!
//! The registry and the ledger only ever see whole signed files; these traits decide where those
//! files live. [`FsStorage`] keeps them under a data directory, [`MemoryStorage`] keeps them in
//! process for tests.

mod fs;
mod memory;

pub use fs::FsStorage;
pub use memory::MemoryStorage;

use crate::error::DbError;
use crate::files::{ChatExportFile, ChatIndexFile, ChatShardFile, PlayersFile};
use spdb_common::Millis;

pub trait PlayerStorage: Send {
    /// `Ok(None)` when nothing has been saved yet.
    fn read_players(&self) -> Result<Option<PlayersFile>, DbError>;

    fn write_players(&mut self, file: &PlayersFile) -> Result<(), DbError>;

    /// Move the players file aside so it is never overwritten. Returns a label for where it went.
    fn quarantine_players(&mut self, now: Millis) -> Result<Option<String>, DbError>;
}

pub trait LedgerStorage: Send {
    /// Date keys of every stored shard, ascending.
    fn shard_dates(&self) -> Result<Vec<String>, DbError>;

    fn read_shard(&self, date: &str) -> Result<Option<ChatShardFile>, DbError>;

    fn write_shard(&mut self, file: &ChatShardFile) -> Result<(), DbError>;

    fn remove_shard(&mut self, date: &str) -> Result<(), DbError>;

    /// Move a shard that failed verification aside. Returns a label for where it went.
    fn quarantine_shard(&mut self, date: &str, now: Millis) -> Result<Option<String>, DbError>;

    fn read_index(&self) -> Result<Option<ChatIndexFile>, DbError>;

    fn write_index(&mut self, file: &ChatIndexFile) -> Result<(), DbError>;

    /// The pre-sharding single-file chat store, if one is still around.
    fn read_legacy(&self) -> Result<Option<ChatExportFile>, DbError>;

    /// Retire the legacy store once its content has been merged and flushed.
    fn archive_legacy(&mut self) -> Result<(), DbError>;

    fn quarantine_legacy(&mut self, now: Millis) -> Result<Option<String>, DbError>;
}

/// Shard file name for a date key.
pub fn shard_file_name(date: &str) -> String {
    format!("chats_{date}.json")
}

/// Inverse of [`shard_file_name`]; `None` for anything that isn't a live shard.
pub fn date_from_file_name(name: &str) -> Option<&str> {
    let date = name.strip_prefix("chats_")?.strip_suffix(".json")?;
    crate::chat::is_valid_date_key(date).then_some(date)
}
