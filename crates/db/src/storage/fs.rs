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

use crate::config::DatabaseConfig;
use crate::error::DbError;
use crate::files::{
    ChatExportFile, ChatIndexFile, ChatShardFile, PlayersFile, quarantine, read_json,
    write_json_atomic,
};
use crate::storage::{LedgerStorage, PlayerStorage, date_from_file_name, shard_file_name};
use spdb_common::Millis;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Files under a data directory, laid out as configured by [`DatabaseConfig`].
#[derive(Debug, Clone)]
pub struct FsStorage {
    players_file: PathBuf,
    chats_dir: PathBuf,
    index_file: PathBuf,
    legacy_file: PathBuf,
    legacy_archive: PathBuf,
}

impl FsStorage {
    pub fn new(data_dir: &Path, config: &DatabaseConfig) -> Self {
        let chats_dir = data_dir.join(&config.chats_dir);
        Self {
            players_file: data_dir.join(&config.players_file),
            index_file: chats_dir.join(&config.chat_index_file),
            chats_dir,
            legacy_file: data_dir.join(&config.legacy_chats_file),
            legacy_archive: data_dir.join(&config.legacy_archive_file),
        }
    }

    pub fn players_path(&self) -> &Path {
        &self.players_file
    }

    pub fn chats_dir(&self) -> &Path {
        &self.chats_dir
    }

    fn shard_path(&self, date: &str) -> PathBuf {
        self.chats_dir.join(shard_file_name(date))
    }

    fn quarantine_if_present(path: &Path, now: Millis) -> Result<Option<String>, DbError> {
        if !path.exists() {
            return Ok(None);
        }
        let moved = quarantine(path, now)?;
        warn!(from = ?path, to = ?moved, "Moved rejected file aside");
        Ok(Some(moved.display().to_string()))
    }
}

impl PlayerStorage for FsStorage {
    fn read_players(&self) -> Result<Option<PlayersFile>, DbError> {
        read_json(&self.players_file)
    }

    fn write_players(&mut self, file: &PlayersFile) -> Result<(), DbError> {
        write_json_atomic(&self.players_file, file)
    }

    fn quarantine_players(&mut self, now: Millis) -> Result<Option<String>, DbError> {
        Self::quarantine_if_present(&self.players_file, now)
    }
}

impl LedgerStorage for FsStorage {
    fn shard_dates(&self) -> Result<Vec<String>, DbError> {
        let listing = match std::fs::read_dir(&self.chats_dir) {
            Ok(l) => l,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(DbError::io(&self.chats_dir, e)),
        };

        let mut dates = vec![];
        for dirent in listing {
            let dirent = dirent.map_err(|e| DbError::io(&self.chats_dir, e))?;
            let name = dirent.file_name();
            if let Some(date) = name.to_str().and_then(date_from_file_name) {
                dates.push(date.to_string());
            }
        }
        dates.sort();
        Ok(dates)
    }

    fn read_shard(&self, date: &str) -> Result<Option<ChatShardFile>, DbError> {
        read_json(&self.shard_path(date))
    }

    fn write_shard(&mut self, file: &ChatShardFile) -> Result<(), DbError> {
        write_json_atomic(&self.shard_path(&file.date), file)
    }

    fn remove_shard(&mut self, date: &str) -> Result<(), DbError> {
        let path = self.shard_path(date);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DbError::io(path, e)),
        }
    }

    fn quarantine_shard(&mut self, date: &str, now: Millis) -> Result<Option<String>, DbError> {
        Self::quarantine_if_present(&self.shard_path(date), now)
    }

    fn read_index(&self) -> Result<Option<ChatIndexFile>, DbError> {
        read_json(&self.index_file)
    }

    fn write_index(&mut self, file: &ChatIndexFile) -> Result<(), DbError> {
        write_json_atomic(&self.index_file, file)
    }

    fn read_legacy(&self) -> Result<Option<ChatExportFile>, DbError> {
        read_json(&self.legacy_file)
    }

    fn archive_legacy(&mut self) -> Result<(), DbError> {
        if !self.legacy_file.exists() {
            return Ok(());
        }
        std::fs::rename(&self.legacy_file, &self.legacy_archive)
            .map_err(|e| DbError::io(&self.legacy_file, e))?;
        info!(archive = ?self.legacy_archive, "Archived legacy chat store");
        Ok(())
    }

    fn quarantine_legacy(&mut self, now: Millis) -> Result<Option<String>, DbError> {
        Self::quarantine_if_present(&self.legacy_file, now)
    }
}
