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

use crate::error::DbError;
use crate::files::{ChatExportFile, ChatIndexFile, ChatShardFile, PlayersFile};
use crate::storage::{LedgerStorage, PlayerStorage};
use spdb_common::Millis;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Everything a [`MemoryStorage`] holds.
#[derive(Debug, Default)]
pub struct MemoryFiles {
    pub players: Option<PlayersFile>,
    pub shards: BTreeMap<String, ChatShardFile>,
    pub index: Option<ChatIndexFile>,
    pub legacy: Option<ChatExportFile>,
    pub archived_legacy: Option<ChatExportFile>,
    /// Labels of everything that was moved aside, in order.
    pub quarantined: Vec<String>,
    pub shard_writes: usize,
    /// Dates passed to `read_shard`, in call order.
    pub shard_reads: Vec<String>,
    /// While set, every write fails as an I/O error and leaves the stored files untouched.
    pub fail_writes: bool,
}

impl MemoryFiles {
    fn check_writable(&self, label: &str) -> Result<(), DbError> {
        if self.fail_writes {
            return Err(DbError::io(
                label,
                std::io::Error::other("memory storage is failing writes"),
            ));
        }
        Ok(())
    }
}

/// Process-local storage. Clones share the same files, so a caller can keep a handle to inspect
/// (or tamper with) what the registry and ledger wrote.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    inner: Arc<Mutex<MemoryFiles>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn files(&self) -> MutexGuard<'_, MemoryFiles> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl PlayerStorage for MemoryStorage {
    fn read_players(&self) -> Result<Option<PlayersFile>, DbError> {
        Ok(self.files().players.clone())
    }

    fn write_players(&mut self, file: &PlayersFile) -> Result<(), DbError> {
        let mut files = self.files();
        files.check_writable("players.json")?;
        files.players = Some(file.clone());
        Ok(())
    }

    fn quarantine_players(&mut self, now: Millis) -> Result<Option<String>, DbError> {
        let mut files = self.files();
        Ok(files.players.take().map(|_| {
            let label = format!("players.rejected-{now}.json");
            files.quarantined.push(label.clone());
            label
        }))
    }
}

impl LedgerStorage for MemoryStorage {
    fn shard_dates(&self) -> Result<Vec<String>, DbError> {
        Ok(self.files().shards.keys().cloned().collect())
    }

    fn read_shard(&self, date: &str) -> Result<Option<ChatShardFile>, DbError> {
        let mut files = self.files();
        files.shard_reads.push(date.to_string());
        Ok(files.shards.get(date).cloned())
    }

    fn write_shard(&mut self, file: &ChatShardFile) -> Result<(), DbError> {
        let mut files = self.files();
        files.check_writable(&format!("chats_{}.json", file.date))?;
        files.shard_writes += 1;
        files.shards.insert(file.date.clone(), file.clone());
        Ok(())
    }

    fn remove_shard(&mut self, date: &str) -> Result<(), DbError> {
        self.files().shards.remove(date);
        Ok(())
    }

    fn quarantine_shard(&mut self, date: &str, now: Millis) -> Result<Option<String>, DbError> {
        let mut files = self.files();
        Ok(files.shards.remove(date).map(|_| {
            let label = format!("chats_{date}.rejected-{now}.json");
            files.quarantined.push(label.clone());
            label
        }))
    }

    fn read_index(&self) -> Result<Option<ChatIndexFile>, DbError> {
        Ok(self.files().index.clone())
    }

    fn write_index(&mut self, file: &ChatIndexFile) -> Result<(), DbError> {
        let mut files = self.files();
        files.check_writable("chat_index.json")?;
        files.index = Some(file.clone());
        Ok(())
    }

    fn read_legacy(&self) -> Result<Option<ChatExportFile>, DbError> {
        Ok(self.files().legacy.clone())
    }

    fn archive_legacy(&mut self) -> Result<(), DbError> {
        let mut files = self.files();
        if let Some(legacy) = files.legacy.take() {
            files.archived_legacy = Some(legacy);
        }
        Ok(())
    }

    fn quarantine_legacy(&mut self, now: Millis) -> Result<Option<String>, DbError> {
        let mut files = self.files();
        Ok(files.legacy.take().map(|_| {
            let label = format!("chats.rejected-{now}.json");
            files.quarantined.push(label.clone());
            label
        }))
    }
}
