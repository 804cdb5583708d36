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

//! The chat ledger: a date-sharded, append-only log of chat entries indexed by stable code.
//!
//! Each UTC calendar day is one shard file. Shards are loaded on demand into a small LRU cache.
//! A shard with unflushed writes is pinned in the cache until it has been written out, so
//! residency can temporarily exceed the cap but pending entries are never dropped.
//!
//! At open the code -> dates index and the entry counter are rebuilt from the shards themselves.
//! The stored index file is only verified and reported on, never trusted.

use crate::error::{DbError, IntegrityViolation};
use crate::files::{ChatExportFile, ChatIndexFile, ChatShardFile};
use crate::integrity::{IntegrityState, sign, verify};
use crate::storage::LedgerStorage;
use chrono::{DateTime, NaiveDate};
use indexmap::IndexSet;
use serde::Serialize;
use spdb_common::{ChatEntry, DedupeKey, Millis, normalize_server, safe_name};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, error, info, warn};

const MILLIS_PER_DAY: Millis = 86_400_000;

/// `YYYYMMDD` for the UTC day containing `time`.
pub fn date_key(time: Millis) -> Option<String> {
    DateTime::from_timestamp_millis(time).map(|dt| dt.format("%Y%m%d").to_string())
}

pub fn is_valid_date_key(date: &str) -> bool {
    date.len() == 8
        && date.bytes().all(|b| b.is_ascii_digit())
        && NaiveDate::parse_from_str(date, "%Y%m%d").is_ok()
}

/// First date key that survives a retention of `days` days as of `now`.
pub fn retention_cutoff(now: Millis, days: u32) -> Option<String> {
    date_key(now - Millis::from(days) * MILLIS_PER_DAY)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub shards_checked: usize,
    pub shards_valid: usize,
    pub shards_missing: usize,
    pub shards_mismatch: usize,
    pub shards_unsupported: usize,
    pub index_state: IntegrityState,
    pub issues: Vec<String>,
}

impl Default for IntegrityReport {
    fn default() -> Self {
        Self {
            shards_checked: 0,
            shards_valid: 0,
            shards_missing: 0,
            shards_mismatch: 0,
            shards_unsupported: 0,
            index_state: IntegrityState::Missing,
            issues: vec![],
        }
    }
}

impl IntegrityReport {
    pub fn has_issues(&self) -> bool {
        !self.issues.is_empty()
            || self.shards_mismatch > 0
            || self.shards_unsupported > 0
            || !self.index_state.is_acceptable()
    }

    fn issue(&mut self, text: String) {
        if !self.issues.contains(&text) {
            self.issues.push(text);
        }
    }

    fn count(&mut self, state: IntegrityState) {
        self.shards_checked += 1;
        match state {
            IntegrityState::Valid => self.shards_valid += 1,
            IntegrityState::Missing => self.shards_missing += 1,
            IntegrityState::Mismatch => self.shards_mismatch += 1,
            IntegrityState::Unsupported => self.shards_unsupported += 1,
        }
    }
}

#[derive(Debug, Default)]
struct Shard {
    entries: Vec<ChatEntry>,
    seen: HashSet<DedupeKey>,
}

impl Shard {
    fn new(entries: Vec<ChatEntry>) -> Self {
        let seen = entries.iter().map(ChatEntry::dedupe_key).collect();
        Self { entries, seen }
    }
}

/// Clean up entries read from a file: drop unusable and duplicate ones, normalize the rest.
fn normalize_entries(entries: Vec<ChatEntry>) -> Vec<ChatEntry> {
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter_map(|e| {
            let uid = e.uid.trim().to_string();
            if uid.is_empty() || e.message.trim().is_empty() || e.time <= 0 {
                return None;
            }
            Some(ChatEntry {
                uid,
                sender_name: safe_name(&e.sender_name),
                message: e.message,
                server: normalize_server(&e.server),
                time: e.time,
            })
        })
        .filter(|e| seen.insert(e.dedupe_key()))
        .collect()
}

/// What happened to a shard file when it was read.
enum ShardRead {
    Absent,
    Accepted {
        entries: Vec<ChatEntry>,
        state: IntegrityState,
    },
    Refused {
        state: IntegrityState,
        reason: String,
    },
}

pub struct ChatLedger {
    storage: Box<dyn LedgerStorage>,
    cache: HashMap<String, Shard>,
    /// Cached dates, least recently touched first.
    lru: IndexSet<String>,
    dirty: BTreeSet<String>,
    code_dates: BTreeMap<String, BTreeSet<String>>,
    date_counts: BTreeMap<String, usize>,
    total_entries: u64,
    index_dirty: bool,
    max_cached: usize,
    report: IntegrityReport,
}

impl ChatLedger {
    /// An empty ledger over `storage`, without reading anything from it.
    pub fn new(storage: Box<dyn LedgerStorage>, max_cached_shards: usize) -> Self {
        Self {
            storage,
            cache: HashMap::new(),
            lru: IndexSet::new(),
            dirty: BTreeSet::new(),
            code_dates: BTreeMap::new(),
            date_counts: BTreeMap::new(),
            total_entries: 0,
            index_dirty: false,
            max_cached: max_cached_shards.max(1),
            report: IntegrityReport::default(),
        }
    }

    /// Open the ledger, rebuilding the index from every shard. Shards that fail verification
    /// are moved aside and left out; unsigned shards are loaded and queued for re-signing.
    pub fn open(
        storage: Box<dyn LedgerStorage>,
        max_cached_shards: usize,
        now: Millis,
    ) -> Result<Self, DbError> {
        let mut ledger = Self::new(storage, max_cached_shards);
        ledger.rebuild(now)?;
        Ok(ledger)
    }

    pub fn total_entries(&self) -> u64 {
        self.total_entries
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.dirty.is_empty() || self.index_dirty
    }

    pub fn cached_shards(&self) -> usize {
        self.cache.len()
    }

    pub fn integrity_report(&self) -> &IntegrityReport {
        &self.report
    }

    /// Every date known to hold entries, ascending.
    pub fn known_dates(&self) -> Vec<String> {
        let mut dates: BTreeSet<&String> = self.date_counts.keys().collect();
        dates.extend(self.cache.keys());
        dates.into_iter().cloned().collect()
    }

    pub fn dates_for_code(&self, uid: &str) -> Vec<String> {
        self.code_dates
            .get(uid.trim())
            .map(|d| d.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Append an entry. Rejects empty code or message, non-positive timestamps, and exact
    /// duplicates of an entry already in the day's shard.
    pub fn add(
        &mut self,
        uid: &str,
        sender: &str,
        message: &str,
        server: &str,
        time: Millis,
    ) -> bool {
        let uid = uid.trim();
        let message = message.trim();
        if uid.is_empty() || message.is_empty() || time <= 0 {
            return false;
        }
        let Some(date) = date_key(time) else {
            return false;
        };
        if let Err(e) = self.ensure_loaded(&date) {
            error!(error = %e, date, "Unable to load chat shard; dropping entry");
            return false;
        }
        let Some(shard) = self.cache.get_mut(&date) else {
            return false;
        };

        let entry = ChatEntry {
            uid: uid.to_string(),
            sender_name: safe_name(sender),
            message: message.to_string(),
            server: normalize_server(server),
            time,
        };
        if !shard.seen.insert(entry.dedupe_key()) {
            return false;
        }
        shard.entries.push(entry);

        *self.date_counts.entry(date.clone()).or_default() += 1;
        self.total_entries += 1;
        self.add_code_date(uid, &date);
        self.dirty.insert(date);
        self.index_dirty = true;
        true
    }

    /// All entries for `uid`, newest first. Only shards the index lists for `uid` are read.
    pub fn find_by_code(&mut self, uid: &str) -> Vec<ChatEntry> {
        let uid = uid.trim();
        let Some(dates) = self.code_dates.get(uid) else {
            return vec![];
        };
        let dates: Vec<String> = dates.iter().rev().cloned().collect();

        let mut out = vec![];
        for date in dates {
            out.extend(
                self.with_shard(&date, |shard| {
                    shard
                        .entries
                        .iter()
                        .filter(|e| e.uid == uid)
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default(),
            );
        }
        out.sort_by(|a, b| b.canonical_cmp(a));
        out
    }

    /// A page of the newest entries across all shards.
    pub fn find_recent(&mut self, offset: usize, limit: usize) -> Vec<ChatEntry> {
        if limit == 0 {
            return vec![];
        }
        let mut all = vec![];
        for date in self.known_dates() {
            all.extend(
                self.with_shard(&date, |shard| shard.entries.clone())
                    .unwrap_or_default(),
            );
        }
        all.sort_by(|a, b| b.canonical_cmp(a));
        all.into_iter().skip(offset).take(limit).collect()
    }

    /// Rewrite `old_uid` to `new_uid` on every entry, moving its index entries along.
    pub fn move_code(&mut self, old_uid: &str, new_uid: &str) -> bool {
        let (old_uid, new_uid) = (old_uid.trim(), new_uid.trim());
        if old_uid.is_empty() || new_uid.is_empty() || old_uid == new_uid {
            return false;
        }
        let Some(dates) = self.code_dates.get(old_uid).cloned() else {
            return false;
        };

        let mut changed = false;
        for date in dates {
            if let Err(e) = self.ensure_loaded(&date) {
                error!(error = %e, date, "Unable to load chat shard while moving code");
                continue;
            }
            let Some(shard) = self.cache.get_mut(&date) else {
                continue;
            };

            let mut touched = false;
            for entry in shard.entries.iter_mut().filter(|e| e.uid == old_uid) {
                entry.uid = new_uid.to_string();
                touched = true;
            }
            if !touched {
                continue;
            }

            // Rewritten entries may now duplicate ones already filed under the new code.
            let before = shard.entries.len();
            *shard = Shard::new(normalize_entries(std::mem::take(&mut shard.entries)));
            let removed = before - shard.entries.len();
            if removed > 0 {
                if let Some(count) = self.date_counts.get_mut(&date) {
                    *count = count.saturating_sub(removed);
                }
                self.total_entries = self.total_entries.saturating_sub(removed as u64);
            }

            self.add_code_date(new_uid, &date);
            self.dirty.insert(date);
            changed = true;
        }

        if changed {
            self.code_dates.remove(old_uid);
            self.index_dirty = true;
            info!(from = old_uid, to = new_uid, "Moved chat entries to new code");
        }
        changed
    }

    /// Write every dirty shard and, if it changed, the index. Shards that fail to write stay
    /// dirty (and pinned) for the next attempt; the first error is returned after all writes
    /// have been tried.
    pub fn flush(&mut self, now: Millis) -> Result<usize, DbError> {
        let mut written = 0;
        let mut first_error = None;

        for date in self.dirty.clone() {
            let Some(shard) = self.cache.get(&date) else {
                self.dirty.remove(&date);
                continue;
            };
            let mut entries = shard.entries.clone();
            entries.sort_by(|a, b| a.canonical_cmp(b));
            let mut file = ChatShardFile {
                date: date.clone(),
                entries,
                ..Default::default()
            };
            sign(&mut file, now);
            match self.storage.write_shard(&file) {
                Ok(()) => {
                    self.dirty.remove(&date);
                    written += 1;
                }
                Err(e) => {
                    error!(error = %e, date, "Failed to write chat shard");
                    first_error.get_or_insert(e);
                }
            }
        }

        if self.index_dirty {
            let mut file = ChatIndexFile {
                uid_dates: self
                    .code_dates
                    .iter()
                    .map(|(uid, dates)| (uid.clone(), dates.iter().cloned().collect()))
                    .collect(),
                total_entries: self.total_entries,
                updated_at: now,
                ..Default::default()
            };
            sign(&mut file, now);
            match self.storage.write_index(&file) {
                Ok(()) => {
                    self.index_dirty = false;
                    self.report.index_state = IntegrityState::Valid;
                }
                Err(e) => {
                    error!(error = %e, "Failed to write chat index");
                    first_error.get_or_insert(e);
                }
            }
        }

        self.trim_cache();
        if written > 0 {
            debug!(shards = written, "Flushed chat shards");
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// Every entry, oldest first, in export form (unsigned).
    pub fn snapshot(&mut self) -> ChatExportFile {
        let mut entries = vec![];
        for date in self.known_dates() {
            entries.extend(
                self.with_shard(&date, |shard| shard.entries.clone())
                    .unwrap_or_default(),
            );
        }
        entries.sort_by(|a, b| a.canonical_cmp(b));
        ChatExportFile {
            entries,
            ..Default::default()
        }
    }

    /// Add every entry of `incoming`; returns how many were new.
    pub fn merge_from(&mut self, incoming: &ChatExportFile) -> usize {
        incoming
            .entries
            .iter()
            .filter(|e| self.add(&e.uid, &e.sender_name, &e.message, &e.server, e.time))
            .count()
    }

    /// Verify then merge an imported chat export. Nothing is applied unless it verifies or
    /// carries no envelope at all.
    pub fn import(&mut self, incoming: &ChatExportFile, subject: &str) -> Result<usize, DbError> {
        let state = verify(incoming);
        if !state.is_acceptable() {
            warn!(subject, %state, "Refusing chat import");
            return Err(IntegrityViolation {
                subject: subject.to_string(),
                state,
            }
            .into());
        }
        if state == IntegrityState::Missing {
            warn!(subject, "Importing chat export without integrity metadata");
        }
        let added = self.merge_from(incoming);
        info!(subject, added, "Imported chat entries");
        Ok(added)
    }

    /// Delete whole shards dated before `cutoff_date`. Returns the number of shards dropped.
    pub fn apply_retention(&mut self, cutoff_date: &str) -> Result<usize, DbError> {
        if !is_valid_date_key(cutoff_date) {
            return Ok(0);
        }
        let expired: Vec<String> = self
            .known_dates()
            .into_iter()
            .filter(|d| d.as_str() < cutoff_date)
            .collect();
        for date in &expired {
            self.storage.remove_shard(date)?;
            self.forget_date(date);
        }
        if !expired.is_empty() {
            info!(shards = expired.len(), cutoff_date, "Applied chat retention");
        }
        Ok(expired.len())
    }

    /// Fold the pre-sharding single-file store into the shards, then archive it. A legacy file
    /// that fails verification is moved aside instead.
    pub fn migrate_legacy(&mut self, now: Millis) -> Result<usize, DbError> {
        let file = match self.storage.read_legacy() {
            Ok(Some(file)) => file,
            Ok(None) => return Ok(0),
            Err(e) if e.is_untrusted_content() => {
                let moved = self.storage.quarantine_legacy(now)?;
                self.report
                    .issue(format!("legacy chat store unreadable ({e}); moved to {moved:?}"));
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let state = verify(&file);
        if !state.is_acceptable() {
            let moved = self.storage.quarantine_legacy(now)?;
            self.report
                .issue(format!("legacy chat store rejected: {state}; moved to {moved:?}"));
            return Err(IntegrityViolation {
                subject: "legacy chat store".to_string(),
                state,
            }
            .into());
        }

        let merged = self.merge_from(&file);
        self.flush(now)?;
        self.storage.archive_legacy()?;
        info!(merged, "Migrated legacy chat store");
        Ok(merged)
    }

    fn rebuild(&mut self, now: Millis) -> Result<(), DbError> {
        self.report = IntegrityReport::default();
        self.report.index_state = match self.storage.read_index() {
            Ok(Some(index)) => verify(&index),
            Ok(None) => IntegrityState::Missing,
            Err(e) if e.is_untrusted_content() => {
                warn!(error = %e, "Chat index unreadable; rebuilding");
                IntegrityState::Mismatch
            }
            Err(e) => return Err(e),
        };
        if !self.report.index_state.is_acceptable() {
            let state = self.report.index_state;
            self.report.issue(format!("chat index failed verification: {state}"));
        }

        for date in self.storage.shard_dates()? {
            match self.read_shard(&date)? {
                ShardRead::Absent => continue,
                ShardRead::Refused { state, reason } => {
                    self.report.count(state);
                    self.refuse_shard(&date, &reason, now)?;
                }
                ShardRead::Accepted { entries, state } => {
                    self.report.count(state);
                    self.total_entries += entries.len() as u64;
                    self.date_counts.insert(date.clone(), entries.len());
                    for e in &entries {
                        self.add_code_date(&e.uid, &date);
                    }
                    if state == IntegrityState::Missing {
                        self.cache.insert(date.clone(), Shard::new(entries));
                        self.dirty.insert(date.clone());
                        self.touch(&date);
                    }
                }
            }
        }

        // The stored index is never trusted; always write the rebuilt one.
        self.index_dirty = true;
        info!(
            shards = self.report.shards_checked,
            entries = self.total_entries,
            issues = self.report.issues.len(),
            "Rebuilt chat index"
        );
        Ok(())
    }

    fn read_shard(&self, date: &str) -> Result<ShardRead, DbError> {
        let file = match self.storage.read_shard(date) {
            Ok(Some(file)) => file,
            Ok(None) => return Ok(ShardRead::Absent),
            Err(e) if e.is_untrusted_content() => {
                return Ok(ShardRead::Refused {
                    state: IntegrityState::Mismatch,
                    reason: format!("unreadable: {e}"),
                });
            }
            Err(e) => return Err(e),
        };

        let state = verify(&file);
        if !state.is_acceptable() {
            return Ok(ShardRead::Refused {
                state,
                reason: state.to_string(),
            });
        }
        if file.date != date {
            return Ok(ShardRead::Refused {
                state: IntegrityState::Mismatch,
                reason: format!("file names date {date} but holds {}", file.date),
            });
        }
        Ok(ShardRead::Accepted {
            entries: normalize_entries(file.entries),
            state,
        })
    }

    fn refuse_shard(&mut self, date: &str, reason: &str, now: Millis) -> Result<(), DbError> {
        let moved = self.storage.quarantine_shard(date, now)?;
        warn!(date, reason, ?moved, "Refused chat shard");
        self.report.issue(match moved {
            Some(to) => format!("chat shard {date} refused ({reason}); moved to {to}"),
            None => format!("chat shard {date} refused ({reason})"),
        });
        Ok(())
    }

    fn ensure_loaded(&mut self, date: &str) -> Result<(), DbError> {
        if self.cache.contains_key(date) {
            self.touch(date);
            return Ok(());
        }
        if !is_valid_date_key(date) {
            return Ok(());
        }

        let entries = match self.read_shard(date)? {
            ShardRead::Absent => vec![],
            ShardRead::Accepted { entries, state } => {
                if state == IntegrityState::Missing {
                    self.dirty.insert(date.to_string());
                }
                entries
            }
            ShardRead::Refused { state, reason } => {
                // Changed on disk since open. Stop counting it and move it out of the way so a
                // fresh write for this date cannot replace it.
                self.report.count(state);
                self.forget_date(date);
                self.refuse_shard(date, &reason, spdb_common::now_millis())?;
                vec![]
            }
        };

        self.cache.insert(date.to_string(), Shard::new(entries));
        self.touch(date);
        Ok(())
    }

    /// Run `f` over the shard for `date`, loading it if needed. `None` if it cannot be loaded.
    fn with_shard<T>(&mut self, date: &str, f: impl FnOnce(&Shard) -> T) -> Option<T> {
        if let Err(e) = self.ensure_loaded(date) {
            error!(error = %e, date, "Unable to load chat shard");
            return None;
        }
        self.cache.get(date).map(f)
    }

    fn touch(&mut self, date: &str) {
        self.lru.shift_remove(date);
        self.lru.insert(date.to_string());
        self.trim_cache();
    }

    /// Evict least-recently-touched clean shards until within the cap. The most recently
    /// touched shard is never evicted, nor is any dirty one.
    fn trim_cache(&mut self) {
        while self.cache.len() > self.max_cached {
            let newest = self.lru.last().cloned();
            let victim = self
                .lru
                .iter()
                .find(|d| !self.dirty.contains(*d) && Some(*d) != newest.as_ref())
                .cloned();
            let Some(victim) = victim else {
                break;
            };
            self.lru.shift_remove(&victim);
            self.cache.remove(&victim);
        }
    }

    fn add_code_date(&mut self, uid: &str, date: &str) {
        let dates = self.code_dates.entry(uid.to_string()).or_default();
        if dates.insert(date.to_string()) {
            self.index_dirty = true;
        }
    }

    /// Drop every trace of `date` from memory and the index.
    fn forget_date(&mut self, date: &str) {
        let count = self.date_counts.remove(date).unwrap_or(0);
        self.total_entries = self.total_entries.saturating_sub(count as u64);
        self.cache.remove(date);
        self.lru.shift_remove(date);
        self.dirty.remove(date);
        self.code_dates.retain(|_, dates| {
            dates.remove(date);
            !dates.is_empty()
        });
        self.index_dirty = true;
    }
}
