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

//! The player registry: session records keyed by pid, indexed by stable code and by address.
//!
//! Mutators never fail. Malformed input is normalized away and the call reports "no change".

use crate::error::{DbError, IntegrityViolation};
use crate::files::PlayersFile;
use crate::integrity::{IntegrityState, sign, verify};
use crate::storage::PlayerStorage;
use indexmap::{IndexMap, IndexSet};
use spdb_common::model::add_unique;
use spdb_common::{
    Address, Millis, PlayerRecord, SameIpGroup, SessionId, StableCode, identity,
    normalize_server, now_millis, safe_name, strip_colors,
};
use std::cmp::Ordering;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct PlayerRegistry {
    players: IndexMap<String, PlayerRecord>,
    by_code: IndexMap<String, IndexSet<String>>,
    by_address: IndexMap<String, IndexSet<String>>,
    dirty: bool,
}

fn pid_of(text: &str) -> Option<String> {
    SessionId::parse(text).ok().map(SessionId::into_string)
}

fn code_of(text: Option<&str>) -> Option<String> {
    text.and_then(|t| StableCode::parse(t).ok())
        .map(StableCode::into_string)
}

fn address_of(text: &str) -> Option<String> {
    Address::parse(text).ok().map(Address::into_string)
}

/// Most recently seen first; ties go to the smaller pid.
fn by_recency(a: &PlayerRecord, b: &PlayerRecord) -> Ordering {
    b.last_seen
        .cmp(&a.last_seen)
        .then_with(|| a.pid.cmp(&b.pid))
}

impl PlayerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    /// True when there are changes not yet written out.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn get(&self, pid: &str) -> Option<&PlayerRecord> {
        self.players.get(&pid_of(pid)?)
    }

    pub fn bound_code(&self, pid: &str) -> Option<&str> {
        self.get(pid).and_then(|r| r.uid.as_deref())
    }

    /// Record a sighting of `pid`, creating its record on first sight.
    pub fn touch(
        &mut self,
        pid: &str,
        uid: Option<&str>,
        name: Option<&str>,
        server: Option<&str>,
        seen_at: Millis,
    ) -> bool {
        let Some(pid) = pid_of(pid) else {
            return false;
        };
        let uid = code_of(uid);

        let mut changed = false;
        let rec = self.players.entry(pid.clone()).or_insert_with(|| {
            changed = true;
            PlayerRecord::new(pid.clone(), seen_at)
        });

        if uid.is_some() && rec.uid != uid {
            rec.uid = uid;
            changed = true;
        }
        if rec.first_seen == 0 || (seen_at > 0 && seen_at < rec.first_seen) {
            rec.first_seen = seen_at;
            changed = true;
        }
        if seen_at > rec.last_seen {
            rec.last_seen = seen_at;
            changed = true;
        }
        if let Some(name) = name {
            changed |= add_unique(&mut rec.names, safe_name(name));
        }
        if let Some(server) = server {
            changed |= add_unique(&mut rec.servers, normalize_server(server));
        }

        if changed {
            self.rebuild_indexes();
            self.dirty = true;
        }
        changed
    }

    /// Set (or overwrite) the code bound to `pid`.
    pub fn bind_code(&mut self, pid: &str, uid: &str) -> bool {
        let (Some(pid), Some(uid)) = (pid_of(pid), code_of(Some(uid))) else {
            return false;
        };
        let rec = self.ensure(&pid);
        if rec.uid.as_deref() == Some(uid.as_str()) {
            return false;
        }
        rec.uid = Some(uid);
        self.rebuild_indexes();
        self.dirty = true;
        true
    }

    /// Bind `uid` only if `pid` has no code yet.
    pub fn fill_missing_code(&mut self, pid: &str, uid: &str) -> bool {
        if self.bound_code(pid).is_some() {
            return false;
        }
        self.bind_code(pid, uid)
    }

    pub fn add_name(&mut self, pid: &str, name: &str) -> bool {
        let Some(pid) = pid_of(pid) else {
            return false;
        };
        let changed = add_unique(&mut self.ensure(&pid).names, safe_name(name));
        self.dirty |= changed;
        changed
    }

    pub fn add_server(&mut self, pid: &str, server: &str) -> bool {
        let Some(pid) = pid_of(pid) else {
            return false;
        };
        let changed = add_unique(&mut self.ensure(&pid).servers, normalize_server(server));
        self.dirty |= changed;
        changed
    }

    pub fn add_ip(&mut self, pid: &str, ip: &str) -> bool {
        let (Some(pid), Some(ip)) = (pid_of(pid), address_of(ip)) else {
            return false;
        };
        if !add_unique(&mut self.ensure(&pid).ips, ip.clone()) {
            return false;
        }
        self.by_address.entry(ip).or_default().insert(pid);
        self.dirty = true;
        true
    }

    pub fn find_by_code(&self, uid: &str) -> Vec<PlayerRecord> {
        let Some(uid) = code_of(Some(uid)) else {
            return vec![];
        };
        self.collect_sorted(self.by_code.get(&uid))
    }

    pub fn find_by_address(&self, ip: &str) -> Vec<PlayerRecord> {
        let Some(ip) = address_of(ip) else {
            return vec![];
        };
        self.collect_sorted(self.by_address.get(&ip))
    }

    /// Records with any stored name containing `text`. Markup in both the needle and the stored
    /// names is ignored.
    pub fn find_by_name(&self, text: &str, case_insensitive: bool) -> Vec<PlayerRecord> {
        let needle = strip_colors(text).trim().to_string();
        if needle.is_empty() {
            return vec![];
        }
        let fold = |s: &str| {
            if case_insensitive {
                s.to_lowercase()
            } else {
                s.to_string()
            }
        };
        let needle = fold(&needle);

        let mut out: Vec<PlayerRecord> = self
            .players
            .values()
            .filter(|rec| {
                rec.names.iter().any(|name| {
                    fold(&safe_name(name)).contains(&needle) || fold(name).contains(&needle)
                })
            })
            .cloned()
            .collect();
        out.sort_by(by_recency);
        out
    }

    /// Every record, most recently seen first.
    pub fn all_by_last_seen(&self) -> Vec<PlayerRecord> {
        let mut out: Vec<PlayerRecord> = self.players.values().cloned().collect();
        out.sort_by(by_recency);
        out
    }

    /// Fold `from_pid` into `to_pid` and delete `from_pid`. Returns true when a record was folded.
    pub fn merge_into(&mut self, from_pid: &str, to_pid: &str) -> bool {
        let (Some(from_pid), Some(to_pid)) = (pid_of(from_pid), pid_of(to_pid)) else {
            return false;
        };
        if from_pid == to_pid {
            return false;
        }
        let Some(from) = self.players.shift_remove(&from_pid) else {
            return false;
        };

        let to = self
            .players
            .entry(to_pid.clone())
            .or_insert_with(|| PlayerRecord::new(to_pid.clone(), 0));
        for name in from.names {
            add_unique(&mut to.names, name);
        }
        for ip in from.ips {
            add_unique(&mut to.ips, ip);
        }
        for server in from.servers {
            add_unique(&mut to.servers, server);
        }
        if to.first_seen == 0 || (from.first_seen > 0 && from.first_seen < to.first_seen) {
            to.first_seen = from.first_seen;
        }
        to.last_seen = to.last_seen.max(from.last_seen);
        if to.uid.is_none() {
            to.uid = from.uid;
        }

        debug!(from = %from_pid, to = %to_pid, "Merged player record");
        self.rebuild_indexes();
        self.dirty = true;
        true
    }

    /// Collapse every record carrying `uid` into the most recently seen one.
    pub fn merge_by_code(&mut self, uid: &str) -> usize {
        let Some(uid) = code_of(Some(uid)) else {
            return 0;
        };
        let Some(pids) = self.by_code.get(&uid) else {
            return 0;
        };
        if pids.len() <= 1 {
            return 0;
        }

        let mut candidates: Vec<&PlayerRecord> =
            pids.iter().filter_map(|p| self.players.get(p)).collect();
        candidates.sort_by(|a, b| by_recency(a, b));
        let Some(target) = candidates.first().map(|r| r.pid.clone()) else {
            return 0;
        };
        let others: Vec<String> = candidates
            .iter()
            .skip(1)
            .map(|r| r.pid.clone())
            .collect();

        let merged = others
            .iter()
            .filter(|pid| self.merge_into(pid, &target))
            .count();
        self.bind_code(&target, &uid);

        if merged > 0 {
            info!(code = %uid, canonical = %target, merged, "Merged records sharing a code");
        }
        merged
    }

    /// [`Self::merge_by_code`] for every code. A second call finds nothing left to merge.
    pub fn merge_all_same_code(&mut self) -> usize {
        let codes: Vec<String> = self
            .by_code
            .iter()
            .filter(|(_, pids)| pids.len() > 1)
            .map(|(uid, _)| uid.clone())
            .collect();
        codes.iter().map(|uid| self.merge_by_code(uid)).sum()
    }

    /// Rewrite every record bound to `from_uid` to `to_uid`. Returns the number rewritten.
    pub fn rebind_code(&mut self, from_uid: &str, to_uid: &str) -> usize {
        let (Some(from_uid), Some(to_uid)) = (code_of(Some(from_uid)), code_of(Some(to_uid)))
        else {
            return 0;
        };
        if from_uid == to_uid {
            return 0;
        }
        let mut changed = 0;
        for rec in self.players.values_mut() {
            if rec.uid.as_deref() == Some(from_uid.as_str()) {
                rec.uid = Some(to_uid.clone());
                changed += 1;
            }
        }
        if changed > 0 {
            self.rebuild_indexes();
            self.dirty = true;
        }
        changed
    }

    /// Give code-less records whose pid is itself a raw session token the code it derives to.
    pub fn backfill_codes_from_pids(&mut self) -> usize {
        let mut changed = 0;
        for rec in self.players.values_mut().filter(|r| r.uid.is_none()) {
            if let Some(code) = identity::derive(&rec.pid) {
                rec.uid = Some(code.into_string());
                changed += 1;
            }
        }
        if changed > 0 {
            self.rebuild_indexes();
            self.dirty = true;
        }
        changed
    }

    /// Addresses shared by at least `min_accounts` records (never fewer than two).
    pub fn find_same_address_groups(&self, min_accounts: usize) -> Vec<SameIpGroup> {
        let min = min_accounts.max(2);
        let mut groups: Vec<SameIpGroup> = self
            .by_address
            .iter()
            .filter(|(_, pids)| pids.len() >= min)
            .filter_map(|(ip, pids)| {
                let players = self.collect_sorted(Some(pids));
                if players.len() < min {
                    return None;
                }
                let latest_seen = players.first().map(|r| r.last_seen).unwrap_or_default();
                Some(SameIpGroup {
                    ip: ip.clone(),
                    players,
                    latest_seen,
                })
            })
            .collect();

        groups.sort_by(|a, b| {
            b.players
                .len()
                .cmp(&a.players.len())
                .then_with(|| b.latest_seen.cmp(&a.latest_seen))
                .then_with(|| a.ip.cmp(&b.ip))
        });
        groups
    }

    /// Unsigned copy of the whole registry in file form.
    pub fn snapshot(&self) -> PlayersFile {
        PlayersFile {
            players: self
                .players
                .iter()
                .map(|(pid, rec)| (pid.clone(), rec.clone()))
                .collect(),
            ..Default::default()
        }
    }

    /// Replace all state with the content of `file`. Records are normalized on the way in.
    pub fn load(&mut self, file: PlayersFile) {
        self.players.clear();
        for (key, rec) in file.players {
            let Some(pid) = pid_of(&rec.pid).or_else(|| pid_of(&key)) else {
                continue;
            };
            let mut clean = PlayerRecord {
                pid: pid.clone(),
                uid: code_of(rec.uid.as_deref()),
                first_seen: rec.first_seen,
                last_seen: rec.last_seen,
                ..Default::default()
            };
            for name in &rec.names {
                add_unique(&mut clean.names, safe_name(name));
            }
            for ip in rec.ips.iter().filter_map(|ip| address_of(ip)) {
                add_unique(&mut clean.ips, ip);
            }
            for server in &rec.servers {
                add_unique(&mut clean.servers, normalize_server(server));
            }
            self.players.insert(pid, clean);
        }
        self.rebuild_indexes();
        self.dirty = false;
    }

    /// Fold an imported file into the registry. Returns the number of records that changed.
    ///
    /// The incoming record's code wins; seen-times widen; name/address/server sets union.
    pub fn merge_from(&mut self, incoming: &PlayersFile) -> usize {
        let mut changed = 0;
        for (key, rec) in &incoming.players {
            let Some(pid) = pid_of(&rec.pid).or_else(|| pid_of(key)) else {
                continue;
            };
            let uid = code_of(rec.uid.as_deref());
            let seen_at = if rec.last_seen > 0 {
                rec.last_seen
            } else {
                now_millis()
            };

            let mut local = self.touch(
                &pid,
                uid.as_deref(),
                rec.latest_name(),
                Some(rec.servers.last().map(String::as_str).unwrap_or("import")),
                seen_at,
            );
            if let Some(target) = self.players.get_mut(&pid)
                && rec.first_seen > 0
                && (target.first_seen == 0 || rec.first_seen < target.first_seen)
            {
                target.first_seen = rec.first_seen;
                local = true;
            }
            for name in &rec.names {
                local |= self.add_name(&pid, name);
            }
            for ip in &rec.ips {
                local |= self.add_ip(&pid, ip);
            }
            for server in &rec.servers {
                local |= self.add_server(&pid, server);
            }
            if local {
                changed += 1;
            }
        }
        self.rebuild_indexes();
        if changed > 0 {
            self.dirty = true;
        }
        changed
    }

    /// Verify then merge an imported players file. Nothing is applied unless the file verifies as
    /// valid or carries no envelope at all.
    pub fn import(&mut self, incoming: &PlayersFile, subject: &str) -> Result<usize, DbError> {
        let state = verify(incoming);
        if !state.is_acceptable() {
            warn!(subject, %state, "Refusing players import");
            return Err(IntegrityViolation {
                subject: subject.to_string(),
                state,
            }
            .into());
        }
        if state == IntegrityState::Missing {
            warn!(subject, "Importing players file without integrity metadata");
        }
        let changed = self.merge_from(incoming);
        info!(subject, changed, "Imported players");
        Ok(changed)
    }

    /// Sign and write the registry if it has unsaved changes. On failure the registry stays
    /// dirty so the next save retries.
    pub fn save(&mut self, storage: &mut dyn PlayerStorage, now: Millis) -> Result<bool, DbError> {
        if !self.dirty {
            return Ok(false);
        }
        let mut file = self.snapshot();
        sign(&mut file, now);
        storage.write_players(&file)?;
        self.dirty = false;
        debug!(players = self.players.len(), "Saved players file");
        Ok(true)
    }

    fn ensure(&mut self, pid: &str) -> &mut PlayerRecord {
        self.players
            .entry(pid.to_string())
            .or_insert_with(|| PlayerRecord::new(pid, now_millis()))
    }

    fn collect_sorted(&self, pids: Option<&IndexSet<String>>) -> Vec<PlayerRecord> {
        let mut out: Vec<PlayerRecord> = pids
            .into_iter()
            .flatten()
            .filter_map(|pid| self.players.get(pid).cloned())
            .collect();
        out.sort_by(by_recency);
        out
    }

    fn rebuild_indexes(&mut self) {
        self.by_code.clear();
        self.by_address.clear();
        for (pid, rec) in &self.players {
            if let Some(uid) = &rec.uid {
                self.by_code
                    .entry(uid.clone())
                    .or_default()
                    .insert(pid.clone());
            }
            for ip in &rec.ips {
                self.by_address
                    .entry(ip.clone())
                    .or_default()
                    .insert(pid.clone());
            }
        }
    }
}

/// Outcome of reading the players file at startup.
#[derive(Debug)]
pub struct PlayersLoad {
    pub registry: PlayerRegistry,
    pub state: IntegrityState,
    pub issues: Vec<String>,
}

/// Load the registry from storage.
///
/// A file that fails verification (or cannot be parsed) is moved aside and the registry starts
/// empty; a file without an envelope is accepted and marked dirty so it gets signed on the next
/// save. Only a storage-level I/O failure is returned as an error.
pub fn open_registry(storage: &mut dyn PlayerStorage, now: Millis) -> Result<PlayersLoad, DbError> {
    let mut registry = PlayerRegistry::new();
    let mut issues = vec![];

    let file = match storage.read_players() {
        Ok(Some(file)) => file,
        Ok(None) => {
            return Ok(PlayersLoad {
                registry,
                state: IntegrityState::Missing,
                issues,
            });
        }
        Err(e) if e.is_untrusted_content() => {
            let moved = storage.quarantine_players(now)?;
            warn!(error = %e, ?moved, "Players file unreadable; starting empty");
            issues.push(format!("players file could not be parsed: {e}"));
            return Ok(PlayersLoad {
                registry,
                state: IntegrityState::Mismatch,
                issues,
            });
        }
        Err(e) => return Err(e),
    };

    let state = verify(&file);
    match state {
        IntegrityState::Mismatch | IntegrityState::Unsupported => {
            let moved = storage.quarantine_players(now)?;
            warn!(%state, ?moved, "Players file rejected; starting empty");
            issues.push(format!("players file rejected: {state}"));
        }
        IntegrityState::Missing => {
            registry.load(file);
            registry.mark_dirty();
        }
        IntegrityState::Valid => registry.load(file),
    }

    let backfilled = registry.backfill_codes_from_pids();
    info!(
        players = registry.len(),
        %state,
        backfilled,
        "Loaded player registry"
    );
    Ok(PlayersLoad {
        registry,
        state,
        issues,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use pretty_assertions::assert_eq;

    #[test]
    fn touch_creates_and_widens_seen_window() {
        let mut reg = PlayerRegistry::new();
        assert!(reg.touch("p1", None, Some("[red]Alice"), Some("srv a"), 100));
        assert!(reg.touch("p1", None, None, None, 50));
        assert!(reg.touch("p1", None, None, None, 200));
        assert!(!reg.touch("p1", None, Some("Alice"), Some("srv_a"), 150));

        let rec = reg.get("p1").unwrap();
        assert_eq!(rec.first_seen, 50);
        assert_eq!(rec.last_seen, 200);
        assert_eq!(rec.names, vec!["Alice".to_string()]);
        assert_eq!(rec.servers, vec!["srv_a".to_string()]);
        assert!(reg.is_dirty());
    }

    #[test]
    fn invalid_input_is_a_no_op() {
        let mut reg = PlayerRegistry::new();
        assert!(!reg.touch("   ", None, Some("x"), None, 1));
        assert!(reg.is_empty());
        reg.touch("p1", None, None, None, 1);
        assert!(!reg.bind_code("p1", "toolong"));
        assert!(!reg.add_ip("p1", "999.1.1.1"));
        assert_eq!(reg.get("p1").unwrap().uid, None);
        assert!(reg.get("p1").unwrap().ips.is_empty());
        assert_eq!(reg.find_by_code("??"), vec![]);
        assert_eq!(reg.find_by_address("nope"), vec![]);
    }

    #[test]
    fn bind_and_find_by_code() {
        let mut reg = PlayerRegistry::new();
        reg.touch("p1", None, None, None, 10);
        reg.touch("p2", Some("abc"), None, None, 20);
        assert!(reg.bind_code("p1", "abc"));
        assert!(!reg.bind_code("p1", "abc"));

        let found: Vec<String> = reg
            .find_by_code("abc")
            .into_iter()
            .map(|r| r.pid)
            .collect();
        assert_eq!(found, vec!["p2".to_string(), "p1".to_string()]);
        assert_eq!(reg.bound_code("p1"), Some("abc"));
    }

    #[test]
    fn fill_missing_code_never_overwrites() {
        let mut reg = PlayerRegistry::new();
        reg.touch("p1", Some("abc"), None, None, 1);
        assert!(!reg.fill_missing_code("p1", "xyz"));
        reg.touch("p2", None, None, None, 1);
        assert!(reg.fill_missing_code("p2", "xyz"));
        assert_eq!(reg.bound_code("p2"), Some("xyz"));
    }

    #[test]
    fn name_search() {
        let mut reg = PlayerRegistry::new();
        reg.touch("p1", None, Some("[gold]Alicia"), None, 1);
        reg.touch("p2", None, Some("MALICE"), None, 2);
        reg.touch("p3", None, Some("Bob"), None, 3);

        let hits: Vec<String> = reg
            .find_by_name("lic", true)
            .into_iter()
            .map(|r| r.pid)
            .collect();
        assert_eq!(hits, vec!["p2".to_string(), "p1".to_string()]);
        assert_eq!(reg.find_by_name("lic", false).len(), 1);
        assert!(reg.find_by_name("  ", true).is_empty());
    }

    #[test]
    fn merge_into_unions_and_removes_source() {
        let mut reg = PlayerRegistry::new();
        reg.touch("pid:1@srv", None, Some("Alice"), Some("srv"), 100);
        reg.add_ip("pid:1@srv", "1.2.3.4");
        reg.touch("token", Some("abc"), Some("Alicia"), Some("srv"), 50);

        assert!(reg.merge_into("pid:1@srv", "token"));
        assert!(reg.get("pid:1@srv").is_none());
        let rec = reg.get("token").unwrap();
        assert_eq!(rec.names, vec!["Alicia".to_string(), "Alice".to_string()]);
        assert_eq!(rec.ips, vec!["1.2.3.4".to_string()]);
        assert_eq!(rec.first_seen, 50);
        assert_eq!(rec.last_seen, 100);
        assert_eq!(rec.uid.as_deref(), Some("abc"));
        assert_eq!(reg.find_by_address("1.2.3.4")[0].pid, "token");

        assert!(!reg.merge_into("token", "token"));
        assert!(!reg.merge_into("ghost", "token"));
    }

    #[test]
    fn merge_into_takes_source_code_when_target_has_none() {
        let mut reg = PlayerRegistry::new();
        reg.touch("a", Some("abc"), None, None, 1);
        reg.touch("b", None, None, None, 2);
        reg.merge_into("a", "b");
        assert_eq!(reg.bound_code("b"), Some("abc"));
    }

    #[test]
    fn merge_by_code_elects_latest_then_smallest_pid() {
        let mut reg = PlayerRegistry::new();
        reg.touch("p3", Some("abc"), Some("C"), Some("s3"), 300);
        reg.touch("p2", Some("abc"), Some("B"), Some("s2"), 300);
        reg.touch("p1", Some("abc"), Some("A"), Some("s1"), 100);
        reg.add_ip("p1", "10.0.0.1");

        assert_eq!(reg.merge_by_code("abc"), 2);
        let survivors = reg.find_by_code("abc");
        assert_eq!(survivors.len(), 1);
        let rec = &survivors[0];
        assert_eq!(rec.pid, "p2");
        assert_eq!(rec.first_seen, 100);
        assert_eq!(rec.last_seen, 300);
        let mut names = rec.names.clone();
        names.sort();
        assert_eq!(names, vec!["A", "B", "C"]);
        assert_eq!(rec.ips, vec!["10.0.0.1".to_string()]);
        let mut servers = rec.servers.clone();
        servers.sort();
        assert_eq!(servers, vec!["s1", "s2", "s3"]);
    }

    #[test]
    fn failed_save_stays_dirty_until_retry() {
        let mut storage = MemoryStorage::new();
        let mut reg = PlayerRegistry::new();
        reg.touch("p1", None, Some("Alice"), None, 100);

        storage.files().fail_writes = true;
        assert!(reg.save(&mut storage, 200).is_err());
        assert!(reg.is_dirty());
        assert!(storage.files().players.is_none());

        storage.files().fail_writes = false;
        assert!(reg.save(&mut storage, 300).unwrap());
        assert!(!reg.is_dirty());
        assert_eq!(storage.files().players.as_ref().unwrap().players.len(), 1);
    }

    #[test]
    fn merge_all_is_idempotent() {
        let mut reg = PlayerRegistry::new();
        reg.touch("a1", Some("aaa"), None, None, 1);
        reg.touch("a2", Some("aaa"), None, None, 2);
        reg.touch("b1", Some("bbb"), None, None, 1);
        reg.touch("b2", Some("bbb"), None, None, 2);
        reg.touch("b3", Some("bbb"), None, None, 3);
        reg.touch("c1", Some("ccc"), None, None, 3);

        assert_eq!(reg.merge_all_same_code(), 3);
        assert_eq!(reg.merge_all_same_code(), 0);
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn rebind_code_rewrites_all() {
        let mut reg = PlayerRegistry::new();
        reg.touch("a", Some("old"), None, None, 1);
        reg.touch("b", Some("old"), None, None, 1);
        reg.touch("c", Some("new"), None, None, 1);
        assert_eq!(reg.rebind_code("old", "new"), 2);
        assert_eq!(reg.find_by_code("new").len(), 3);
        assert!(reg.find_by_code("old").is_empty());
        assert_eq!(reg.rebind_code("new", "new"), 0);
    }

    #[test]
    fn backfill_derives_from_token_pids() {
        let mut reg = PlayerRegistry::new();
        reg.touch("QUJDREVGR0g=", None, None, None, 1);
        reg.touch("pid:1@srv", None, None, None, 1);
        assert_eq!(reg.backfill_codes_from_pids(), 1);
        assert_eq!(reg.bound_code("QUJDREVGR0g="), Some("3TE"));
        assert_eq!(reg.bound_code("pid:1@srv"), None);
    }

    #[test]
    fn same_address_group_with_and_without_code() {
        let mut reg = PlayerRegistry::new();
        reg.touch("p1", None, None, None, 10);
        reg.touch("p2", Some("abc"), None, None, 20);
        reg.add_ip("p1", "1.2.3.4");
        reg.add_ip("p2", "1.2.3.4");
        reg.touch("p3", None, None, None, 30);
        reg.add_ip("p3", "5.6.7.8");

        let groups = reg.find_same_address_groups(2);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].ip, "1.2.3.4");
        let pids: Vec<&str> = groups[0].players.iter().map(|r| r.pid.as_str()).collect();
        assert_eq!(pids, vec!["p2", "p1"]);
        assert_eq!(groups[0].latest_seen, 20);
    }

    #[test]
    fn same_address_groups_order() {
        let mut reg = PlayerRegistry::new();
        for (pid, ip, seen) in [
            ("a", "9.9.9.9", 5),
            ("b", "9.9.9.9", 6),
            ("c", "1.1.1.1", 50),
            ("d", "1.1.1.1", 1),
            ("e", "2.2.2.2", 1),
            ("f", "2.2.2.2", 1),
            ("g", "2.2.2.2", 1),
        ] {
            reg.touch(pid, None, None, None, seen);
            reg.add_ip(pid, ip);
        }
        let ips: Vec<String> = reg
            .find_same_address_groups(0)
            .into_iter()
            .map(|g| g.ip)
            .collect();
        assert_eq!(ips, vec!["2.2.2.2", "1.1.1.1", "9.9.9.9"]);
    }

    #[test]
    fn snapshot_load_preserves_records() {
        let mut reg = PlayerRegistry::new();
        reg.touch("p1", Some("abc"), Some("Alice"), Some("srv"), 10);
        reg.add_ip("p1", "1.2.3.4");
        let snap = reg.snapshot();

        let mut other = PlayerRegistry::new();
        other.load(snap);
        assert!(!other.is_dirty());
        assert_eq!(other.get("p1"), reg.get("p1"));
        assert_eq!(other.find_by_address("1.2.3.4").len(), 1);
    }

    #[test]
    fn import_merge_semantics() {
        let mut reg = PlayerRegistry::new();
        reg.touch("p1", Some("abc"), Some("Alice"), Some("srv"), 100);

        let mut incoming = PlayersFile::default();
        let mut rec = PlayerRecord::new("p1", 50);
        rec.last_seen = 500;
        rec.uid = Some("xyz".into());
        rec.names = vec!["Alicia".into()];
        rec.ips = vec!["8.8.8.8".into()];
        incoming.players.insert("p1".into(), rec);
        incoming
            .players
            .insert("p2".into(), PlayerRecord::new("p2", 7));

        assert_eq!(reg.import(&incoming, "test").unwrap(), 2);
        let rec = reg.get("p1").unwrap();
        assert_eq!(rec.first_seen, 50);
        assert_eq!(rec.last_seen, 500);
        assert_eq!(rec.uid.as_deref(), Some("xyz"));
        assert!(rec.names.contains(&"Alicia".to_string()));
        assert!(rec.names.contains(&"Alice".to_string()));
        assert_eq!(reg.get("p2").unwrap().first_seen, 7);
    }

    #[test]
    fn tampered_import_leaves_registry_untouched() {
        let mut reg = PlayerRegistry::new();
        reg.touch("p1", Some("abc"), Some("Alice"), None, 100);
        let before = reg.snapshot();

        let mut incoming = PlayersFile::default();
        incoming
            .players
            .insert("p9".into(), PlayerRecord::new("p9", 1));
        sign(&mut incoming, 1);
        let digest = incoming.envelope.integrity_sha256.clone().unwrap();
        let flipped = if digest.starts_with('0') { "1" } else { "0" };
        incoming.envelope.integrity_sha256 = Some(format!("{flipped}{}", &digest[1..]));

        let err = reg.import(&incoming, "tampered.json").unwrap_err();
        assert!(matches!(
            err,
            DbError::Integrity(IntegrityViolation {
                state: IntegrityState::Mismatch,
                ..
            })
        ));
        assert_eq!(reg.snapshot(), before);
    }

    #[test]
    fn open_quarantines_tampered_file() {
        let mut storage = MemoryStorage::new();
        let mut reg = PlayerRegistry::new();
        reg.touch("p1", None, None, None, 1);
        reg.save(&mut storage, 5).unwrap();
        storage
            .files()
            .players
            .as_mut()
            .unwrap()
            .players
            .get_mut("p1")
            .unwrap()
            .last_seen = 999;

        let loaded = open_registry(&mut storage, 77).unwrap();
        assert_eq!(loaded.state, IntegrityState::Mismatch);
        assert!(loaded.registry.is_empty());
        assert_eq!(loaded.issues.len(), 1);
        assert_eq!(
            storage.files().quarantined,
            vec!["players.rejected-77.json".to_string()]
        );
    }

    #[test]
    fn open_accepts_unsigned_file_and_marks_dirty() {
        let mut storage = MemoryStorage::new();
        let mut file = PlayersFile::default();
        file.players
            .insert("QUJDREVGR0g=".into(), PlayerRecord::new("QUJDREVGR0g=", 1));
        storage.files().players = Some(file);

        let mut loaded = open_registry(&mut storage, 1).unwrap();
        assert_eq!(loaded.state, IntegrityState::Missing);
        assert!(loaded.registry.is_dirty());
        assert_eq!(loaded.registry.bound_code("QUJDREVGR0g="), Some("3TE"));

        assert!(loaded.registry.save(&mut storage, 2).unwrap());
        let saved = storage.files().players.clone().unwrap();
        assert_eq!(verify(&saved), IntegrityState::Valid);
    }
}
