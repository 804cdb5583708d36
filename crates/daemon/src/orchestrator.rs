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

//! The service object that owns the player registry and the chat ledger.
//!
//! All mutation happens on the thread that owns the [`Orchestrator`]: host events, the periodic
//! tick, and operator commands. Only geolocation runs elsewhere, and its results are picked up on
//! the next tick.

use crate::config::{DaemonConfig, OrchestratorSettings, as_millis};
use crate::events::HostEvent;
use crate::geo::{GeoCache, GeoLookup};
use crate::requester::IdentityRequester;
use serde::Serialize;
use spdb_common::chat_line::{code_from_display_name, parse_raw_chat_line};
use spdb_common::identity::derive;
use spdb_common::{
    ChatEntry, Millis, PlayerRecord, SameIpGroup, SessionId, StableCode,
    normalize_server, safe_message, safe_name,
};
use spdb_db::storage::{FsStorage, LedgerStorage, MemoryStorage, PlayerStorage};
use spdb_db::{
    ChatExportFile, ChatLedger, DbError, IntegrityReport, IntegrityState, PlayerRegistry,
    PlayersFile, open_registry, retention_cutoff, sign,
};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, error, info, warn};

pub const OFFLINE_SERVER: &str = "offline";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeQuery {
    pub uid: String,
    pub players: Vec<PlayerRecord>,
    pub chats: Vec<ChatEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RebindOutcome {
    pub records_rebound: usize,
    pub records_merged: usize,
    pub chats_moved: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityStatus {
    pub players_state: IntegrityState,
    pub players_issues: Vec<String>,
    pub chats: IntegrityReport,
}

impl IntegrityStatus {
    pub fn has_issues(&self) -> bool {
        !self.players_state.is_acceptable()
            || !self.players_issues.is_empty()
            || self.chats.has_issues()
    }
}

pub struct Orchestrator {
    settings: OrchestratorSettings,
    retention_days: Option<u32>,

    players_storage: Box<dyn PlayerStorage>,
    registry: PlayerRegistry,
    players_state: IntegrityState,
    players_issues: Vec<String>,
    ledger: ChatLedger,

    requester: Box<dyn IdentityRequester>,
    geo: GeoCache,

    current_server: String,
    pid_by_slot: HashMap<u32, SessionId>,
    next_request_at: HashMap<u32, Millis>,
    auto_pending_until: HashMap<u32, Millis>,

    last_save: Millis,
    last_prune: Millis,
}

impl Orchestrator {
    /// Load both stores, migrate the legacy chat file if there is one, and apply retention.
    pub fn open(
        config: &DaemonConfig,
        mut players_storage: Box<dyn PlayerStorage>,
        ledger_storage: Box<dyn LedgerStorage>,
        requester: Box<dyn IdentityRequester>,
        geo: GeoCache,
        now: Millis,
    ) -> Result<Self, DbError> {
        let loaded = open_registry(players_storage.as_mut(), now)?;
        let ledger = ChatLedger::open(ledger_storage, config.database.max_cached_shards, now)?;

        let mut orchestrator = Self {
            settings: config.orchestrator.clone(),
            retention_days: config.database.retention_days,
            players_storage,
            registry: loaded.registry,
            players_state: loaded.state,
            players_issues: loaded.issues,
            ledger,
            requester,
            geo,
            current_server: OFFLINE_SERVER.to_string(),
            pid_by_slot: HashMap::new(),
            next_request_at: HashMap::new(),
            auto_pending_until: HashMap::new(),
            last_save: now,
            last_prune: now,
        };

        match orchestrator.ledger.migrate_legacy(now) {
            Ok(0) => {}
            Ok(merged) => info!(merged, "Legacy chat store folded into shards"),
            Err(e) => warn!(error = %e, "Legacy chat store was not migrated"),
        }
        orchestrator.apply_retention(now);

        let status = orchestrator.integrity_status();
        if status.has_issues() {
            warn!(
                players = %status.players_state,
                issues = status.players_issues.len() + status.chats.issues.len(),
                "Integrity problems found while loading; see integrity status"
            );
        }
        Ok(orchestrator)
    }

    /// Files under `data_dir`.
    pub fn open_dir(
        data_dir: &Path,
        config: &DaemonConfig,
        requester: Box<dyn IdentityRequester>,
        geo: GeoCache,
        now: Millis,
    ) -> Result<Self, DbError> {
        let storage = FsStorage::new(data_dir, &config.database);
        Self::open(
            config,
            Box::new(storage.clone()),
            Box::new(storage),
            requester,
            geo,
            now,
        )
    }

    /// Process-local storage; `storage` stays usable for inspection.
    pub fn in_memory(
        config: &DaemonConfig,
        storage: &MemoryStorage,
        requester: Box<dyn IdentityRequester>,
        now: Millis,
    ) -> Result<Self, DbError> {
        Self::open(
            config,
            Box::new(storage.clone()),
            Box::new(storage.clone()),
            requester,
            GeoCache::disabled(),
            now,
        )
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut OrchestratorSettings {
        &mut self.settings
    }

    pub fn current_server(&self) -> &str {
        &self.current_server
    }

    pub fn registry(&self) -> &PlayerRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &ChatLedger {
        &self.ledger
    }

    pub fn pid_for_slot(&self, slot: u32) -> Option<&str> {
        self.pid_by_slot.get(&slot).map(SessionId::as_str)
    }

    pub fn has_pending_writes(&self) -> bool {
        self.registry.is_dirty() || self.ledger.has_pending_writes()
    }

    /// Apply one host event. Returns true when an extended identity answer was one we asked for
    /// automatically (the host may then skip showing it).
    pub fn handle(&mut self, event: HostEvent, now: Millis) -> bool {
        match event {
            HostEvent::ServerConnected { address } => {
                self.current_server = normalize_server(&address);
                self.clear_slots();
                info!(server = self.current_server, "Connected");
                false
            }
            HostEvent::Reset => {
                self.current_server = OFFLINE_SERVER.to_string();
                self.clear_slots();
                if let Err(e) = self.save(true, now) {
                    error!(error = %e, "Save on disconnect failed");
                }
                false
            }
            HostEvent::PlayerObserved {
                slot,
                name,
                address,
                time,
            } => {
                self.observe_player(slot, &name, address.as_deref(), time.unwrap_or(now));
                false
            }
            HostEvent::ChatMessage {
                slot,
                name,
                message,
                raw_line,
                time,
            } => {
                self.record_chat(
                    slot,
                    &name,
                    &message,
                    raw_line.as_deref(),
                    time.unwrap_or(now),
                );
                false
            }
            HostEvent::ExtendedIdentity {
                slot,
                name,
                token,
                names,
                ip,
                ips,
                time,
            } => {
                let time = time.unwrap_or(now);
                self.apply_extended_identity(slot, &name, &token, &names, ip.as_deref(), &ips, time);
                self.auto_pending_until
                    .remove(&slot)
                    .is_some_and(|until| until >= now)
            }
        }
    }

    /// Periodic housekeeping: pick up geolocation results, prune request bookkeeping, and save
    /// when the save interval has elapsed.
    pub fn tick(&mut self, now: Millis) {
        self.geo.drain();

        if now - self.last_prune >= as_millis(self.settings.prune_interval) {
            self.prune_requests(now);
            self.last_prune = now;
        }

        if now - self.last_save >= as_millis(self.settings.save_interval) {
            self.last_save = now;
            self.apply_retention(now);
            if let Err(e) = self.save(false, now) {
                error!(error = %e, "Periodic save failed; will retry");
            }
        }
    }

    /// Write whatever is dirty (everything when `force`). Every store is attempted; the first
    /// failure is returned and the failed store stays dirty.
    pub fn save(&mut self, force: bool, now: Millis) -> Result<(), DbError> {
        let mut first_error = None;

        if force {
            self.registry.mark_dirty();
        }
        match self
            .registry
            .save(self.players_storage.as_mut(), now)
        {
            Ok(true) => {
                self.players_state = IntegrityState::Valid;
                debug!("Players saved");
            }
            Ok(false) => {}
            Err(e) => {
                error!(error = %e, "Failed to save players");
                first_error.get_or_insert(e);
            }
        }

        if let Err(e) = self.ledger.flush(now) {
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn apply_retention(&mut self, now: Millis) {
        let Some(days) = self.retention_days else {
            return;
        };
        let Some(cutoff) = retention_cutoff(now, days) else {
            return;
        };
        if let Err(e) = self.ledger.apply_retention(&cutoff) {
            error!(error = %e, cutoff, "Chat retention failed");
        }
    }

    fn clear_slots(&mut self) {
        self.pid_by_slot.clear();
        self.next_request_at.clear();
        self.auto_pending_until.clear();
    }

    fn fallback_pid(&self, slot: u32) -> SessionId {
        SessionId::fallback(slot, &self.current_server)
    }

    fn resolve_pid(&mut self, slot: u32) -> SessionId {
        if let Some(known) = self.pid_by_slot.get(&slot) {
            return known.clone();
        }
        let pid = self.fallback_pid(slot);
        self.pid_by_slot.insert(slot, pid.clone());
        pid
    }

    /// The code for `pid`: whatever is bound, else one derived from the pid itself (and bound).
    fn code_for(&mut self, pid: &SessionId) -> Option<String> {
        if let Some(uid) = self.registry.bound_code(pid.as_str()) {
            return Some(uid.to_string());
        }
        let uid = derive(pid.as_str())?;
        self.registry.bind_code(pid.as_str(), uid.as_str());
        Some(uid.into_string())
    }

    fn observe_player(&mut self, slot: u32, name: &str, address: Option<&str>, now: Millis) {
        if !self.settings.collect_players {
            return;
        }
        let pid = self.resolve_pid(slot);

        if let Some(code) = code_from_display_name(name) {
            self.bind_slot_code(slot, name, &code, now);
        }

        let uid = self.code_for(&pid);
        let server = self.current_server.clone();
        self.registry
            .touch(pid.as_str(), uid.as_deref(), Some(name), Some(&server), now);
        if let Some(address) = address {
            self.registry.add_ip(pid.as_str(), address);
        }

        if self.settings.auto_extended_identity && self.settings.operator_is_admin {
            self.request_if_due(slot, now);
        }
    }

    /// Evidence says `slot` carries `code`. If that replaces a different code, its chat history
    /// moves along.
    fn bind_slot_code(&mut self, slot: u32, name: &str, code: &StableCode, now: Millis) {
        let pid = self.resolve_pid(slot);
        let previous = self.registry.bound_code(pid.as_str()).map(String::from);
        let server = self.current_server.clone();

        self.registry.bind_code(pid.as_str(), code.as_str());
        self.registry.touch(
            pid.as_str(),
            Some(code.as_str()),
            Some(name),
            Some(&server),
            now,
        );

        if let Some(previous) = previous
            && previous != code.as_str()
            && self.ledger.move_code(&previous, code.as_str())
        {
            info!(pid = %pid, from = previous, to = %code, "Rebound session to new code");
        }
    }

    fn record_chat(
        &mut self,
        slot: u32,
        name: &str,
        message: &str,
        raw_line: Option<&str>,
        now: Millis,
    ) -> bool {
        if let Some(code) = code_from_display_name(name) {
            self.bind_slot_code(slot, name, &code, now);
        }

        let plain_message = safe_message(message);
        let parsed = raw_line
            .and_then(|line| parse_raw_chat_line(line, &safe_name(name)))
            .filter(|p| plain_message.is_empty() || p.message.contains(&plain_message));
        let line_code = parsed
            .as_ref()
            .and_then(|p| p.code.as_deref())
            .and_then(|c| StableCode::parse(c).ok());
        if let Some(code) = &line_code {
            self.bind_slot_code(slot, name, code, now);
        }

        if !self.settings.record_chat {
            return false;
        }

        let pid = self.resolve_pid(slot);
        let bound = self.registry.bound_code(pid.as_str()).map(String::from);
        let uid = match bound {
            Some(uid) => Some(uid),
            None => match line_code {
                Some(code) => Some(code.into_string()),
                None => self.code_for(&pid),
            },
        };
        let Some(uid) = uid else {
            debug!(pid = %pid, "No code for chat sender; message not recorded");
            return false;
        };

        let (sender, body) = match parsed {
            Some(p) => (p.sender, p.message),
            None => (safe_name(name), plain_message),
        };
        let server = self.current_server.clone();
        self.ledger.add(&uid, &sender, &body, &server, now)
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_extended_identity(
        &mut self,
        slot: u32,
        name: &str,
        token: &str,
        names: &[String],
        ip: Option<&str>,
        ips: &[String],
        now: Millis,
    ) {
        let previous = self
            .pid_by_slot
            .get(&slot)
            .cloned()
            .unwrap_or_else(|| self.fallback_pid(slot));
        let evidence = SessionId::parse(token).ok();
        let pid = choose_primary_pid(&previous, evidence.as_ref());
        self.pid_by_slot.insert(slot, pid.clone());

        if pid != previous && self.registry.merge_into(previous.as_str(), pid.as_str()) {
            info!(from = %previous, to = %pid, "Folded placeholder session into traced one");
        }

        let mut uid = self.registry.bound_code(pid.as_str()).map(String::from);
        if uid.is_none()
            && let Some(derived) = derive(token)
        {
            self.registry.bind_code(pid.as_str(), derived.as_str());
            uid = Some(derived.into_string());
        }

        let server = self.current_server.clone();
        self.registry
            .touch(pid.as_str(), uid.as_deref(), Some(name), Some(&server), now);
        for name in names {
            self.registry.add_name(pid.as_str(), name);
        }
        for ip in ip.into_iter().chain(ips.iter().map(String::as_str)) {
            self.registry.add_ip(pid.as_str(), ip);
        }
    }

    fn request_if_due(&mut self, slot: u32, now: Millis) {
        if self.next_request_at.get(&slot).is_some_and(|next| now < *next) {
            return;
        }
        if self.requester.request_extended_identity(slot) {
            self.next_request_at.insert(
                slot,
                now.saturating_add(as_millis(self.settings.extended_identity_cooldown)),
            );
            self.auto_pending_until.insert(
                slot,
                now.saturating_add(as_millis(self.settings.extended_identity_pending_window)),
            );
        }
    }

    fn prune_requests(&mut self, now: Millis) {
        let stale_before = now.saturating_sub(as_millis(self.settings.stale_cooldown_after));
        self.next_request_at.retain(|_, next| *next >= stale_before);
        self.auto_pending_until.retain(|_, until| *until >= now);
    }

    // Operator surface.

    pub fn query_code(&mut self, uid: &str) -> CodeQuery {
        let uid = uid.trim().to_string();
        CodeQuery {
            players: self.registry.find_by_code(&uid),
            chats: self.ledger.find_by_code(&uid),
            uid,
        }
    }

    pub fn query_address(&self, ip: &str) -> Vec<PlayerRecord> {
        self.registry.find_by_address(ip)
    }

    pub fn query_name(&self, text: &str, case_insensitive: bool) -> Vec<PlayerRecord> {
        self.registry.find_by_name(text, case_insensitive)
    }

    pub fn query_recent(&mut self, offset: usize, limit: usize) -> Vec<ChatEntry> {
        self.ledger.find_recent(offset, limit)
    }

    pub fn players_page(&self, offset: usize, limit: usize) -> Vec<PlayerRecord> {
        self.registry
            .all_by_last_seen()
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect()
    }

    pub fn same_address_groups(&self, min_accounts: usize) -> Vec<SameIpGroup> {
        self.registry.find_same_address_groups(min_accounts)
    }

    pub fn merge_by_code(&mut self, uid: &str) -> usize {
        self.registry.merge_by_code(uid)
    }

    pub fn merge_all(&mut self) -> usize {
        self.registry.merge_all_same_code()
    }

    pub fn bind(&mut self, pid: &str, uid: &str) -> bool {
        self.registry.bind_code(pid, uid)
    }

    pub fn fill_missing_codes(&mut self) -> usize {
        self.registry.backfill_codes_from_pids()
    }

    /// Move everything filed under `from` to `to`: player records, then duplicate records now
    /// sharing `to`, then chat history.
    pub fn rebind(&mut self, from: &str, to: &str) -> RebindOutcome {
        let records_rebound = self.registry.rebind_code(from, to);
        let records_merged = if records_rebound > 0 {
            self.registry.merge_by_code(to)
        } else {
            0
        };
        let chats_moved = match (StableCode::parse(from), StableCode::parse(to)) {
            (Ok(from), Ok(to)) => self.ledger.move_code(from.as_str(), to.as_str()),
            _ => false,
        };
        RebindOutcome {
            records_rebound,
            records_merged,
            chats_moved,
        }
    }

    pub fn import_players(&mut self, file: &PlayersFile, subject: &str) -> Result<usize, DbError> {
        self.registry.import(file, subject)
    }

    pub fn export_players(&self, now: Millis) -> PlayersFile {
        let mut file = self.registry.snapshot();
        sign(&mut file, now);
        file
    }

    pub fn import_chats(&mut self, file: &ChatExportFile, subject: &str) -> Result<usize, DbError> {
        self.ledger.import(file, subject)
    }

    pub fn export_chats(&mut self, now: Millis) -> ChatExportFile {
        let mut file = self.ledger.snapshot();
        sign(&mut file, now);
        file
    }

    pub fn integrity_status(&self) -> IntegrityStatus {
        IntegrityStatus {
            players_state: self.players_state,
            players_issues: self.players_issues.clone(),
            chats: self.ledger.integrity_report().clone(),
        }
    }

    pub fn lookup_geo(&mut self, ip: &str) -> GeoLookup {
        self.geo.lookup(ip)
    }

    pub fn geo_mut(&mut self) -> &mut GeoCache {
        &mut self.geo
    }
}

/// Keep the current pid unless it is a placeholder and the evidence offers a real one.
pub fn choose_primary_pid(current: &SessionId, evidence: Option<&SessionId>) -> SessionId {
    match evidence {
        Some(evidence) if current.is_fallback() && !evidence.is_fallback() => evidence.clone(),
        _ => current.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::requester::RecordingRequester;
    use pretty_assertions::assert_eq;
    use spdb_db::verify;
    use std::time::Duration;

    const T0: Millis = 1_735_689_600_000;
    const TOKEN: &str = "QUJDREVGR0g=";
    const TOKEN_CODE: &str = "3TE";

    fn orchestrator(
        settings: impl FnOnce(&mut OrchestratorSettings),
    ) -> (Orchestrator, MemoryStorage, RecordingRequester) {
        let mut config = DaemonConfig::default();
        settings(&mut config.orchestrator);
        let storage = MemoryStorage::new();
        let requester = RecordingRequester::default();
        let orch =
            Orchestrator::in_memory(&config, &storage, Box::new(requester.clone()), T0).unwrap();
        (orch, storage, requester)
    }

    fn connect(o: &mut Orchestrator) {
        o.handle(
            HostEvent::ServerConnected {
                address: "play.example.net:6567".into(),
            },
            T0,
        );
    }

    fn observe(o: &mut Orchestrator, slot: u32, name: &str, time: Millis) {
        o.handle(
            HostEvent::PlayerObserved {
                slot,
                name: name.into(),
                address: None,
                time: Some(time),
            },
            time,
        );
    }

    fn chat(o: &mut Orchestrator, slot: u32, name: &str, message: &str, raw: Option<&str>, t: Millis) {
        o.handle(
            HostEvent::ChatMessage {
                slot,
                name: name.into(),
                message: message.into(),
                raw_line: raw.map(String::from),
                time: Some(t),
            },
            t,
        );
    }

    fn trace(o: &mut Orchestrator, slot: u32, token: &str, t: Millis) -> bool {
        o.handle(
            HostEvent::ExtendedIdentity {
                slot,
                name: "Alice".into(),
                token: token.into(),
                names: vec!["OldAlice".into()],
                ip: Some("10.0.0.1".into()),
                ips: vec!["10.0.0.2".into(), "garbage".into()],
                time: Some(t),
            },
            t,
        )
    }

    #[test]
    fn primary_pid_election() {
        let fallback = SessionId::fallback(3, "srv");
        let real = SessionId::parse(TOKEN).unwrap();
        let other = SessionId::parse("other").unwrap();
        assert_eq!(choose_primary_pid(&fallback, Some(&real)), real);
        assert_eq!(choose_primary_pid(&real, Some(&other)), real);
        assert_eq!(choose_primary_pid(&real, Some(&fallback)), real);
        assert_eq!(choose_primary_pid(&fallback, None), fallback);
    }

    #[test]
    fn observation_creates_placeholder_record() {
        let (mut o, _, _) = orchestrator(|_| {});
        connect(&mut o);
        assert_eq!(o.current_server(), "play.example.net:6567");
        observe(&mut o, 4, "[red]Alice", T0 + 1);

        let pid = o.pid_for_slot(4).unwrap().to_string();
        assert_eq!(pid, "pid:4@play.example.net:6567");
        let rec = o.registry().get(&pid).unwrap();
        assert_eq!(rec.names, vec!["Alice".to_string()]);
        assert_eq!(rec.uid, None);
        assert!(o.has_pending_writes());
    }

    #[test]
    fn display_name_code_is_bound() {
        let (mut o, _, _) = orchestrator(|_| {});
        connect(&mut o);
        observe(&mut o, 1, "Bob|x7Q", T0);
        let pid = o.pid_for_slot(1).unwrap().to_string();
        assert_eq!(o.registry().bound_code(&pid), Some("x7Q"));
        assert_eq!(o.query_code("x7Q").players.len(), 1);
    }

    #[test]
    fn extended_identity_supersedes_placeholder() {
        let (mut o, _, _) = orchestrator(|_| {});
        connect(&mut o);
        observe(&mut o, 2, "Alice", T0);
        let placeholder = o.pid_for_slot(2).unwrap().to_string();

        assert!(!trace(&mut o, 2, TOKEN, T0 + 10));
        assert_eq!(o.pid_for_slot(2), Some(TOKEN));
        assert!(o.registry().get(&placeholder).is_none());

        let rec = o.registry().get(TOKEN).unwrap();
        assert_eq!(rec.uid.as_deref(), Some(TOKEN_CODE));
        assert_eq!(rec.first_seen, T0);
        assert_eq!(rec.last_seen, T0 + 10);
        assert_eq!(rec.names, vec!["Alice".to_string(), "OldAlice".to_string()]);
        assert_eq!(rec.ips, vec!["10.0.0.1".to_string(), "10.0.0.2".to_string()]);
        assert_eq!(o.query_address("10.0.0.2").len(), 1);
    }

    #[test]
    fn auto_requests_respect_admin_and_cooldown() {
        let (mut o, _, requester) = orchestrator(|_| {});
        connect(&mut o);
        observe(&mut o, 1, "Alice", T0);
        assert!(requester.requested().is_empty());

        let (mut o, _, requester) = orchestrator(|s| s.operator_is_admin = true);
        connect(&mut o);
        observe(&mut o, 1, "Alice", T0);
        observe(&mut o, 1, "Alice", T0 + 1000);
        assert_eq!(requester.requested(), vec![1]);
        observe(&mut o, 1, "Alice", T0 + 2200);
        assert_eq!(requester.requested(), vec![1, 1]);

        // Answer inside the pending window counts as automatic, once.
        assert!(trace(&mut o, 1, TOKEN, T0 + 3000));
        assert!(!trace(&mut o, 1, TOKEN, T0 + 3001));
    }

    #[test]
    fn stale_request_bookkeeping_is_pruned() {
        let (mut o, _, requester) = orchestrator(|s| s.operator_is_admin = true);
        connect(&mut o);
        observe(&mut o, 1, "Alice", T0);
        o.tick(T0 + 6000);
        // The pending window has passed: a late answer is not automatic.
        assert!(!trace(&mut o, 1, TOKEN, T0 + 6000));
        observe(&mut o, 1, "Alice", T0 + 40_000);
        assert_eq!(requester.requested(), vec![1, 1]);
    }

    #[test]
    fn chat_is_recorded_only_when_enabled() {
        let (mut o, _, _) = orchestrator(|_| {});
        connect(&mut o);
        trace(&mut o, 1, TOKEN, T0);
        chat(&mut o, 1, "Alice", "hello", None, T0 + 1);
        assert_eq!(o.ledger().total_entries(), 0);

        o.settings_mut().record_chat = true;
        chat(&mut o, 1, "Alice", "hello", None, T0 + 2);
        let q = o.query_code(TOKEN_CODE);
        assert_eq!(q.chats.len(), 1);
        assert_eq!(q.chats[0].sender_name, "Alice");
        assert_eq!(q.chats[0].server, "play.example.net:6567");
    }

    #[test]
    fn chat_without_any_code_is_dropped() {
        let (mut o, _, _) = orchestrator(|s| s.record_chat = true);
        connect(&mut o);
        chat(&mut o, 5, "Nobody", "hi", None, T0);
        assert_eq!(o.ledger().total_entries(), 0);
    }

    #[test]
    fn code_from_raw_line_rebinds_and_moves_history() {
        let (mut o, _, _) = orchestrator(|s| s.record_chat = true);
        connect(&mut o);
        trace(&mut o, 1, TOKEN, T0);
        chat(&mut o, 1, "Alice", "first", None, T0 + 1);
        assert_eq!(o.query_code(TOKEN_CODE).chats.len(), 1);

        chat(
            &mut o,
            1,
            "Alice",
            "second",
            Some("[coral][[[white]Alice [gray]Zq9[coral]]: [white]second"),
            T0 + 2,
        );
        assert!(o.query_code(TOKEN_CODE).chats.is_empty());
        let q = o.query_code("Zq9");
        let msgs: Vec<&str> = q.chats.iter().map(|c| c.message.as_str()).collect();
        assert_eq!(msgs, vec!["second", "first"]);
        assert_eq!(o.registry().bound_code(TOKEN), Some("Zq9"));
    }

    #[test]
    fn reset_forces_save_and_goes_offline() {
        let (mut o, storage, _) = orchestrator(|_| {});
        connect(&mut o);
        observe(&mut o, 1, "Alice", T0);
        o.handle(HostEvent::Reset, T0 + 5);
        assert_eq!(o.current_server(), OFFLINE_SERVER);
        assert_eq!(o.pid_for_slot(1), None);
        assert!(!o.has_pending_writes());
        let file = storage.files().players.clone().unwrap();
        assert_eq!(verify(&file), IntegrityState::Valid);
        assert_eq!(file.players.len(), 1);
    }

    #[test]
    fn tick_saves_on_interval() {
        let (mut o, storage, _) = orchestrator(|_| {});
        connect(&mut o);
        observe(&mut o, 1, "Alice", T0);
        o.tick(T0 + 1000);
        assert!(storage.files().players.is_none());
        o.tick(T0 + 5000);
        assert!(storage.files().players.is_some());
        assert!(!o.has_pending_writes());
    }

    #[test]
    fn rebind_moves_records_and_chats() {
        let (mut o, _, _) = orchestrator(|s| s.record_chat = true);
        connect(&mut o);
        trace(&mut o, 1, TOKEN, T0);
        chat(&mut o, 1, "Alice", "hi", None, T0 + 1);
        observe(&mut o, 2, "Alt|Ab1", T0 + 2);

        let outcome = o.rebind(TOKEN_CODE, "Ab1");
        assert_eq!(
            outcome,
            RebindOutcome {
                records_rebound: 1,
                records_merged: 1,
                chats_moved: true,
            }
        );
        let q = o.query_code("Ab1");
        assert_eq!(q.players.len(), 1);
        assert_eq!(q.chats.len(), 1);
        assert!(o.query_code(TOKEN_CODE).players.is_empty());
    }

    #[test]
    fn export_import_round_trip_between_instances() {
        let (mut a, _, _) = orchestrator(|s| s.record_chat = true);
        connect(&mut a);
        trace(&mut a, 1, TOKEN, T0);
        chat(&mut a, 1, "Alice", "hi", None, T0 + 1);
        let players = a.export_players(T0 + 2);
        let chats = a.export_chats(T0 + 2);
        assert_eq!(verify(&players), IntegrityState::Valid);
        assert_eq!(verify(&chats), IntegrityState::Valid);

        let (mut b, _, _) = orchestrator(|_| {});
        assert_eq!(b.import_players(&players, "players export").unwrap(), 1);
        assert_eq!(b.import_chats(&chats, "chat export").unwrap(), 1);
        assert_eq!(b.query_code(TOKEN_CODE).chats.len(), 1);

        let mut forged = players.clone();
        let digest = forged.envelope.integrity_sha256.clone().unwrap();
        let first = if digest.starts_with('0') { "1" } else { "0" };
        forged.envelope.integrity_sha256 = Some(format!("{first}{}", &digest[1..]));
        let before = b.registry().snapshot();
        assert!(b.import_players(&forged, "forged").is_err());
        assert_eq!(b.registry().snapshot(), before);
    }

    #[test]
    fn merge_surface() {
        let (mut o, _, _) = orchestrator(|_| {});
        connect(&mut o);
        observe(&mut o, 1, "One|k2k", T0);
        observe(&mut o, 2, "Two|k2k", T0 + 5);
        assert_eq!(o.query_code("k2k").players.len(), 2);
        assert_eq!(o.merge_all(), 1);
        assert_eq!(o.merge_all(), 0);
        let survivors = o.query_code("k2k").players;
        assert_eq!(survivors.len(), 1);
        assert_eq!(survivors[0].pid, "pid:2@play.example.net:6567");
        assert!(o.bind("pid:2@play.example.net:6567", "zz9"));
        assert_eq!(o.players_page(0, 10).len(), 1);
    }

    #[test]
    fn geo_lookup_without_resolver_fails() {
        let (mut o, _, _) = orchestrator(|_| {});
        assert_eq!(o.lookup_geo("10.0.0.1"), GeoLookup::Failed);
        assert_eq!(o.lookup_geo("not an address"), GeoLookup::Failed);
    }

    #[test]
    fn failed_save_is_retried() {
        let (mut o, storage, _) = orchestrator(|s| s.record_chat = true);
        connect(&mut o);
        trace(&mut o, 1, TOKEN, T0 + 1);
        chat(&mut o, 1, "Alice", "hello", None, T0 + 2);

        storage.files().fail_writes = true;
        assert!(o.save(false, T0 + 3).is_err());
        assert!(o.has_pending_writes());
        assert!(storage.files().players.is_none());
        assert!(storage.files().shards.is_empty());

        storage.files().fail_writes = false;
        o.save(false, T0 + 4).unwrap();
        assert!(!o.has_pending_writes());
        assert!(storage.files().players.is_some());
        assert_eq!(storage.files().shards.len(), 1);
    }

    #[test]
    fn huge_cooldowns_do_not_overflow() {
        let (mut o, _, requester) = orchestrator(|s| {
            s.operator_is_admin = true;
            s.extended_identity_cooldown = Duration::MAX;
            s.extended_identity_pending_window = Duration::MAX;
            s.stale_cooldown_after = Duration::MAX;
        });
        connect(&mut o);
        observe(&mut o, 1, "Bob", T0);
        observe(&mut o, 1, "Bob", T0 + 60_000);
        o.tick(T0 + 120_000);
        assert_eq!(requester.requested(), vec![1]);
    }
}
