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

//! On-disk file shapes and JSON helpers.

use crate::error::DbError;
use crate::integrity::{Canonical, CanonicalWriter, IntegrityEnvelope};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use spdb_common::{ChatEntry, Millis, PlayerRecord};
use std::collections::BTreeMap;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// `players.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayersFile {
    #[serde(default)]
    pub schema: u32,
    #[serde(default)]
    pub players: BTreeMap<String, PlayerRecord>,
    #[serde(flatten)]
    pub envelope: IntegrityEnvelope,
}

/// `chats/chats_<YYYYMMDD>.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatShardFile {
    #[serde(default)]
    pub schema: u32,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub entries: Vec<ChatEntry>,
    #[serde(flatten)]
    pub envelope: IntegrityEnvelope,
}

/// `chats/chat_index.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatIndexFile {
    #[serde(default)]
    pub schema: u32,
    #[serde(default)]
    pub uid_dates: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub total_entries: u64,
    #[serde(default)]
    pub updated_at: Millis,
    #[serde(flatten)]
    pub envelope: IntegrityEnvelope,
}

/// Export/import format for chat history, and the shape of the legacy single-file store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatExportFile {
    #[serde(default)]
    pub schema: u32,
    #[serde(default)]
    pub entries: Vec<ChatEntry>,
    #[serde(flatten)]
    pub envelope: IntegrityEnvelope,
}

macro_rules! envelope_accessors {
    () => {
        fn schema(&self) -> u32 {
            self.schema
        }
        fn set_schema(&mut self, schema: u32) {
            self.schema = schema;
        }
        fn envelope(&self) -> &IntegrityEnvelope {
            &self.envelope
        }
        fn envelope_mut(&mut self) -> &mut IntegrityEnvelope {
            &mut self.envelope
        }
    };
}

fn write_entries(w: &mut CanonicalWriter, entries: &[ChatEntry]) {
    let mut sorted: Vec<&ChatEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.canonical_cmp(b));
    w.count(sorted.len());
    for e in sorted {
        w.text(&e.uid);
        w.text(&e.sender_name);
        w.text(&e.message);
        w.text(&e.server);
        w.number(e.time);
    }
}

impl Canonical for PlayersFile {
    const FORMAT_TAG: &'static str = "SPDB-PLAYERS-V1";
    envelope_accessors!();

    fn write_body(&self, w: &mut CanonicalWriter) {
        w.count(self.players.len());
        for (key, rec) in &self.players {
            w.text(key);
            w.text(&rec.pid);
            w.token(rec.uid.as_deref());
            w.number(rec.first_seen);
            w.number(rec.last_seen);
            w.sorted_seq(&rec.names);
            w.sorted_seq(&rec.ips);
            w.sorted_seq(&rec.servers);
        }
    }
}

impl Canonical for ChatShardFile {
    const FORMAT_TAG: &'static str = "SPDB-CHAT-DAY-V1";
    envelope_accessors!();

    fn write_body(&self, w: &mut CanonicalWriter) {
        w.text(&self.date);
        write_entries(w, &self.entries);
    }
}

impl Canonical for ChatIndexFile {
    const FORMAT_TAG: &'static str = "SPDB-CHAT-INDEX-V1";
    envelope_accessors!();

    fn write_body(&self, w: &mut CanonicalWriter) {
        w.number(i64::try_from(self.total_entries).unwrap_or(i64::MAX));
        w.number(self.updated_at);
        w.count(self.uid_dates.len());
        for (uid, dates) in &self.uid_dates {
            w.text(uid);
            w.sorted_seq(dates);
        }
    }
}

impl Canonical for ChatExportFile {
    const FORMAT_TAG: &'static str = "SPDB-CHAT-EXPORT-V1";
    envelope_accessors!();

    fn write_body(&self, w: &mut CanonicalWriter) {
        write_entries(w, &self.entries);
    }
}

/// Read and parse a JSON file. `Ok(None)` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, DbError> {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(DbError::io(path, e)),
    };
    serde_json::from_reader(BufReader::new(file))
        .map(Some)
        .map_err(|e| DbError::json(path, e))
}

/// Write `value` as pretty JSON, via a temporary file in the same directory renamed into place so
/// a crash never leaves a half-written file behind.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), DbError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(|e| DbError::io(&dir, e))?;

    let tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| DbError::io(&dir, e))?;
    {
        let mut writer = BufWriter::new(tmp.as_file());
        serde_json::to_writer_pretty(&mut writer, value).map_err(|e| DbError::json(path, e))?;
        writer.flush().map_err(|e| DbError::io(path, e))?;
    }
    tmp.as_file()
        .sync_all()
        .map_err(|e| DbError::io(path, e))?;
    tmp.persist(path).map_err(|e| DbError::io(path, e.error))?;
    Ok(())
}

/// `chats_20250102.json` -> `chats_20250102.rejected-1735800000000.json`
pub fn rejected_name(path: &Path, now: Millis) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{stem}.rejected-{now}.json"))
}

/// Move a file that failed verification out of the way. Returns the new path.
pub fn quarantine(path: &Path, now: Millis) -> Result<PathBuf, DbError> {
    let target = rejected_name(path, now);
    std::fs::rename(path, &target).map_err(|e| DbError::io(path, e))?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::{IntegrityState, sign, verify};
    use pretty_assertions::assert_eq;

    fn entry(uid: &str, time: Millis, message: &str) -> ChatEntry {
        ChatEntry {
            uid: uid.into(),
            sender_name: "S".into(),
            message: message.into(),
            server: "srv".into(),
            time,
        }
    }

    #[test]
    fn players_file_json_layout() {
        let mut file = PlayersFile::default();
        file.players
            .insert("tok".into(), PlayerRecord::new("tok", 5));
        sign(&mut file, 9);
        let json = serde_json::to_value(&file).unwrap();
        assert_eq!(json["schema"], 3);
        assert_eq!(json["players"]["tok"]["firstSeen"], 5);
        assert_eq!(json["integrityAlgo"], "sha256-v1");
        assert_eq!(json["integrityTime"], 9);
        assert!(json["integritySha256"].as_str().unwrap().len() == 64);

        let back: PlayersFile = serde_json::from_value(json).unwrap();
        assert_eq!(back, file);
        assert_eq!(verify(&back), IntegrityState::Valid);
    }

    #[test]
    fn legacy_file_without_envelope_is_missing() {
        let file: ChatExportFile = serde_json::from_str(
            r#"{"schema":2,"entries":[{"uid":"abc","senderName":"A","message":"hi","server":"s","time":1}]}"#,
        )
        .unwrap();
        assert_eq!(verify(&file), IntegrityState::Missing);
    }

    #[test]
    fn shard_digest_ignores_entry_order() {
        let mut file = ChatShardFile {
            date: "20250101".into(),
            entries: vec![entry("abc", 2, "b"), entry("abc", 1, "a")],
            ..Default::default()
        };
        sign(&mut file, 1);
        file.entries.reverse();
        assert_eq!(verify(&file), IntegrityState::Valid);
        file.date = "20250102".into();
        assert_eq!(verify(&file), IntegrityState::Mismatch);
    }

    #[test]
    fn index_counter_is_signed() {
        let mut file = ChatIndexFile::default();
        file.uid_dates
            .insert("abc".into(), vec!["20250101".into()]);
        file.total_entries = 1;
        sign(&mut file, 1);
        file.total_entries = 2;
        assert_eq!(verify(&file), IntegrityState::Mismatch);
    }

    #[test]
    fn atomic_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("x.json");
        assert!(read_json::<ChatExportFile>(&path).unwrap().is_none());

        let file = ChatExportFile {
            entries: vec![entry("abc", 1, "hi")],
            ..Default::default()
        };
        write_json_atomic(&path, &file).unwrap();
        let back: ChatExportFile = read_json(&path).unwrap().unwrap();
        assert_eq!(back, file);
    }

    #[test]
    fn quarantine_renames_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chats_20250101.json");
        std::fs::write(&path, "{}").unwrap();
        let moved = quarantine(&path, 42).unwrap();
        assert_eq!(
            moved.file_name().unwrap().to_str().unwrap(),
            "chats_20250101.rejected-42.json"
        );
        assert!(!path.exists());
        assert!(moved.exists());
    }

    #[test]
    fn malformed_json_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("players.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = read_json::<PlayersFile>(&path).unwrap_err();
        assert!(matches!(err, DbError::Json { .. }));
        assert!(err.is_untrusted_content());
    }
}
