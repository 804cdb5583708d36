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

//! Write both stores to a real data directory, reopen them, and check that what comes back is
//! what went in. Then corrupt files on disk and check they are refused and moved aside.

#[cfg(test)]
mod tests {
    use spdb_db::storage::FsStorage;
    use spdb_db::{ChatLedger, DatabaseConfig, IntegrityState, PlayerRegistry, open_registry};
    use std::path::Path;

    /// 2025-01-01T00:00:00Z
    const JAN1: i64 = 1_735_689_600_000;
    const DAY: i64 = 86_400_000;

    fn storage(dir: &Path) -> FsStorage {
        FsStorage::new(dir, &DatabaseConfig::default())
    }

    fn rejected_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|d| d.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains(".rejected-"))
            .collect();
        names.sort();
        names
    }

    fn edit_json(path: &Path, f: impl FnOnce(&mut serde_json::Value)) {
        let mut value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        f(&mut value);
        std::fs::write(path, serde_json::to_string_pretty(&value).unwrap()).unwrap();
    }

    fn populated_registry() -> PlayerRegistry {
        let mut reg = PlayerRegistry::new();
        reg.touch("QUJDREVGR0g=", Some("3TE"), Some("Alice"), Some("pvp"), JAN1);
        reg.add_ip("QUJDREVGR0g=", "10.0.0.1");
        reg.touch("p2", None, Some("[blue]Bob"), Some("survival"), JAN1 + 5);
        reg
    }

    #[test]
    fn players_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = storage(dir.path());

        let mut loaded = open_registry(&mut fs, JAN1).unwrap();
        assert!(loaded.registry.is_empty());
        assert_eq!(loaded.state, IntegrityState::Missing);

        loaded.registry = populated_registry();
        assert!(loaded.registry.save(&mut fs, JAN1 + 10).unwrap());
        assert!(!loaded.registry.save(&mut fs, JAN1 + 11).unwrap());

        let raw = std::fs::read_to_string(fs.players_path()).unwrap();
        assert!(raw.contains("\"integritySha256\""));

        let reopened = open_registry(&mut fs, JAN1 + 20).unwrap();
        assert_eq!(reopened.state, IntegrityState::Valid);
        assert!(reopened.issues.is_empty());
        assert_eq!(reopened.registry.snapshot().players, populated_registry().snapshot().players);
        assert_eq!(reopened.registry.find_by_address("10.0.0.1").len(), 1);
    }

    #[test]
    fn tampered_players_file_is_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = storage(dir.path());
        let mut reg = populated_registry();
        reg.save(&mut fs, JAN1).unwrap();

        edit_json(fs.players_path(), |v| {
            v["players"]["p2"]["names"] = serde_json::json!(["Mallory"]);
        });

        let loaded = open_registry(&mut fs, JAN1 + 1).unwrap();
        assert_eq!(loaded.state, IntegrityState::Mismatch);
        assert!(loaded.registry.is_empty());
        assert!(!fs.players_path().exists());
        assert_eq!(
            rejected_files(dir.path()),
            vec![format!("players.rejected-{}.json", JAN1 + 1)]
        );
    }

    #[test]
    fn unparseable_players_file_is_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let mut fs = storage(dir.path());
        std::fs::write(fs.players_path(), "{ not json").unwrap();

        let loaded = open_registry(&mut fs, JAN1).unwrap();
        assert!(loaded.registry.is_empty());
        assert_eq!(loaded.issues.len(), 1);
        assert_eq!(rejected_files(dir.path()).len(), 1);
    }

    #[test]
    fn chat_shards_and_index_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut ledger = ChatLedger::open(Box::new(storage(dir.path())), 2, JAN1).unwrap();
            assert!(ledger.add("3TE", "Alice", "hello", "pvp", JAN1 + 1));
            assert!(ledger.add("3TE", "Alice", "again", "pvp", JAN1 + DAY));
            assert!(ledger.add("30J", "Bob", "hi", "pvp", JAN1 + 2 * DAY));
            assert_eq!(ledger.flush(JAN1 + 3 * DAY).unwrap(), 3);
        }

        let chats = dir.path().join("chats");
        for date in ["20250101", "20250102", "20250103"] {
            assert!(chats.join(format!("chats_{date}.json")).exists());
        }
        assert!(chats.join("chat_index.json").exists());

        let mut ledger = ChatLedger::open(Box::new(storage(dir.path())), 2, JAN1).unwrap();
        let report = ledger.integrity_report().clone();
        assert_eq!(report.shards_valid, 3);
        assert_eq!(report.index_state, IntegrityState::Valid);
        assert_eq!(ledger.total_entries(), 3);

        let mine: Vec<String> = ledger.find_by_code("3TE").into_iter().map(|e| e.message).collect();
        assert_eq!(mine, vec!["again", "hello"]);
        let recent: Vec<String> = ledger.find_recent(0, 2).into_iter().map(|e| e.message).collect();
        assert_eq!(recent, vec!["hi", "again"]);
    }

    #[test]
    fn tampered_chat_shard_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut ledger = ChatLedger::open(Box::new(storage(dir.path())), 8, JAN1).unwrap();
            ledger.add("3TE", "Alice", "hello", "pvp", JAN1 + 1);
            ledger.add("3TE", "Alice", "next day", "pvp", JAN1 + DAY);
            ledger.flush(JAN1 + 2 * DAY).unwrap();
        }
        let chats = dir.path().join("chats");
        edit_json(&chats.join("chats_20250101.json"), |v| {
            v["entries"][0]["message"] = serde_json::json!("forged");
        });
        std::fs::write(chats.join("chats_20250102.json"), "][").unwrap();

        let mut ledger = ChatLedger::open(Box::new(storage(dir.path())), 8, JAN1 + 3 * DAY).unwrap();
        let report = ledger.integrity_report().clone();
        assert_eq!(report.shards_checked, 2);
        assert_eq!(report.shards_mismatch, 2);
        assert_eq!(report.issues.len(), 2);
        assert_eq!(ledger.total_entries(), 0);
        assert!(ledger.find_by_code("3TE").is_empty());
        assert_eq!(rejected_files(&chats).len(), 2);

        // The rebuilt index no longer mentions the refused days.
        ledger.flush(JAN1 + 3 * DAY).unwrap();
        let index: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(chats.join("chat_index.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(index["totalEntries"], 0);
    }

    #[test]
    fn legacy_chat_store_is_migrated_and_archived() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("chats.json"),
            r#"{"schema":1,"entries":[
                {"uid":"3TE","senderName":"Alice","message":"old one","server":"pvp","timestamp":1735689600001},
                {"uid":"3TE","senderName":"Alice","message":"old one","server":"pvp","timestamp":1735689600001},
                {"uid":"30J","senderName":"Bob","message":"old two","server":"pvp","timestamp":1735776000000}
            ]}"#,
        )
        .unwrap();

        let mut ledger = ChatLedger::open(Box::new(storage(dir.path())), 8, JAN1).unwrap();
        assert_eq!(ledger.migrate_legacy(JAN1 + 2 * DAY).unwrap(), 2);
        assert!(!dir.path().join("chats.json").exists());
        assert!(dir.path().join("chats_legacy_migrated.json").exists());
        assert!(dir.path().join("chats/chats_20250102.json").exists());
        assert_eq!(ledger.migrate_legacy(JAN1 + 2 * DAY).unwrap(), 0);

        let reopened = ChatLedger::open(Box::new(storage(dir.path())), 8, JAN1).unwrap();
        assert_eq!(reopened.total_entries(), 2);
    }
}
