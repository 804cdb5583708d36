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

use clap::builder::ValueHint;
use clap_derive::{Parser, Subcommand};
use eyre::eyre;
use figment::Figment;
use figment::providers::{Format as ProviderFormat, Serialized, Yaml};
use spdb_daemon::{DaemonConfig, OrchestratorSettings};
use spdb_db::DatabaseConfig;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "spdb-daemon", version, about = "Player and chat ledger for a game-server client")]
pub struct Args {
    #[arg(
        value_name = "data-dir",
        help = "Directory to store players.json and the chats/ shards under. \
                Defaults to the XDG data directory.",
        value_hint = ValueHint::DirPath
    )]
    pub data_dir: Option<PathBuf>,

    #[arg(
        long,
        value_name = "config",
        help = "Path to configuration (YAML) file to use, if any. If not specified, defaults are used.\
                Configuration file values can be overridden by command line arguments.",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub db_args: DatabaseArgs,

    #[command(flatten)]
    pub orchestrator_args: OrchestratorArgs,

    #[arg(long, help = "Enable debug logging", default_value = "false")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Consume host events as JSON lines on stdin until it closes or a signal arrives.
    Run {
        #[arg(long, default_value = "250", help = "Milliseconds between ticks while idle")]
        tick_millis: u64,
    },
    /// Everything recorded under a stable code: player records plus chat history.
    QueryCode { uid: String },
    /// Records that have used the address.
    QueryAddress { ip: String },
    /// Records whose last name or history contains the text.
    QueryName {
        text: String,
        #[arg(short, long)]
        ignore_case: bool,
    },
    /// Newest chat entries first.
    QueryRecent {
        #[arg(long, default_value = "0")]
        offset: usize,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// A page of player records, most recently seen first.
    Players {
        #[arg(long, default_value = "0")]
        offset: usize,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Addresses shared by at least this many distinct accounts.
    SameAddress {
        #[arg(long, default_value = "2")]
        min_accounts: usize,
    },
    /// Fold every record carrying the code into one.
    MergeCode { uid: String },
    /// Fold records sharing a code, for every code.
    MergeAll,
    /// Attach a stable code to a session identity.
    Bind { pid: String, uid: String },
    /// Derive codes for records that lack one.
    FillCodes,
    /// Move records and chat history from one code to another.
    Rebind { from: String, to: String },
    /// Merge a signed players export into the registry.
    ImportPlayers { file: PathBuf },
    /// Write a signed snapshot of the registry.
    ExportPlayers { file: PathBuf },
    /// Merge a signed chat export into the ledger.
    ImportChats { file: PathBuf },
    /// Write a signed snapshot of every chat entry.
    ExportChats { file: PathBuf },
    /// Report the integrity state of every store; exits non-zero if anything is wrong.
    Verify,
    /// Show what the chat line parser recovers from a raw line.
    ParseChatLine {
        raw: String,
        #[arg(long, default_value = "")]
        name: String,
    },
    /// Resolve an address to a location description.
    LookupGeo { ip: String },
}

impl Command {
    /// Commands that leave both stores untouched.
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            Command::QueryCode { .. }
                | Command::QueryAddress { .. }
                | Command::QueryName { .. }
                | Command::QueryRecent { .. }
                | Command::Players { .. }
                | Command::SameAddress { .. }
                | Command::ExportPlayers { .. }
                | Command::ExportChats { .. }
                | Command::Verify
                | Command::ParseChatLine { .. }
                | Command::LookupGeo { .. }
        )
    }
}

#[derive(Parser, Debug)]
pub struct DatabaseArgs {
    #[arg(
        long,
        value_name = "max-cached-shards",
        help = "Number of day shards to keep in memory"
    )]
    pub max_cached_shards: Option<usize>,

    #[arg(
        long,
        value_name = "retention-days",
        help = "Drop chat shards older than this many days"
    )]
    pub retention_days: Option<u32>,
}

impl DatabaseArgs {
    pub(crate) fn merge_config(&self, db_config: &mut DatabaseConfig) -> Result<(), eyre::Report> {
        if let Some(max) = self.max_cached_shards {
            if max == 0 {
                return Err(eyre!("--max-cached-shards must be at least 1"));
            }
            db_config.max_cached_shards = max;
        }
        if let Some(days) = self.retention_days {
            db_config.retention_days = Some(days);
        }
        Ok(())
    }
}

#[derive(Parser, Debug)]
pub struct OrchestratorArgs {
    #[arg(long, value_name = "collect-players", help = "Record players as they are observed")]
    pub collect_players: Option<bool>,

    #[arg(long, value_name = "record-chat", help = "Append chat messages to the ledger")]
    pub record_chat: Option<bool>,

    #[arg(
        long,
        value_name = "auto-extended-identity",
        help = "Request extended identity evidence automatically (admin only)"
    )]
    pub auto_extended_identity: Option<bool>,

    #[arg(long, value_name = "admin", help = "Whether the operator has admin rights on the server")]
    pub admin: Option<bool>,

    #[arg(
        long,
        value_name = "save-interval-seconds",
        help = "Interval in seconds between background saves"
    )]
    pub save_interval_seconds: Option<u16>,

    #[arg(long, value_name = "geo", help = "Resolve addresses to locations")]
    pub geo: Option<bool>,

    #[arg(long, value_name = "geo-endpoint", help = "Lookup URL; the address is appended")]
    pub geo_endpoint: Option<String>,
}

impl OrchestratorArgs {
    pub(crate) fn merge_config(
        &self,
        settings: &mut OrchestratorSettings,
    ) -> Result<(), eyre::Report> {
        if let Some(v) = self.collect_players {
            settings.collect_players = v;
        }
        if let Some(v) = self.record_chat {
            settings.record_chat = v;
        }
        if let Some(v) = self.auto_extended_identity {
            settings.auto_extended_identity = v;
        }
        if let Some(v) = self.admin {
            settings.operator_is_admin = v;
        }
        if let Some(secs) = self.save_interval_seconds {
            settings.save_interval = Duration::from_secs(u64::from(secs));
        }
        if let Some(v) = self.geo {
            settings.geo_enabled = v;
        }
        if let Some(endpoint) = self.geo_endpoint.as_ref() {
            settings.geo_endpoint = endpoint.clone();
        }
        Ok(())
    }
}

impl Args {
    fn merge_config(&self, mut config: DaemonConfig) -> Result<DaemonConfig, eyre::Report> {
        self.db_args.merge_config(&mut config.database)?;
        self.orchestrator_args
            .merge_config(&mut config.orchestrator)?;
        Ok(config)
    }

    /// Load the configuration file if we have it, and then we'll merge the arguments into it.
    pub fn load_config(&self) -> Result<DaemonConfig, eyre::Report> {
        // Figment's own merge can't see through clap's flattened option groups, so the arguments
        // are applied by hand afterwards.
        let config = match self.config_file.clone() {
            Some(config_path) => Figment::new()
                .merge(Serialized::defaults(DaemonConfig::default()))
                .merge(Yaml::file(config_path.clone()))
                .extract::<DaemonConfig>()
                .map_err(|e| {
                    eyre!(
                        "Failed to parse configuration from {:?}: {}",
                        config_path,
                        e
                    )
                })?,
            None => DaemonConfig::default(),
        };
        self.merge_config(config)
    }

    pub(crate) fn resolved_data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(spdb_common::util::data_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn arguments_override_defaults() {
        let args = Args::try_parse_from([
            "spdb-daemon",
            "/tmp/spdb",
            "--record-chat",
            "true",
            "--retention-days",
            "30",
            "--save-interval-seconds",
            "10",
            "query-code",
            "3TE",
        ])
        .unwrap();
        let config = args.load_config().unwrap();
        assert!(config.orchestrator.record_chat);
        assert_eq!(config.database.retention_days, Some(30));
        assert_eq!(config.orchestrator.save_interval, Duration::from_secs(10));
        assert_eq!(
            args.command,
            Command::QueryCode {
                uid: "3TE".to_string()
            }
        );
        assert_eq!(args.resolved_data_dir(), PathBuf::from("/tmp/spdb"));
    }

    #[test]
    fn config_file_values_are_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.yaml");
        std::fs::write(
            &path,
            "database:\n  max_cached_shards: 3\norchestrator:\n  operator_is_admin: true\n",
        )
        .unwrap();
        let args = Args::try_parse_from([
            "spdb-daemon",
            "--config-file",
            path.to_str().unwrap(),
            "verify",
        ])
        .unwrap();
        let config = args.load_config().unwrap();
        assert_eq!(config.database.max_cached_shards, 3);
        assert!(config.orchestrator.operator_is_admin);
        assert!(config.orchestrator.collect_players);
    }

    #[test]
    fn zero_cache_size_is_rejected() {
        let args =
            Args::try_parse_from(["spdb-daemon", "--max-cached-shards", "0", "verify"]).unwrap();
        assert!(args.load_config().is_err());
    }
}
