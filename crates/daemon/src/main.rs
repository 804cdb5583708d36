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


use crate::args::{Args, Command};
use ::tracing::{error, info, warn};
use clap::Parser;
use eyre::{Report, bail, eyre};
use fs2::FileExt;
use serde::Serialize;
use spdb_common::chat_line::parse_raw_chat_line;
use spdb_common::{now_millis, tracing};
use spdb_daemon::{
    DaemonConfig, GeoCache, GeoResolver, HostInput, HttpGeoResolver, IdentityRequester,
    JsonLinesRequester, NoOpRequester, Orchestrator, run_event_loop, spawn_line_reader,
};
use spdb_db::files::{read_json, write_json_atomic};
use spdb_db::{ChatExportFile, PlayersFile};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

mod args;

/// Acquire an exclusive lock on the data directory so only one daemon (or operator command) touches
/// the stores at a time. The lock is released when the returned file is dropped.
fn acquire_data_directory_lock(data_dir: &PathBuf) -> Result<File, Report> {
    std::fs::create_dir_all(data_dir)?;

    let lock_file_path = data_dir.join(".spdb-daemon.lock");

    let lock_file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&lock_file_path)?;

    match lock_file.try_lock_exclusive() {
        Ok(()) => {
            info!("Acquired exclusive lock on data directory: {:?}", data_dir);
            Ok(lock_file)
        }
        Err(e) => {
            error!(
                "Failed to acquire lock on data directory {:?}. Another spdb-daemon instance may already be running in this directory.",
                data_dir
            );
            bail!("Directory lock acquisition failed: {}", e);
        }
    }
}

fn geo_cache(config: &DaemonConfig) -> GeoCache {
    let settings = &config.orchestrator;
    if !settings.geo_enabled {
        return GeoCache::disabled();
    }
    match HttpGeoResolver::new(&settings.geo_endpoint, settings.geo_timeout) {
        Ok(resolver) => GeoCache::new(Some(Arc::new(resolver) as Arc<dyn GeoResolver>)),
        Err(e) => {
            warn!(error = %e, "Geolocation unavailable");
            GeoCache::disabled()
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Report> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out)?;
    Ok(())
}

fn read_required<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, Report> {
    read_json(path)?.ok_or_else(|| eyre!("{} does not exist", path.display()))
}

fn run_daemon(
    data_dir: &Path,
    config: &DaemonConfig,
    tick_every: Duration,
) -> Result<(), Report> {
    let requester: Box<dyn IdentityRequester> =
        Box::new(JsonLinesRequester::new(std::io::stdout()));
    let mut orchestrator =
        Orchestrator::open_dir(data_dir, config, requester, geo_cache(config), now_millis())?;

    let kill_switch = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGTERM, kill_switch.clone())?;
    signal_hook::flag::register(signal_hook::consts::SIGINT, kill_switch.clone())?;

    let (send, recv) = flume::unbounded::<HostInput>();
    // Blocked in a read on stdin until the host closes it; not joined.
    let _reader = spawn_line_reader(BufReader::new(std::io::stdin()), send)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        "spdb-daemon started"
    );
    let summary = run_event_loop(&mut orchestrator, &recv, &kill_switch, tick_every)?;
    info!(events = summary.events, "spdb-daemon stopped");
    Ok(())
}

/// Returns the process exit code.
fn run_command(
    command: &Command,
    data_dir: &Path,
    config: &DaemonConfig,
) -> Result<i32, Report> {
    let now = now_millis();
    let mut orchestrator = Orchestrator::open_dir(
        data_dir,
        config,
        Box::new(NoOpRequester),
        geo_cache(config),
        now,
    )?;

    let mut exit_code = 0;
    match command {
        Command::Run { .. } | Command::ParseChatLine { .. } => {
            bail!("not an operator command")
        }
        Command::QueryCode { uid } => print_json(&orchestrator.query_code(uid))?,
        Command::QueryAddress { ip } => print_json(&orchestrator.query_address(ip))?,
        Command::QueryName { text, ignore_case } => {
            print_json(&orchestrator.query_name(text, *ignore_case))?
        }
        Command::QueryRecent { offset, limit } => {
            print_json(&orchestrator.query_recent(*offset, *limit))?
        }
        Command::Players { offset, limit } => {
            print_json(&orchestrator.players_page(*offset, *limit))?
        }
        Command::SameAddress { min_accounts } => {
            print_json(&orchestrator.same_address_groups(*min_accounts))?
        }
        Command::MergeCode { uid } => print_json(&orchestrator.merge_by_code(uid))?,
        Command::MergeAll => print_json(&orchestrator.merge_all())?,
        Command::Bind { pid, uid } => print_json(&orchestrator.bind(pid, uid))?,
        Command::FillCodes => print_json(&orchestrator.fill_missing_codes())?,
        Command::Rebind { from, to } => print_json(&orchestrator.rebind(from, to))?,
        Command::ImportPlayers { file } => {
            let incoming: PlayersFile = read_required(file)?;
            let subject = file.display().to_string();
            print_json(&orchestrator.import_players(&incoming, &subject)?)?
        }
        Command::ExportPlayers { file } => {
            let snapshot = orchestrator.export_players(now);
            write_json_atomic(file, &snapshot)?;
            print_json(&snapshot.players.len())?
        }
        Command::ImportChats { file } => {
            let incoming: ChatExportFile = read_required(file)?;
            let subject = file.display().to_string();
            print_json(&orchestrator.import_chats(&incoming, &subject)?)?
        }
        Command::ExportChats { file } => {
            let snapshot = orchestrator.export_chats(now);
            write_json_atomic(file, &snapshot)?;
            print_json(&snapshot.entries.len())?
        }
        Command::Verify => {
            let status = orchestrator.integrity_status();
            print_json(&status)?;
            if status.has_issues() {
                exit_code = 2;
            }
        }
        Command::LookupGeo { ip } => {
            let timeout = orchestrator.settings().geo_timeout;
            print_json(&orchestrator.geo_mut().lookup_blocking(ip, timeout))?
        }
    }

    if !command.is_read_only() {
        orchestrator.save(true, now_millis())?;
    }
    Ok(exit_code)
}

fn main() -> Result<(), Report> {
    color_eyre::install()?;

    let args = Args::parse();

    tracing::init_tracing(args.debug).map_err(|e| eyre!("Unable to configure logging: {}", e))?;

    // Pure parsing needs neither the stores nor the lock.
    if let Command::ParseChatLine { raw, name } = &args.command {
        return print_json(&parse_raw_chat_line(raw, name));
    }

    let config = args.load_config()?;
    let data_dir = args.resolved_data_dir();
    let _lock = acquire_data_directory_lock(&data_dir)?;

    match &args.command {
        Command::Run { tick_millis } => {
            run_daemon(&data_dir, &config, Duration::from_millis(*tick_millis))
        }
        command => {
            let exit_code = run_command(command, &data_dir, &config)?;
            if exit_code != 0 {
                std::process::exit(exit_code);
            }
            Ok(())
        }
    }
}
