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

//! The long-running mode: host events arrive as JSON lines, the orchestrator ticks in between.

use crate::events::HostEvent;
use crate::orchestrator::Orchestrator;
use spdb_common::now_millis;
use spdb_db::DbError;
use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

pub enum HostInput {
    Line(String),
    /// The host closed its end.
    Closed,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub events: usize,
    pub rejected_lines: usize,
}

/// Read lines from `reader` on a dedicated thread and forward them.
pub fn spawn_line_reader<R: BufRead + Send + 'static>(
    reader: R,
    send: flume::Sender<HostInput>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("spdb-host-reader".to_string())
        .spawn(move || {
            for line in reader.lines() {
                match line {
                    Ok(line) => {
                        if send.send(HostInput::Line(line)).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "Host input failed");
                        break;
                    }
                }
            }
            let _ = send.send(HostInput::Closed);
        })
}

/// Feed events to `orchestrator` until the input closes or `kill_switch` is set, ticking at least
/// every `tick_every`. Everything pending is flushed before returning.
pub fn run_event_loop(
    orchestrator: &mut Orchestrator,
    inputs: &flume::Receiver<HostInput>,
    kill_switch: &AtomicBool,
    tick_every: Duration,
) -> Result<RunSummary, DbError> {
    let mut summary = RunSummary::default();

    loop {
        if kill_switch.load(Ordering::Relaxed) {
            info!("Shutdown requested");
            break;
        }
        match inputs.recv_timeout(tick_every) {
            Ok(HostInput::Line(line)) => {
                let line = line.trim();
                if !line.is_empty() {
                    match serde_json::from_str::<HostEvent>(line) {
                        Ok(event) => {
                            summary.events += 1;
                            if orchestrator.handle(event, now_millis()) {
                                debug!("Automatic extended identity answer absorbed");
                            }
                        }
                        Err(e) => {
                            summary.rejected_lines += 1;
                            warn!(error = %e, line, "Ignoring malformed host event");
                        }
                    }
                }
            }
            Ok(HostInput::Closed) | Err(flume::RecvTimeoutError::Disconnected) => {
                info!("Host input closed");
                break;
            }
            Err(flume::RecvTimeoutError::Timeout) => {}
        }
        orchestrator.tick(now_millis());
    }

    orchestrator.save(false, now_millis())?;
    info!(
        events = summary.events,
        rejected = summary.rejected_lines,
        "Event loop finished"
    );
    Ok(summary)
}
