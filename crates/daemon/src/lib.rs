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
//! The long-running player and chat ledger service, plus the operator surface over it.

pub mod config;
pub mod events;
pub mod geo;
pub mod host;
pub mod orchestrator;
pub mod requester;

pub use config::{DEFAULT_GEO_ENDPOINT, DaemonConfig, OrchestratorSettings};
pub use events::{HostEvent, HostRequest};
pub use geo::{GeoCache, GeoError, GeoLookup, GeoResolver, HttpGeoResolver};
pub use host::{HostInput, RunSummary, run_event_loop, spawn_line_reader};
pub use orchestrator::{
    CodeQuery, IntegrityStatus, OFFLINE_SERVER, Orchestrator, RebindOutcome, choose_primary_pid,
};
pub use requester::{IdentityRequester, JsonLinesRequester, NoOpRequester, RecordingRequester};
