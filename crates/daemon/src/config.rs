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

use serde::{Deserialize, Serialize};
use spdb_db::DatabaseConfig;
use std::time::Duration;

pub const DEFAULT_GEO_ENDPOINT: &str = "https://ip9.com.cn/get?ip=";

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DaemonConfig {
    pub database: DatabaseConfig,
    pub orchestrator: OrchestratorSettings,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// Record players as they are observed.
    pub collect_players: bool,
    /// Append chat messages to the ledger.
    pub record_chat: bool,
    /// Ask the host for extended identity evidence on every observation (admin only).
    pub auto_extended_identity: bool,
    pub operator_is_admin: bool,

    pub save_interval: Duration,
    pub prune_interval: Duration,
    /// Minimum gap between automatic requests for the same connection slot.
    pub extended_identity_cooldown: Duration,
    /// Evidence arriving within this window of an automatic request counts as automatic.
    pub extended_identity_pending_window: Duration,
    /// Cooldown entries older than this are forgotten.
    pub stale_cooldown_after: Duration,

    pub geo_enabled: bool,
    pub geo_endpoint: String,
    pub geo_timeout: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            collect_players: true,
            record_chat: false,
            auto_extended_identity: true,
            operator_is_admin: false,
            save_interval: Duration::from_secs(5),
            prune_interval: Duration::from_secs(1),
            extended_identity_cooldown: Duration::from_millis(2200),
            extended_identity_pending_window: Duration::from_millis(5000),
            stale_cooldown_after: Duration::from_secs(30),
            geo_enabled: true,
            geo_endpoint: DEFAULT_GEO_ENDPOINT.to_string(),
            geo_timeout: Duration::from_millis(4500),
        }
    }
}

/// Durations are compared against epoch-millisecond clocks throughout.
pub(crate) fn as_millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
