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

//! Persistent player registry and chat ledger.
//!
//! Both stores persist whole JSON files that carry a tamper-evident integrity envelope. Files that
//! fail verification are never loaded and never overwritten: they are moved aside under a
//! `.rejected-<millis>.json` name and reported.

pub use chat::{ChatLedger, IntegrityReport, date_key, is_valid_date_key, retention_cutoff};
pub use config::{DEFAULT_MAX_CACHED_SHARDS, DatabaseConfig};
pub use error::{DbError, IntegrityViolation};
pub use files::{ChatExportFile, ChatIndexFile, ChatShardFile, PlayersFile};
pub use integrity::{ALGORITHM_ID, CURRENT_SCHEMA, IntegrityEnvelope, IntegrityState, sign, verify};
pub use players::{PlayerRegistry, PlayersLoad, open_registry};

mod chat;
mod config;
mod error;
pub mod files;
pub mod integrity;
mod players;
pub mod storage;
