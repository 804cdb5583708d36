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

use crate::integrity::IntegrityState;
use std::path::PathBuf;
use thiserror::Error;

/// A persisted file failed verification and must not be applied to live state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{subject} failed integrity verification: {state}")]
pub struct IntegrityViolation {
    /// File name or other human label for what was being verified.
    pub subject: String,
    pub state: IntegrityState,
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed JSON in {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Integrity(#[from] IntegrityViolation),
    #[error("invalid file {path:?}: {reason}")]
    InvalidFile { path: PathBuf, reason: String },
}

impl DbError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }

    /// Content that cannot be trusted, as opposed to content that could not be reached.
    pub fn is_untrusted_content(&self) -> bool {
        matches!(
            self,
            Self::Json { .. } | Self::Integrity(_) | Self::InvalidFile { .. }
        )
    }
}
