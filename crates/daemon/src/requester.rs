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

use crate::events::HostRequest;
use std::io::Write;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Outbound channel for asking the host to fetch extended identity evidence.
pub trait IdentityRequester: Send {
    /// Returns false if the request could not be issued; the caller will try again later.
    fn request_extended_identity(&mut self, slot: u32) -> bool;
}

/// Used when nothing is listening, e.g. one-shot CLI commands.
pub struct NoOpRequester;

impl IdentityRequester for NoOpRequester {
    fn request_extended_identity(&mut self, _slot: u32) -> bool {
        false
    }
}

/// Writes each request as a JSON line.
pub struct JsonLinesRequester<W: Write + Send> {
    out: W,
}

impl<W: Write + Send> JsonLinesRequester<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write + Send> IdentityRequester for JsonLinesRequester<W> {
    fn request_extended_identity(&mut self, slot: u32) -> bool {
        let request = HostRequest::ExtendedIdentity { slot };
        let Ok(line) = serde_json::to_string(&request) else {
            return false;
        };
        match writeln!(self.out, "{line}").and_then(|_| self.out.flush()) {
            Ok(()) => true,
            Err(e) => {
                debug!(slot, error = %e, "Unable to send extended identity request");
                false
            }
        }
    }
}

/// Keeps every requested slot; clones share the record.
#[derive(Clone, Default)]
pub struct RecordingRequester {
    requested: Arc<Mutex<Vec<u32>>>,
}

impl RecordingRequester {
    pub fn requested(&self) -> Vec<u32> {
        self.requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl IdentityRequester for RecordingRequester {
    fn request_extended_identity(&mut self, slot: u32) -> bool {
        self.requested
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(slot);
        true
    }
}
