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

//! What the host sends us, and what we send back. Both directions are one JSON object per line.

use serde::{Deserialize, Serialize};
use spdb_common::Millis;

/// An event delivered by the host. `time` defaults to the moment the event is handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HostEvent {
    /// Joined a server at `address` (`host:port`).
    ServerConnected { address: String },
    /// Left the server; everything pending is flushed.
    Reset,
    PlayerObserved {
        slot: u32,
        name: String,
        #[serde(default)]
        address: Option<String>,
        #[serde(default)]
        time: Option<Millis>,
    },
    ChatMessage {
        slot: u32,
        name: String,
        message: String,
        /// The formatted line as the host displayed it, if available.
        #[serde(default)]
        raw_line: Option<String>,
        #[serde(default)]
        time: Option<Millis>,
    },
    /// Answer to an extended identity request (or one the operator issued by hand).
    ExtendedIdentity {
        slot: u32,
        name: String,
        token: String,
        #[serde(default)]
        names: Vec<String>,
        #[serde(default)]
        ip: Option<String>,
        #[serde(default)]
        ips: Vec<String>,
        #[serde(default)]
        time: Option<Millis>,
    },
}

/// Sent to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum HostRequest {
    ExtendedIdentity { slot: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_host_event_lines() {
        let e: HostEvent =
            serde_json::from_str(r#"{"event":"server_connected","address":"1.2.3.4:6567"}"#)
                .unwrap();
        assert_eq!(
            e,
            HostEvent::ServerConnected {
                address: "1.2.3.4:6567".into()
            }
        );

        let e: HostEvent = serde_json::from_str(
            r#"{"event":"player_observed","slot":7,"name":"[red]Alice","time":100}"#,
        )
        .unwrap();
        assert_eq!(
            e,
            HostEvent::PlayerObserved {
                slot: 7,
                name: "[red]Alice".into(),
                address: None,
                time: Some(100),
            }
        );

        let e: HostEvent = serde_json::from_str(
            r#"{"event":"extended_identity","slot":7,"name":"Alice","token":"QUJDREVGR0g=","ips":["10.0.0.1"]}"#,
        )
        .unwrap();
        let HostEvent::ExtendedIdentity { ips, names, ip, .. } = e else {
            panic!("wrong variant");
        };
        assert_eq!(ips, vec!["10.0.0.1".to_string()]);
        assert!(names.is_empty());
        assert_eq!(ip, None);

        assert!(serde_json::from_str::<HostEvent>(r#"{"event":"bogus"}"#).is_err());
    }

    #[test]
    fn host_request_shape() {
        let json = serde_json::to_string(&HostRequest::ExtendedIdentity { slot: 3 }).unwrap();
        assert_eq!(json, r#"{"request":"extended_identity","slot":3}"#);
    }
}
