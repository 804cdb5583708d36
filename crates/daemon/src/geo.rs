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

//! Reverse geolocation of addresses.
//!
//! Each lookup runs once, on its own short-lived thread. Results come back over a channel and are
//! only folded into the cache when the owner calls [`GeoCache::drain`], so the cache is never
//! touched from two threads. A failed lookup is remembered as failed and not retried.

use serde::{Deserialize, Serialize};
use spdb_common::Address;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum GeoError {
    #[error("lookup request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("lookup service answered with code {0}")]
    Status(i64),
    #[error("lookup response carried no location")]
    Empty,
    #[error("malformed lookup response: {0}")]
    Payload(#[from] serde_json::Error),
}

pub trait GeoResolver: Send + Sync {
    fn resolve(&self, ip: &str) -> Result<String, GeoError>;
}

/// Queries an ip9-style HTTP endpoint: `<endpoint><ip>` answering
/// `{"ret":200,"data":{"country":..,"prov":..,"city":..,"area":..,"isp":..}}`.
pub struct HttpGeoResolver {
    client: reqwest::blocking::Client,
    endpoint: String,
}

impl HttpGeoResolver {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self, GeoError> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }
}

impl GeoResolver for HttpGeoResolver {
    fn resolve(&self, ip: &str) -> Result<String, GeoError> {
        let url = format!("{}{ip}", self.endpoint);
        let body = self.client.get(url).send()?.error_for_status()?.text()?;
        describe_payload(&body)
    }
}

#[derive(Deserialize)]
struct Payload {
    #[serde(default)]
    ret: i64,
    #[serde(default)]
    data: Option<Location>,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct Location {
    country: String,
    prov: String,
    city: String,
    area: String,
    isp: String,
}

/// Turn a lookup response into display text, e.g. `China Zhejiang Hangzhou | Telecom`.
pub fn describe_payload(body: &str) -> Result<String, GeoError> {
    let payload: Payload = serde_json::from_str(body)?;
    if payload.ret != 200 {
        return Err(GeoError::Status(payload.ret));
    }
    let loc = payload.data.ok_or(GeoError::Empty)?;

    // Each level is skipped when it just repeats the one above it.
    let mut parts: Vec<&str> = vec![];
    let levels = [&loc.country, &loc.prov, &loc.city, &loc.area];
    for (i, level) in levels.iter().enumerate() {
        let level = level.trim();
        if level.is_empty() || (i > 0 && level == levels[i - 1].trim()) {
            continue;
        }
        parts.push(level);
    }
    let mut text = parts.join(" ");
    let isp = loc.isp.trim();
    if !isp.is_empty() {
        if !text.is_empty() {
            text.push_str(" | ");
        }
        text.push_str(isp);
    }
    if text.is_empty() {
        return Err(GeoError::Empty);
    }
    Ok(text)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "location", rename_all = "snake_case")]
pub enum GeoLookup {
    Pending,
    Resolved(String),
    Failed,
}

pub struct GeoCache {
    resolver: Option<Arc<dyn GeoResolver>>,
    results: HashMap<String, GeoLookup>,
    results_send: flume::Sender<(String, GeoLookup)>,
    results_recv: flume::Receiver<(String, GeoLookup)>,
}

impl GeoCache {
    /// With no resolver every lookup fails immediately.
    pub fn new(resolver: Option<Arc<dyn GeoResolver>>) -> Self {
        let (results_send, results_recv) = flume::unbounded();
        Self {
            resolver,
            results: HashMap::new(),
            results_send,
            results_recv,
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    /// Cached result for `ip`, starting a background lookup on first sight.
    pub fn lookup(&mut self, ip: &str) -> GeoLookup {
        let Ok(address) = Address::parse(ip) else {
            return GeoLookup::Failed;
        };
        let ip = address.into_string();
        if let Some(known) = self.results.get(&ip) {
            return known.clone();
        }
        let Some(resolver) = self.resolver.clone() else {
            self.results.insert(ip, GeoLookup::Failed);
            return GeoLookup::Failed;
        };

        let send = self.results_send.clone();
        let thread_ip = ip.clone();
        let spawned = std::thread::Builder::new()
            .name("spdb-geo".to_string())
            .spawn(move || {
                let result = match resolver.resolve(&thread_ip) {
                    Ok(text) => GeoLookup::Resolved(text),
                    Err(e) => {
                        warn!(ip = thread_ip, error = %e, "Geolocation lookup failed");
                        GeoLookup::Failed
                    }
                };
                // The cache may be gone by the time we answer.
                let _ = send.send((thread_ip, result));
            });

        let state = match spawned {
            Ok(_) => GeoLookup::Pending,
            Err(e) => {
                warn!(error = %e, "Unable to start geolocation lookup");
                GeoLookup::Failed
            }
        };
        self.results.insert(ip, state.clone());
        state
    }

    /// Fold finished lookups into the cache. Returns how many arrived.
    pub fn drain(&mut self) -> usize {
        let mut arrived = 0;
        for (ip, result) in self.results_recv.try_iter() {
            debug!(ip, ?result, "Geolocation lookup finished");
            self.results.insert(ip, result);
            arrived += 1;
        }
        arrived
    }

    /// Look up `ip` and block up to `timeout` for the answer.
    pub fn lookup_blocking(&mut self, ip: &str, timeout: Duration) -> GeoLookup {
        let deadline = Instant::now() + timeout;
        let mut state = self.lookup(ip);
        while state == GeoLookup::Pending {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.results_recv.recv_timeout(remaining) {
                Ok((done_ip, result)) => {
                    self.results.insert(done_ip, result);
                    state = self.lookup(ip);
                }
                Err(_) => break,
            }
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedResolver {
        calls: AtomicUsize,
        answer: Option<String>,
    }

    impl GeoResolver for FixedResolver {
        fn resolve(&self, _ip: &str) -> Result<String, GeoError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.answer.clone().ok_or(GeoError::Empty)
        }
    }

    fn resolver(answer: Option<&str>) -> Arc<FixedResolver> {
        Arc::new(FixedResolver {
            calls: AtomicUsize::new(0),
            answer: answer.map(String::from),
        })
    }

    #[test]
    fn describe_joins_distinct_levels() {
        let body = r#"{"ret":200,"data":{"country":"China","prov":"Beijing","city":"Beijing","area":"","isp":"Unicom"}}"#;
        assert_eq!(describe_payload(body).unwrap(), "China Beijing | Unicom");

        let body = r#"{"ret":200,"data":{"isp":"Local"}}"#;
        assert_eq!(describe_payload(body).unwrap(), "Local");

        assert!(matches!(
            describe_payload(r#"{"ret":500}"#),
            Err(GeoError::Status(500))
        ));
        assert!(matches!(
            describe_payload(r#"{"ret":200,"data":{}}"#),
            Err(GeoError::Empty)
        ));
        assert!(matches!(
            describe_payload("<html>"),
            Err(GeoError::Payload(_))
        ));
    }

    #[test]
    fn lookup_resolves_in_background_once() {
        let r = resolver(Some("Somewhere | ISP"));
        let mut cache = GeoCache::new(Some(r.clone() as Arc<dyn GeoResolver>));
        assert_eq!(
            cache.lookup_blocking("10.0.0.1", Duration::from_secs(5)),
            GeoLookup::Resolved("Somewhere | ISP".into())
        );
        assert_eq!(
            cache.lookup("10.0.0.1"),
            GeoLookup::Resolved("Somewhere | ISP".into())
        );
        assert_eq!(r.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failures_are_cached_and_not_retried() {
        let r = resolver(None);
        let mut cache = GeoCache::new(Some(r.clone() as Arc<dyn GeoResolver>));
        assert_eq!(
            cache.lookup_blocking("10.0.0.2", Duration::from_secs(5)),
            GeoLookup::Failed
        );
        assert_eq!(cache.lookup("10.0.0.2"), GeoLookup::Failed);
        assert_eq!(r.calls.load(Ordering::SeqCst), 1);

        assert_eq!(cache.lookup("not an ip"), GeoLookup::Failed);
        assert_eq!(GeoCache::disabled().lookup("10.0.0.3"), GeoLookup::Failed);
    }

    #[test]
    fn pending_until_drained() {
        let r = resolver(Some("X"));
        let mut cache = GeoCache::new(Some(r as Arc<dyn GeoResolver>));
        assert_eq!(cache.lookup("10.0.0.4"), GeoLookup::Pending);
        let deadline = Instant::now() + Duration::from_secs(5);
        while cache.drain() == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(cache.lookup("10.0.0.4"), GeoLookup::Resolved("X".into()));
    }
}
