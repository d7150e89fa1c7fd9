/* httpctl (AGPL-3.0)

Copyright (C) 2025 - 404 Contributors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU Affero General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU Affero General Public License for more details.

You should have received a copy of the GNU Affero General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.

*/

use std::time::{Duration, Instant};

use dashmap::DashMap;
use http::{header::ALT_SVC, HeaderMap};

/// RFC 7838 default freshness when `ma` is absent.
const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 3600);

/// One `protocol="authority"; params` entry of an `Alt-Svc` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AltService {
    pub protocol: String,
    pub authority: String,
    pub params: Vec<(String, String)>,
}

impl AltService {
    fn max_age(&self) -> Duration {
        self.params
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case("ma"))
            .and_then(|(_, value)| value.trim_matches('"').parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_MAX_AGE)
    }

    /// Port of the alternative; only same-host alternatives (`":port"`) are usable.
    fn same_host_port(&self) -> Option<u16> {
        self.authority.strip_prefix(':')?.parse().ok()
    }

    fn is_h3(&self) -> bool {
        self.protocol == "h3"
    }
}

/// Parses one header value. `None` means `clear`.
pub fn parse_alt_svc(value: &str) -> Option<Vec<AltService>> {
    let value = value.trim();
    if value.eq_ignore_ascii_case("clear") {
        return None;
    }
    Some(value.split(',').filter_map(|raw| parse_service(raw.trim())).collect())
}

fn parse_service(entry: &str) -> Option<AltService> {
    if entry.is_empty() {
        return None;
    }
    let mut parts = entry.split(';');
    let (protocol, authority) = parts.next()?.trim().split_once('=')?;

    let params = parts
        .filter_map(|param| {
            let (key, value) = param.split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect();

    Some(AltService {
        protocol: protocol.trim().to_ascii_lowercase(),
        authority: authority.trim().trim_matches('"').to_string(),
        params,
    })
}

#[derive(Debug, Clone, Copy)]
struct H3Advert {
    port: u16,
    expires_at: Instant,
}

/// Remembers origins that advertised HTTP/3 so later requests can try QUIC first.
#[derive(Debug, Default)]
pub struct AltSvcCache {
    adverts: DashMap<String, H3Advert>,
}

impl AltSvcCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records (or clears) the h3 advertisement carried by an origin response.
    pub fn observe(&self, authority: &str, headers: &HeaderMap, now: Instant) {
        for value in headers.get_all(ALT_SVC) {
            let Ok(value) = value.to_str() else { continue };
            match parse_alt_svc(value) {
                None => {
                    self.adverts.remove(authority);
                }
                Some(services) => {
                    let advert = services.iter().filter(|svc| svc.is_h3()).find_map(|svc| {
                        Some(H3Advert {
                            port: svc.same_host_port()?,
                            expires_at: now + svc.max_age(),
                        })
                    });
                    if let Some(advert) = advert {
                        tracing::trace!(%authority, port = advert.port, "origin advertised h3");
                        self.adverts.insert(authority.to_string(), advert);
                    }
                }
            }
        }
    }

    /// Port to dial over QUIC, if a fresh h3 advertisement exists.
    pub fn h3_port(&self, authority: &str, now: Instant) -> Option<u16> {
        let advert = *self.adverts.get(authority)?;
        if now >= advert.expires_at {
            self.adverts.remove(authority);
            return None;
        }
        Some(advert.port)
    }

    /// Drops the advertisement after a failed QUIC dial so the next request uses TCP.
    pub fn forget(&self, authority: &str) {
        self.adverts.remove(authority);
    }
}
