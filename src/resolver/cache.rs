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

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant as StdInstant},
};

use parking_lot::{Mutex, RwLock};
use rand::{seq::SliceRandom, Rng};
use tokio::time::{sleep_until, timeout_at, Instant};

use crate::{
    cache::{Clock, Flights, SystemClock},
    config::ResolverConfig,
    utils::ResolutionError,
};

use super::{
    exchange::{Answer, DnsExchange, UdpExchange},
    janitor::Janitor,
};

const DNS_PORT: u16 = 53;
const RETRY_BACKOFF_MS: u64 = 50;

/// Cached answer for one hostname.
#[derive(Debug, Clone)]
pub struct ResolutionEntry {
    pub host: String,
    pub ips: Vec<Ipv4Addr>,
    /// Nameserver that produced the answer; `None` for pinned hosts.
    pub nameserver: Option<SocketAddr>,
    /// `None` never expires.
    pub expires_at: Option<StdInstant>,
}

impl ResolutionEntry {
    fn is_expired(&self, now: StdInstant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Hostname → IPv4 cache in front of live DNS queries.
///
/// Reads share the lock; a miss coalesces concurrent lookups for the same host into a
/// single query and stores the result with `expires_at = now + ttl`. Expired entries are
/// ignored by lookups and removed by the janitor (see [`ResolutionCache::start_janitor`]).
pub struct ResolutionCache {
    entries: RwLock<HashMap<String, ResolutionEntry>>,
    flights: Flights<Vec<Ipv4Addr>>,
    nameservers: Vec<SocketAddr>,
    ttl: Duration,
    timeout: Duration,
    attempts: usize,
    refresh_every: Option<Duration>,
    exchange: Arc<dyn DnsExchange>,
    clock: Arc<dyn Clock>,
    janitor: Mutex<Option<Janitor>>,
}

impl std::fmt::Debug for ResolutionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolutionCache")
            .field("entries", &self.entries.read().len())
            .field("nameservers", &self.nameservers)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl ResolutionCache {
    /// Builds a cache that queries over UDP and follows tokio's clock.
    pub fn from_config(cfg: &ResolverConfig) -> Self {
        Self::new(cfg, Arc::new(UdpExchange), Arc::new(SystemClock))
    }

    pub fn new(cfg: &ResolverConfig, exchange: Arc<dyn DnsExchange>, clock: Arc<dyn Clock>) -> Self {
        let nameservers = cfg
            .nameservers
            .iter()
            .filter_map(|raw| match parse_nameserver(raw) {
                Some(addr) => Some(addr),
                None => {
                    tracing::warn!(target: "dns", nameserver = %raw, "ignoring unparseable nameserver");
                    None
                }
            })
            .collect();

        let entries = cfg
            .hosts
            .iter()
            .map(|(host, ips)| {
                let host = normalize_host(host);
                let entry = ResolutionEntry {
                    host: host.clone(),
                    ips: ips.clone(),
                    nameserver: None,
                    expires_at: None,
                };
                (host, entry)
            })
            .collect();

        Self {
            entries: RwLock::new(entries),
            flights: Flights::new(),
            nameservers,
            ttl: cfg.ttl(),
            timeout: cfg.timeout(),
            attempts: cfg.attempts.max(1),
            refresh_every: cfg.refresh_interval(),
            exchange,
            clock,
            janitor: Mutex::new(None),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Snapshot of the entry for `host`, expired or not.
    pub fn entry(&self, host: &str) -> Option<ResolutionEntry> {
        self.entries.read().get(&normalize_host(host)).cloned()
    }

    /// Returns the IPv4 addresses for `host`.
    ///
    /// The query deadline is the earlier of `deadline` and now plus the resolver timeout.
    pub async fn lookup(
        &self,
        host: &str,
        deadline: Instant,
    ) -> Result<Vec<Ipv4Addr>, ResolutionError> {
        let host = normalize_host(host);
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Ok(vec![ip]);
        }
        if let Some(ips) = self.cached(&host) {
            tracing::trace!(target: "dns", %host, "dns cache hit");
            return Ok(ips);
        }

        let deadline = deadline.min(Instant::now() + self.timeout);
        self.flights
            .run(&host, || async {
                // A flight that finished while we queued on the lock already stored it.
                if let Some(ips) = self.cached(&host) {
                    return Ok::<_, ResolutionError>(ips);
                }
                let entry = self.resolve(&host, deadline).await?;
                let ips = entry.ips.clone();
                self.entries.write().insert(host.clone(), entry);
                Ok(ips)
            })
            .await
    }

    /// Removes every expired entry; returns how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before - entries.len();
        if removed > 0 {
            tracing::debug!(target: "dns", removed, remaining = entries.len(), "swept expired dns entries");
        }
        removed
    }

    /// Sweeps, then re-resolves every remaining host that came from DNS.
    pub async fn refresh(&self) {
        self.sweep_expired();
        let hosts: Vec<String> = self
            .entries
            .read()
            .values()
            .filter(|entry| entry.expires_at.is_some())
            .map(|entry| entry.host.clone())
            .collect();

        for host in hosts {
            let deadline = Instant::now() + self.timeout;
            match self.resolve(&host, deadline).await {
                Ok(entry) => {
                    self.entries.write().insert(host, entry);
                }
                Err(err) => {
                    tracing::debug!(target: "dns", %host, error = %err, "refresh kept previous answer");
                }
            }
        }
    }

    /// Spawns the background janitor. Calling it twice replaces the earlier task.
    pub fn start_janitor(self: &Arc<Self>) {
        let janitor = Janitor::spawn(Arc::downgrade(self), self.ttl / 2, self.refresh_every);
        if let Some(previous) = self.janitor.lock().replace(janitor) {
            previous.stop();
        }
    }

    /// Stops the janitor and waits for it to exit.
    pub async fn shutdown(&self) {
        let janitor = self.janitor.lock().take();
        if let Some(janitor) = janitor {
            janitor.join().await;
        }
    }

    fn cached(&self, host: &str) -> Option<Vec<Ipv4Addr>> {
        let now = self.clock.now();
        self.entries
            .read()
            .get(host)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.ips.clone())
    }

    async fn resolve(
        &self,
        host: &str,
        deadline: Instant,
    ) -> Result<ResolutionEntry, ResolutionError> {
        let mut tried: Vec<SocketAddr> = Vec::with_capacity(self.attempts);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let Some(nameserver) = self.pick_nameserver(&tried) else {
                return Err(ResolutionError::NoNameservers);
            };
            tried.push(nameserver);

            let err = match timeout_at(deadline, self.query(nameserver, host)).await {
                Err(_) => return Err(ResolutionError::Timeout(host.to_string())),
                Ok(Ok(ips)) => {
                    tracing::debug!(target: "dns", %host, %nameserver, ?ips, "resolved");
                    return Ok(ResolutionEntry {
                        host: host.to_string(),
                        ips,
                        nameserver: Some(nameserver),
                        expires_at: Some(self.clock.now() + self.ttl),
                    });
                }
                Ok(Err(err)) => err,
            };

            if !err.is_retryable() || attempt >= self.attempts {
                return Err(err);
            }

            let jitter = rand::thread_rng().gen_range(0..=RETRY_BACKOFF_MS);
            let backoff = Duration::from_millis(RETRY_BACKOFF_MS * attempt as u64 + jitter);
            tracing::warn!(target: "dns", %host, %nameserver, attempt, error = %err, "dns attempt failed; retrying");
            let wake = Instant::now() + backoff;
            if wake >= deadline {
                return Err(ResolutionError::Timeout(host.to_string()));
            }
            sleep_until(wake).await;
        }
    }

    async fn query(
        &self,
        nameserver: SocketAddr,
        host: &str,
    ) -> Result<Vec<Ipv4Addr>, ResolutionError> {
        let answers = self.exchange.query_a(nameserver, host).await?;
        if answers.is_empty() {
            return Err(ResolutionError::EmptyAnswer(host.to_string()));
        }

        let mut ips = Vec::new();
        for answer in answers {
            match answer {
                Answer::A(ip) => ips.push(ip),
                Answer::Cname(target) => {
                    ips.extend(self.exchange.lookup_native(&target).await);
                }
                Answer::Other => {}
            }
        }
        let mut seen = std::collections::HashSet::new();
        ips.retain(|ip| seen.insert(*ip));

        if ips.is_empty() {
            return Err(ResolutionError::EmptyResult(host.to_string()));
        }
        Ok(ips)
    }

    /// Random nameserver, preferring ones this lookup has not tried yet.
    fn pick_nameserver(&self, tried: &[SocketAddr]) -> Option<SocketAddr> {
        let mut rng = rand::thread_rng();
        let fresh: Vec<SocketAddr> = self
            .nameservers
            .iter()
            .copied()
            .filter(|ns| !tried.contains(ns))
            .collect();
        let pool = if fresh.is_empty() {
            &self.nameservers
        } else {
            &fresh
        };
        pool.choose(&mut rng).copied()
    }
}

fn normalize_host(host: &str) -> String {
    host.trim().trim_end_matches('.').to_ascii_lowercase()
}

fn parse_nameserver(raw: &str) -> Option<SocketAddr> {
    let raw = raw.trim();
    raw.parse::<SocketAddr>()
        .ok()
        .or_else(|| raw.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, DNS_PORT)))
}
