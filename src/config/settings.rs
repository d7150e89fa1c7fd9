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
    fs,
    net::Ipv4Addr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level configuration parsed from the httpctl TOML file.
///
/// Each nested struct captures one subsystem so changes stay local. Every section has
/// defaults, so an empty file yields a runnable proxy on loopback.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HttpCtlConfig {
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl HttpCtlConfig {
    /// Reads the config file, deserializes TOML, and resolves relative paths against the
    /// file's own directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let mut cfg = Self::from_toml(&raw)
            .with_context(|| format!("invalid httpctl config: {}", path.display()))?;

        let base_dir = path.parent();
        if let Some(caroot) = cfg.tls.caroot.as_mut() {
            Self::absolutize_dir(base_dir, caroot);
        }
        Self::absolutize_dir(base_dir, &mut cfg.executor.sitecopy.output_path);

        Ok(cfg)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    fn absolutize_dir(base_dir: Option<&Path>, target: &mut PathBuf) {
        if target.is_relative() {
            if let Some(dir) = base_dir {
                *target = dir.join(&*target);
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// Plain HTTP proxy listener (absolute-form requests).
    #[serde(default = "default_http_address")]
    pub http_address: String,
    /// TLS listener; accepts CONNECT tunnels or direct TLS.
    #[serde(default = "default_https_address")]
    pub https_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            http_address: default_http_address(),
            https_address: default_https_address(),
        }
    }
}

fn default_http_address() -> String {
    "127.0.0.1:8080".into()
}

fn default_https_address() -> String {
    "127.0.0.1:8443".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    /// Directory holding `rootCA.pem` and `rootCA-key.pem`; falls back to `$CAROOT` and
    /// then the per-user data directory.
    #[serde(default)]
    pub caroot: Option<PathBuf>,
    /// Maximum number of issued leaves kept in memory.
    #[serde(default = "default_leaf_cache_capacity")]
    pub leaf_cache_capacity: usize,
    /// Upper bound on a single leaf issuance.
    #[serde(default = "default_issuance_timeout_ms")]
    pub issuance_timeout_ms: u64,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            caroot: None,
            leaf_cache_capacity: default_leaf_cache_capacity(),
            issuance_timeout_ms: default_issuance_timeout_ms(),
        }
    }
}

fn default_leaf_cache_capacity() -> usize {
    crate::tls::leaf_cache::DEFAULT_LEAF_CAPACITY
}

fn default_issuance_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolverConfig {
    /// Nameserver IPs; one is picked at random per query.
    #[serde(default = "default_nameservers")]
    pub nameservers: Vec<String>,
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default = "default_resolver_timeout_secs")]
    pub timeout_secs: u64,
    /// Attempts per lookup, each against a different nameserver where possible.
    #[serde(default = "default_attempts")]
    pub attempts: usize,
    /// Re-resolve every cached host on this period; 0 disables.
    #[serde(default)]
    pub refresh_secs: u64,
    /// Pinned answers that never expire.
    #[serde(default)]
    pub hosts: HashMap<String, Vec<Ipv4Addr>>,
}

impl ResolverConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_secs > 0).then(|| Duration::from_secs(self.refresh_secs))
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            nameservers: default_nameservers(),
            ttl_secs: default_ttl_secs(),
            timeout_secs: default_resolver_timeout_secs(),
            attempts: default_attempts(),
            refresh_secs: 0,
            hosts: HashMap::new(),
        }
    }
}

fn default_nameservers() -> Vec<String> {
    vec!["8.8.8.8".into(), "1.1.1.1".into()]
}

fn default_ttl_secs() -> u64 {
    10 * 60
}

fn default_resolver_timeout_secs() -> u64 {
    7
}

fn default_attempts() -> usize {
    2
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Pick per request from Alt-Svc memory and the client's ALPN.
    #[default]
    Auto,
    H1,
    H2,
    H3,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub transport: TransportMode,
    /// Allows QUIC dials when an origin advertises h3.
    #[serde(default = "default_true")]
    pub http3: bool,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Deadline covering resolution, dial, and time to response headers.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            transport: TransportMode::Auto,
            http3: true,
            connect_timeout_secs: default_connect_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_idle_timeout_secs() -> u64 {
    7
}

fn default_request_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub example: ExampleExecutorConfig,
    #[serde(default)]
    pub sitecopy: SiteCopyExecutorConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExampleExecutorConfig {
    #[serde(default)]
    pub enable: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteCopyExecutorConfig {
    #[serde(default)]
    pub enable: bool,
    /// Hosts whose GET responses are mirrored to disk.
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default = "default_sitecopy_output")]
    pub output_path: PathBuf,
}

impl Default for SiteCopyExecutorConfig {
    fn default() -> Self {
        Self {
            enable: false,
            hosts: Vec::new(),
            output_path: default_sitecopy_output(),
        }
    }
}

fn default_sitecopy_output() -> PathBuf {
    PathBuf::from("sitecopy")
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelemetryConfig {
    /// Telemetry output: human-friendly stdout or structured JSON.
    #[serde(default)]
    pub mode: TelemetryMode,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TelemetryMode {
    /// Print structured, readable logs to stdout.
    #[default]
    Stdout,
    /// Emit JSON objects for ingestion systems.
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let cfg = HttpCtlConfig::from_toml("").expect("empty config parses");
        assert_eq!(cfg.listener.https_address, "127.0.0.1:8443");
        assert_eq!(cfg.tls.leaf_cache_capacity, 1024);
        assert_eq!(cfg.resolver.ttl(), Duration::from_secs(600));
        assert_eq!(cfg.resolver.timeout(), Duration::from_secs(7));
        assert_eq!(cfg.upstream.transport, TransportMode::Auto);
        assert_eq!(cfg.upstream.idle_timeout(), Duration::from_secs(7));
        assert!(cfg.resolver.refresh_interval().is_none());
    }

    #[test]
    fn sections_override_defaults() {
        let raw = r#"
            [resolver]
            nameservers = ["9.9.9.9"]
            ttl_secs = 30
            [resolver.hosts]
            "intranet.local" = ["10.0.0.7"]

            [upstream]
            transport = "h2"
            http3 = false

            [executor.sitecopy]
            enable = true
            hosts = ["example.com"]
        "#;
        let cfg = HttpCtlConfig::from_toml(raw).expect("config parses");
        assert_eq!(cfg.resolver.nameservers, vec!["9.9.9.9".to_string()]);
        assert_eq!(cfg.resolver.hosts["intranet.local"], vec![Ipv4Addr::new(10, 0, 0, 7)]);
        assert_eq!(cfg.upstream.transport, TransportMode::H2);
        assert!(!cfg.upstream.http3);
        assert!(cfg.executor.sitecopy.enable);
    }

    #[test]
    fn load_resolves_relative_paths_beside_the_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("httpctl.toml");
        fs::write(&path, "[tls]\ncaroot = \"ca\"\n").expect("write config");

        let cfg = HttpCtlConfig::load(&path).expect("config loads");
        assert_eq!(cfg.tls.caroot, Some(dir.path().join("ca")));
        assert_eq!(cfg.executor.sitecopy.output_path, dir.path().join("sitecopy"));
    }
}
