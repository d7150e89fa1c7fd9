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
    fs,
    net::IpAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use rand::Rng;
use rcgen::{
    Certificate, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::sign::CertifiedKey;
use rustls_pemfile::Item;

use crate::{
    cache::Generator,
    config::TlsConfig,
    utils::{CaError, IssuanceError},
};

use super::{
    keystream::KeyStream,
    leaf_cache::{CacheMetrics, LeafCertificateCache},
    signer::{parse_root_key, KeyAlgorithm, PrivateKey, RootKey, StreamKeyPair},
};

pub const ROOT_CERT_FILE: &str = "rootCA.pem";
pub const ROOT_KEY_FILE: &str = "rootCA-key.pem";
const CAROOT_DIR: &str = "foddler";
const LEAF_ORGANIZATION: &str = "Foddler MITM proxy Inc";
pub const FALLBACK_SNI: &str = "httpctl.local";

/// 1970-01-01 .. 2049-12-31, the window every leaf carries.
pub const LEAF_NOT_BEFORE: SystemTime = UNIX_EPOCH;
const LEAF_NOT_AFTER_SECS: u64 = 2_524_521_600;

pub fn leaf_not_after() -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(LEAF_NOT_AFTER_SECS)
}

/// Root certificate and key loaded from CAROOT. Immutable for the life of the process.
#[derive(Clone)]
pub struct RootCredential {
    cert_der: CertificateDer<'static>,
    key_der: Vec<u8>,
    key: RootKey,
    subject: String,
}

impl std::fmt::Debug for RootCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootCredential")
            .field("subject", &self.subject)
            .field("key", &self.key)
            .finish()
    }
}

impl RootCredential {
    /// Reads a PEM certificate and PKCS#8 PEM key, insisting on the exact block types.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self, CaError> {
        let cert_pem = fs::read(cert_path)?;
        let key_pem = fs::read(key_path)?;

        let cert_der = match first_pem_item(&cert_pem, cert_path)? {
            Item::X509Certificate(der) => der,
            _ => {
                return Err(CaError::ParseFailure(format!(
                    "{}: expected a CERTIFICATE block",
                    cert_path.display()
                )))
            }
        };
        let key_der = match first_pem_item(&key_pem, key_path)? {
            Item::Pkcs8Key(der) => der.secret_pkcs8_der().to_vec(),
            _ => {
                return Err(CaError::ParseFailure(format!(
                    "{}: expected a PRIVATE KEY block",
                    key_path.display()
                )))
            }
        };

        let (_, parsed) = x509_parser::parse_x509_certificate(&cert_der)
            .map_err(|err| CaError::ParseFailure(format!("invalid root certificate: {err}")))?;
        let subject = parsed.subject().to_string();
        let key = parse_root_key(&key_der)?;

        tracing::info!(%subject, ?key, "loaded root CA");
        Ok(Self {
            cert_der,
            key_der,
            key,
            subject,
        })
    }

    /// Loads `rootCA.pem` / `rootCA-key.pem` from `dir`.
    pub fn load_from_caroot(dir: &Path) -> Result<Self, CaError> {
        Self::load(&dir.join(ROOT_CERT_FILE), &dir.join(ROOT_KEY_FILE))
    }

    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Leaf algorithm this root issues, if it can issue at all.
    pub fn leaf_algorithm(&self) -> Option<KeyAlgorithm> {
        match &self.key {
            RootKey::Supported(key) => Some(key.algorithm()),
            RootKey::Unsupported(_) => None,
        }
    }
}

fn first_pem_item(pem: &[u8], path: &Path) -> Result<Item, CaError> {
    match rustls_pemfile::read_one(&mut &pem[..]) {
        Ok(Some(item)) => Ok(item),
        Ok(None) => Err(CaError::ParseFailure(format!(
            "{}: no PEM block found",
            path.display()
        ))),
        Err(err) => Err(CaError::ParseFailure(format!("{}: {err}", path.display()))),
    }
}

/// Resolves the CAROOT directory: explicit override, `$CAROOT`, then the per-user data dir.
pub fn caroot(configured: Option<&Path>) -> PathBuf {
    if let Some(dir) = configured {
        return dir.to_path_buf();
    }
    if let Some(env) = std::env::var_os("CAROOT").filter(|value| !value.is_empty()) {
        return PathBuf::from(env);
    }

    let base = if cfg!(windows) {
        std::env::var_os("LocalAppData").map(PathBuf::from)
    } else if let Some(xdg) = std::env::var_os("XDG_DATA_HOME").filter(|v| !v.is_empty()) {
        Some(PathBuf::from(xdg))
    } else if cfg!(target_os = "macos") {
        dirs::home_dir().map(|home| home.join("Library").join("Application Support"))
    } else {
        dirs::home_dir().map(|home| home.join(".local").join("share"))
    };

    base.unwrap_or_default().join(CAROOT_DIR)
}

/// A signed leaf plus everything needed to serve it.
#[derive(Clone)]
pub struct LeafCertificate {
    pub host: String,
    pub chain: Vec<CertificateDer<'static>>,
    pub key_der: Vec<u8>,
    pub algorithm: KeyAlgorithm,
    pub serial: u64,
    pub issued_at: SystemTime,
    pub not_before: SystemTime,
    pub not_after: SystemTime,
    pub certified: Arc<CertifiedKey>,
}

impl std::fmt::Debug for LeafCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafCertificate")
            .field("host", &self.host)
            .field("algorithm", &self.algorithm)
            .field("serial", &self.serial)
            .finish_non_exhaustive()
    }
}

/// Synthesizes and signs a leaf for `host` using a keystream salted with the host name.
///
/// Blocking: RSA key generation can take a noticeable slice of a second, so async callers
/// go through [`CertificateAuthority::get_certificate`], which runs this on the blocking pool.
pub fn issue_leaf(root: &RootCredential, host: &str) -> Result<LeafCertificate, IssuanceError> {
    let root_key = match &root.key {
        RootKey::Supported(key) => key.clone(),
        RootKey::Unsupported(kind) => return Err(IssuanceError::UnsupportedKeyType(kind.clone())),
    };
    let algorithm = root_key.algorithm();

    let mut stream = KeyStream::new(&root.key_der, host.as_bytes());
    let leaf_key = PrivateKey::generate(algorithm, &mut stream)?;
    let leaf_key_der = leaf_key.to_pkcs8_der()?;

    let signer_pair = StreamKeyPair::signing(root_key, stream)?.into_rcgen()?;
    let mut ca_params = CertificateParams::from_ca_cert_der(root.cert_der.as_ref(), signer_pair)
        .map_err(signing_error)?;
    ca_params.alg = algorithm.signature_algorithm();
    let signer = Certificate::from_params(ca_params).map_err(signing_error)?;

    let serial = rand::thread_rng().gen_range(1..=i64::MAX as u64);
    let mut params = CertificateParams::default();
    params.alg = algorithm.signature_algorithm();
    params.not_before = rcgen::date_time_ymd(1970, 1, 1);
    params.not_after = rcgen::date_time_ymd(2049, 12, 31);
    params.serial_number = Some(SerialNumber::from_slice(&serial.to_be_bytes()));
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, LEAF_ORGANIZATION);
    match host.parse::<IpAddr>() {
        Ok(ip) => params.subject_alt_names = vec![SanType::IpAddress(ip)],
        Err(_) => {
            dn.push(DnType::CommonName, host);
            params.subject_alt_names = vec![SanType::DnsName(host.to_string())];
        }
    }
    params.distinguished_name = dn;
    params.key_pair = Some(StreamKeyPair::public_only(leaf_key)?.into_rcgen()?);

    let leaf = Certificate::from_params(params).map_err(signing_error)?;
    let leaf_der = CertificateDer::from(leaf.serialize_der_with_signer(&signer).map_err(signing_error)?);

    let chain = vec![leaf_der, root.cert_der.clone()];
    let certified = build_certified_key(chain.clone(), &leaf_key_der)?;

    Ok(LeafCertificate {
        host: host.to_string(),
        chain,
        key_der: leaf_key_der,
        algorithm,
        serial,
        issued_at: SystemTime::now(),
        not_before: LEAF_NOT_BEFORE,
        not_after: leaf_not_after(),
        certified: Arc::new(certified),
    })
}

fn signing_error(err: rcgen::Error) -> IssuanceError {
    IssuanceError::SigningFailure(err.to_string())
}

/// Pairs a chain with its PKCS#8 key in the form rustls serves.
fn build_certified_key(
    chain: Vec<CertificateDer<'static>>,
    key_der: &[u8],
) -> Result<CertifiedKey, IssuanceError> {
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der.to_vec()));
    let signing_key = any_supported_type(&key)
        .map_err(|err| IssuanceError::SigningFailure(format!("rustls rejected leaf key: {err}")))?;
    Ok(CertifiedKey::new(chain, signing_key))
}

/// Issues leaves on cache misses; owns the root and the issuance budget.
#[derive(Debug, Clone)]
struct LeafIssuer {
    root: Arc<RootCredential>,
    budget: Duration,
}

#[async_trait]
impl Generator for LeafIssuer {
    type Value = Arc<LeafCertificate>;
    type Error = IssuanceError;

    async fn generate(&self, host: &str) -> Result<Self::Value, Self::Error> {
        let root = self.root.clone();
        let owned = host.to_string();
        let started = std::time::Instant::now();
        let job = tokio::task::spawn_blocking(move || issue_leaf(&root, &owned));

        let leaf = match tokio::time::timeout(self.budget, job).await {
            Ok(Ok(result)) => result?,
            Ok(Err(join)) => return Err(IssuanceError::SigningFailure(join.to_string())),
            Err(_) => {
                tracing::warn!(%host, budget_ms = self.budget.as_millis() as u64, "leaf issuance timed out");
                return Err(IssuanceError::Timeout {
                    host: host.to_string(),
                    budget_ms: self.budget.as_millis() as u64,
                });
            }
        };

        tracing::debug!(
            %host,
            algorithm = leaf.algorithm.label(),
            serial = leaf.serial,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "issued leaf certificate"
        );
        Ok(Arc::new(leaf))
    }
}

/// On-demand certificate authority for the TLS listener.
///
/// Holds the root credential and a [`LeafCertificateCache`]; every handshake asks
/// [`get_certificate`](Self::get_certificate) for the SNI it saw.
#[derive(Debug)]
pub struct CertificateAuthority {
    issuer: LeafIssuer,
    leaves: LeafCertificateCache<Arc<LeafCertificate>>,
}

impl CertificateAuthority {
    pub fn new(root: RootCredential, cfg: &TlsConfig) -> Self {
        Self {
            issuer: LeafIssuer {
                root: Arc::new(root),
                budget: Duration::from_millis(cfg.issuance_timeout_ms),
            },
            leaves: LeafCertificateCache::new(cfg.leaf_cache_capacity),
        }
    }

    /// Loads the root from the configured CAROOT. Startup fails if this fails.
    pub fn from_config(cfg: &TlsConfig) -> Result<Self, CaError> {
        let dir = caroot(cfg.caroot.as_deref());
        tracing::debug!(caroot = %dir.display(), "loading root CA");
        let root = RootCredential::load_from_caroot(&dir)?;
        Ok(Self::new(root, cfg))
    }

    /// Handshake hook: returns the (possibly cached) leaf for the client's SNI.
    pub async fn get_certificate(&self, sni: &str) -> Result<Arc<LeafCertificate>, IssuanceError> {
        let host = normalize_sni(sni);
        self.leaves.fetch(&host, &self.issuer).await
    }

    pub fn root(&self) -> &RootCredential {
        &self.issuer.root
    }

    pub fn cache_metrics(&self) -> CacheMetrics {
        self.leaves.metrics()
    }

    pub fn cached_leaves(&self) -> usize {
        self.leaves.len()
    }
}

/// Trims, drops any `:port`, lowercases, and substitutes the fallback for empty names.
pub fn normalize_sni(server_name: &str) -> String {
    let trimmed = server_name.trim();
    let host = strip_port(trimmed);
    if host.is_empty() {
        FALLBACK_SNI.to_string()
    } else {
        host.to_ascii_lowercase()
    }
}

fn strip_port(name: &str) -> &str {
    if let Some(rest) = name.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match name.rsplit_once(':') {
        // A second colon means a bare IPv6 literal, not host:port.
        Some((host, port)) if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => name,
    }
}
